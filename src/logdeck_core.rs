//! Core domain types for logdeck: severity levels, log entries and wire frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Wire prefix carried by every log frame's `type` field.
pub const LOG_TYPE_PREFIX: &str = "log-";

/// One of nine ordered severities, ascending verbosity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Fatal,
    Error,
    Warn,
    Success,
    Info,
    Log,
    Debug,
    Verbose,
    Silly,
}

impl Level {
    pub const ALL: [Level; 9] = [
        Level::Fatal,
        Level::Error,
        Level::Warn,
        Level::Success,
        Level::Info,
        Level::Log,
        Level::Debug,
        Level::Verbose,
        Level::Silly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Fatal => "fatal",
            Level::Error => "error",
            Level::Warn => "warn",
            Level::Success => "success",
            Level::Info => "info",
            Level::Log => "log",
            Level::Debug => "debug",
            Level::Verbose => "verbose",
            Level::Silly => "silly",
        }
    }

    /// Uppercase label used by recording export lines.
    pub fn label(&self) -> &'static str {
        match self {
            Level::Fatal => "FATAL",
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Success => "SUCCESS",
            Level::Info => "INFO",
            Level::Log => "LOG",
            Level::Debug => "DEBUG",
            Level::Verbose => "VERBOSE",
            Level::Silly => "SILLY",
        }
    }

    pub fn parse(name: &str) -> Option<Level> {
        Level::ALL.into_iter().find(|level| level.as_str() == name)
    }

    /// Parses the wire `type` field, e.g. `log-error` -> `Level::Error`.
    pub fn from_wire_type(wire: &str) -> Option<Level> {
        wire.strip_prefix(LOG_TYPE_PREFIX).and_then(Level::parse)
    }
}

/// Call-site locator parsed from an entry's `<file>:<line>` string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Origin {
    pub file: String,
    pub line: u32,
}

impl Origin {
    /// Splits on the last colon so drive letters and scoped paths survive.
    pub fn parse(raw: &str) -> Option<Origin> {
        let (file, line) = raw.rsplit_once(':')?;
        let line: u32 = line.trim().parse().ok()?;
        if file.is_empty() || line == 0 {
            return None;
        }
        Some(Origin { file: file.to_string(), line })
    }
}

/// One received log event. Immutable after ingestion except `is_new`,
/// which only drives the one-shot appearance animation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    pub level: Level,
    pub timestamp: DateTime<Utc>,
    pub origin: Option<String>,
    pub args: Vec<Value>,
    #[serde(default)]
    pub bound_data: Map<String, Value>,
    #[serde(skip)]
    pub is_new: bool,
}

impl LogEntry {
    pub fn origin_parts(&self) -> Option<Origin> {
        self.origin.as_deref().and_then(Origin::parse)
    }
}

/// Inbound log frame as transmitted by the relay.
#[derive(Clone, Debug, Deserialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default, rename = "callLine", alias = "call_line")]
    pub call_line: Option<String>,
    #[serde(default, rename = "argList", alias = "args")]
    pub arg_list: Vec<Value>,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(default, rename = "boundDatas", alias = "boundData")]
    pub bound_datas: Option<Map<String, Value>>,
}

impl WireEvent {
    /// Builds a store-ready entry. `id` is assigned later by the store;
    /// an absent wire date defaults to receipt time.
    pub fn into_entry(self, received_at: DateTime<Utc>) -> Result<LogEntry, FrameError> {
        let level = Level::from_wire_type(&self.r#type)
            .ok_or_else(|| FrameError::UnknownLevel(self.r#type.clone()))?;
        Ok(LogEntry {
            id: 0,
            level,
            timestamp: self.date.unwrap_or(received_at),
            origin: self.call_line,
            args: self.arg_list,
            bound_data: self.bound_datas.unwrap_or_default(),
            is_new: true,
        })
    }
}

/// Inbound heartbeat reply. `timestamp` echoes the original ping send time.
#[derive(Clone, Debug, Deserialize)]
pub struct PongFrame {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub server: Option<DateTime<Utc>>,
}

/// A parsed inbound frame.
#[derive(Clone, Debug)]
pub enum InboundFrame {
    Log(WireEvent),
    Pong(PongFrame),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("missing frame type")]
    MissingType,
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    #[error("unknown level in frame type: {0}")]
    UnknownLevel(String),
}

/// Parses one inbound text frame. Unknown types are a transport fault and
/// reported so the caller can drop the frame without closing the socket.
pub fn parse_frame(text: &str) -> Result<InboundFrame, FrameError> {
    let value: Value = serde_json::from_str(text)?;
    let frame_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?;

    if frame_type == "pong" {
        let pong: PongFrame = serde_json::from_value(value)?;
        return Ok(InboundFrame::Pong(pong));
    }
    if frame_type.starts_with(LOG_TYPE_PREFIX) {
        let event: WireEvent = serde_json::from_value(value)?;
        return Ok(InboundFrame::Log(event));
    }
    Err(FrameError::UnknownType(frame_type.to_string()))
}

/// Serializes an outbound heartbeat ping carrying the local send time.
pub fn ping_frame(sent_at: DateTime<Utc>) -> String {
    serde_json::json!({
        "type": "ping",
        "timestamp": sent_at.to_rfc3339(),
    })
    .to_string()
}

/// Stringifies a single raw argument the way the export format wants it:
/// strings bare, everything else as compact JSON.
pub fn arg_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn levels_are_ordered_by_verbosity() {
        assert!(Level::Fatal < Level::Error);
        assert!(Level::Verbose < Level::Silly);
        assert_eq!(Level::ALL.len(), 9);
    }

    #[rstest]
    #[case("log-fatal", Some(Level::Fatal))]
    #[case("log-silly", Some(Level::Silly))]
    #[case("log-nope", None)]
    #[case("ping", None)]
    fn wire_type_parses_to_level(#[case] wire: &str, #[case] expected: Option<Level>) {
        assert_eq!(Level::from_wire_type(wire), expected);
    }

    #[rstest]
    #[case("src/app.js:42", Some(("src/app.js", 42)))]
    #[case("C:\\proj\\main.ts:7", Some(("C:\\proj\\main.ts", 7)))]
    #[case("no-line", None)]
    #[case(":12", None)]
    #[case("file.js:zero", None)]
    fn origin_splits_on_last_colon(#[case] raw: &str, #[case] expected: Option<(&str, u32)>) {
        let parsed = Origin::parse(raw);
        match expected {
            Some((file, line)) => {
                let origin = parsed.expect("origin");
                assert_eq!(origin.file, file);
                assert_eq!(origin.line, line);
            }
            None => assert!(parsed.is_none()),
        }
    }

    #[test]
    fn wire_event_defaults_date_to_receipt_time() {
        let received = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let frame = r#"{"type":"log-info","argList":["hello",1]}"#;
        let InboundFrame::Log(event) = parse_frame(frame).expect("frame") else {
            panic!("expected log frame");
        };
        let entry = event.into_entry(received).expect("entry");
        assert_eq!(entry.level, Level::Info);
        assert_eq!(entry.timestamp, received);
        assert_eq!(entry.args, vec![json!("hello"), json!(1)]);
        assert!(entry.bound_data.is_empty());
        assert!(entry.is_new);
    }

    #[test]
    fn wire_event_keeps_explicit_date_and_bound_data() {
        let frame = r#"{
            "type": "log-warn",
            "callLine": "lib/db.js:88",
            "argList": ["slow query"],
            "date": "2024-05-01T08:30:00Z",
            "boundDatas": {"requestId": "abc"}
        }"#;
        let InboundFrame::Log(event) = parse_frame(frame).expect("frame") else {
            panic!("expected log frame");
        };
        let entry = event.into_entry(Utc::now()).expect("entry");
        assert_eq!(entry.timestamp, Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap());
        assert_eq!(entry.origin.as_deref(), Some("lib/db.js:88"));
        assert_eq!(entry.bound_data.get("requestId"), Some(&json!("abc")));
    }

    #[test]
    fn pong_frame_echoes_timestamp() {
        let frame = r#"{"type":"pong","timestamp":"2024-05-01T00:00:01Z","server":"2024-05-01T00:00:02Z"}"#;
        let InboundFrame::Pong(pong) = parse_frame(frame).expect("frame") else {
            panic!("expected pong");
        };
        assert_eq!(pong.timestamp, Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 1).unwrap());
        assert!(pong.server.is_some());
    }

    #[rstest]
    #[case(r#"{not json"#)]
    #[case(r#"{"no":"type"}"#)]
    #[case(r#"{"type":"mystery"}"#)]
    fn malformed_frames_are_rejected(#[case] frame: &str) {
        assert!(parse_frame(frame).is_err());
    }

    #[test]
    fn ping_frame_carries_send_time() {
        let sent = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let frame = ping_frame(sent);
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "ping");
        assert_eq!(value["timestamp"], "2024-05-01T00:00:00+00:00");
    }

    #[rstest]
    #[case(json!("plain"), "plain")]
    #[case(json!(12), "12")]
    #[case(json!({"a":1}), r#"{"a":1}"#)]
    fn arg_plain_string_keeps_strings_bare(#[case] value: Value, #[case] expected: &str) {
        assert_eq!(arg_to_plain_string(&value), expected);
    }
}
