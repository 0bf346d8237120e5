//! WebSocket transport: connects to the relay, feeds parsed log events to
//! the dashboard, and keeps the link alive with heartbeats and capped
//! exponential reconnect backoff.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::logdeck_core::{parse_frame, ping_frame, InboundFrame, LogEntry};

pub const RECONNECT_BASE: Duration = Duration::from_millis(1000);
pub const RECONNECT_CAP: Duration = Duration::from_millis(15_000);
const RECONNECT_FACTOR: f64 = 1.5;
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid relay url: {0}")]
    Url(#[from] url::ParseError),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected catalog shape")]
    CatalogShape,
}

/// Instructions from the dashboard to the transport task.
#[derive(Clone, Debug)]
pub enum TransportCommand {
    Connect,
    Disconnect,
    /// Breaker trip: drop the link and stay down until an explicit
    /// `Connect` arrives.
    ForceDisconnect { reason: String },
}

/// What the transport task reports back.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    Connected,
    Disconnected { forced: bool },
    Reconnecting { attempt: u32, delay: Duration },
    Entry(LogEntry),
    Pong { rtt_millis: f64 },
    BadFrame,
}

/// Delay before reconnect attempt `attempt` (zero-based). Grows by half
/// each try and saturates at the cap.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let millis = RECONNECT_BASE.as_millis() as f64 * RECONNECT_FACTOR.powi(attempt as i32);
    RECONNECT_CAP.min(Duration::from_millis(millis as u64))
}

/// Round trip derived from a pong echoing our send time.
pub fn rtt_millis(sent_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - sent_at).num_microseconds().unwrap_or(0).max(0) as f64 / 1000.0
}

/// Source-file catalog served by the relay next to the socket. Used to
/// seed the file filter picker.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FileCatalog {
    pub files: Vec<String>,
    pub base_path: Option<String>,
}

/// Accepts both catalog shapes: a bare array of paths, or an object with
/// `files` and an optional `basePath`.
pub fn parse_catalog(value: &Value) -> Result<FileCatalog, TransportError> {
    fn string_list(value: &Value) -> Option<Vec<String>> {
        value.as_array().map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
    }

    if let Some(files) = string_list(value) {
        return Ok(FileCatalog { files, base_path: None });
    }
    if let Some(object) = value.as_object() {
        let files = object
            .get("files")
            .and_then(string_list)
            .ok_or(TransportError::CatalogShape)?;
        let base_path = object
            .get("basePath")
            .and_then(Value::as_str)
            .map(str::to_string);
        return Ok(FileCatalog { files, base_path });
    }
    Err(TransportError::CatalogShape)
}

/// Fetches the catalog over plain HTTP from the relay's `/files` route.
pub async fn fetch_file_catalog(relay_url: &Url) -> Result<FileCatalog, TransportError> {
    let mut http_url = relay_url.clone();
    let scheme = match relay_url.scheme() {
        "wss" => "https",
        _ => "http",
    };
    let _ = http_url.set_scheme(scheme);
    http_url.set_path("/files");

    let value: Value = reqwest::get(http_url).await?.json().await?;
    parse_catalog(&value)
}

/// Spawns the transport task. Commands go in, events come out; the task
/// exits on shutdown broadcast or when the command channel closes.
pub fn spawn(
    relay_url: Url,
    autoconnect: bool,
    shutdown: broadcast::Receiver<()>,
) -> (mpsc::Sender<TransportCommand>, mpsc::Receiver<TransportEvent>) {
    let (command_tx, command_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel(1024);
    tokio::spawn(transport_loop(relay_url, autoconnect, command_rx, event_tx, shutdown));
    (command_tx, event_rx)
}

async fn transport_loop(
    relay_url: Url,
    autoconnect: bool,
    mut commands: mpsc::Receiver<TransportCommand>,
    events: mpsc::Sender<TransportEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut want_connected = autoconnect;
    let mut attempt: u32 = 0;

    loop {
        if !want_connected {
            tokio::select! {
                _ = shutdown.recv() => return,
                command = commands.recv() => match command {
                    Some(TransportCommand::Connect) => {
                        want_connected = true;
                        attempt = 0;
                    }
                    Some(_) => {}
                    None => return,
                },
            }
            continue;
        }

        let stream = tokio::select! {
            _ = shutdown.recv() => return,
            connected = connect_async(relay_url.as_str()) => connected,
        };
        let (ws, _) = match stream {
            Ok(pair) => pair,
            Err(err) => {
                let delay = reconnect_delay(attempt);
                warn!(attempt, ?delay, "relay connect failed: {err}");
                let _ = events
                    .send(TransportEvent::Reconnecting { attempt, delay })
                    .await;
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = tokio::time::sleep(delay) => {}
                    command = commands.recv() => match command {
                        Some(TransportCommand::Disconnect)
                        | Some(TransportCommand::ForceDisconnect { .. }) => {
                            want_connected = false;
                        }
                        Some(TransportCommand::Connect) => attempt = 0,
                        None => return,
                    },
                }
                continue;
            }
        };

        info!(url = %relay_url, "relay connected");
        attempt = 0;
        let _ = events.send(TransportEvent::Connected).await;

        let forced = run_session(ws, &mut commands, &events, &mut shutdown).await;
        match forced {
            SessionEnd::Shutdown => return,
            SessionEnd::CommandChannelClosed => return,
            SessionEnd::Forced => {
                want_connected = false;
                let _ = events.send(TransportEvent::Disconnected { forced: true }).await;
            }
            SessionEnd::UserDisconnect => {
                want_connected = false;
                let _ = events.send(TransportEvent::Disconnected { forced: false }).await;
            }
            SessionEnd::Dropped => {
                let _ = events.send(TransportEvent::Disconnected { forced: false }).await;
            }
        }
    }
}

enum SessionEnd {
    Dropped,
    UserDisconnect,
    Forced,
    Shutdown,
    CommandChannelClosed,
}

async fn run_session(
    mut ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    commands: &mut mpsc::Receiver<TransportCommand>,
    events: &mpsc::Sender<TransportEvent>,
    shutdown: &mut broadcast::Receiver<()>,
) -> SessionEnd {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_PERIOD);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                let _ = ws.close(None).await;
                return SessionEnd::Shutdown;
            }
            command = commands.recv() => match command {
                Some(TransportCommand::Disconnect) => {
                    let _ = ws.close(None).await;
                    return SessionEnd::UserDisconnect;
                }
                Some(TransportCommand::ForceDisconnect { reason }) => {
                    warn!("forced disconnect: {reason}");
                    let _ = ws.close(None).await;
                    return SessionEnd::Forced;
                }
                Some(TransportCommand::Connect) => {}
                None => {
                    let _ = ws.close(None).await;
                    return SessionEnd::CommandChannelClosed;
                }
            },
            _ = heartbeat.tick() => {
                let ping = ping_frame(Utc::now());
                if ws.send(Message::Text(ping)).await.is_err() {
                    return SessionEnd::Dropped;
                }
            }
            message = ws.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    handle_text_frame(&text, events).await;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    return SessionEnd::Dropped;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}

/// One inbound text frame. Malformed frames are dropped with a warning,
/// never fatal to the session.
async fn handle_text_frame(text: &str, events: &mpsc::Sender<TransportEvent>) {
    match parse_frame(text) {
        Ok(InboundFrame::Log(event)) => match event.into_entry(Utc::now()) {
            Ok(entry) => {
                let _ = events.send(TransportEvent::Entry(entry)).await;
            }
            Err(err) => {
                warn!("dropping frame: {err}");
                let _ = events.send(TransportEvent::BadFrame).await;
            }
        },
        Ok(InboundFrame::Pong(pong)) => {
            let rtt = rtt_millis(pong.timestamp, Utc::now());
            debug!(rtt_millis = rtt, "heartbeat pong");
            let _ = events.send(TransportEvent::Pong { rtt_millis: rtt }).await;
        }
        Err(err) => {
            warn!("dropping frame: {err}");
            let _ = events.send(TransportEvent::BadFrame).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case(0, 1000)]
    #[case(1, 1500)]
    #[case(2, 2250)]
    #[case(3, 3375)]
    #[case(7, 15_000)]
    #[case(30, 15_000)]
    fn backoff_grows_by_half_and_caps(#[case] attempt: u32, #[case] millis: u64) {
        assert_eq!(reconnect_delay(attempt), Duration::from_millis(millis));
    }

    #[test]
    fn rtt_is_the_echo_delta_in_millis() {
        let sent = Utc::now();
        let now = sent + chrono::Duration::milliseconds(42);
        assert!((rtt_millis(sent, now) - 42.0).abs() < 0.001);
    }

    #[test]
    fn rtt_never_goes_negative_on_clock_skew() {
        let sent = Utc::now();
        let earlier = sent - chrono::Duration::seconds(5);
        assert_eq!(rtt_millis(sent, earlier), 0.0);
    }

    #[test]
    fn catalog_accepts_a_bare_array() {
        let value = json!(["src/a.js", "src/b.js"]);
        let catalog = parse_catalog(&value).expect("catalog");
        assert_eq!(catalog.files, vec!["src/a.js", "src/b.js"]);
        assert_eq!(catalog.base_path, None);
    }

    #[test]
    fn catalog_accepts_the_object_shape() {
        let value = json!({"files": ["a.js"], "basePath": "/srv/app"});
        let catalog = parse_catalog(&value).expect("catalog");
        assert_eq!(catalog.files, vec!["a.js"]);
        assert_eq!(catalog.base_path.as_deref(), Some("/srv/app"));
    }

    #[rstest]
    #[case(json!(42))]
    #[case(json!({"paths": []}))]
    fn catalog_rejects_other_shapes(#[case] value: Value) {
        assert!(parse_catalog(&value).is_err());
    }
}
