//! Converts log entries into display fragments: depth-bounded argument
//! formatting, search/syntax highlighting, box and inline layouts, and the
//! maximum-depth detail view.

use chrono::{DateTime, SecondsFormat, Utc};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use serde_json::Value;

use crate::logdeck_core::{Level, LogEntry};
use crate::logdeck_filters::QueryMatcher;

/// Default nesting depth for the list view. Deliberately denser than a
/// general-purpose inspector: the list favors scan speed over completeness.
pub const DEFAULT_DEPTH: usize = 2;
/// The detail view always renders at this depth, independent of the list
/// setting.
pub const DETAIL_DEPTH: usize = 5;

/// Entry layout in the list pane.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplayMode {
    Box,
    Inline,
}

/// Pass/fail chip shown in an entry's box header.
#[derive(Clone, Debug, PartialEq)]
pub struct CheckChip {
    pub name: String,
    pub passed: bool,
}

/// Per-check row in the detail view.
#[derive(Clone, Debug)]
pub struct DetailCheckRow {
    pub name: String,
    pub passed: Option<bool>,
    pub eval_millis: Option<f64>,
    pub killed: bool,
}

/// Per-render decoration settings. Search highlighting and syntax
/// highlighting are mutually exclusive; an active matcher wins.
#[derive(Clone, Copy, Debug)]
pub struct RenderOptions<'a> {
    pub mode: DisplayMode,
    pub depth: usize,
    pub syntax_highlight: bool,
    pub matcher: Option<&'a QueryMatcher>,
}

impl Default for RenderOptions<'_> {
    fn default() -> Self {
        Self {
            mode: DisplayMode::Box,
            depth: DEFAULT_DEPTH,
            syntax_highlight: true,
            matcher: None,
        }
    }
}

pub fn level_color(level: Level) -> Color {
    match level {
        Level::Fatal => Color::LightRed,
        Level::Error => Color::Red,
        Level::Warn => Color::Yellow,
        Level::Success => Color::Green,
        Level::Info => Color::Cyan,
        Level::Log => Color::White,
        Level::Debug => Color::Blue,
        Level::Verbose => Color::Magenta,
        Level::Silly => Color::DarkGray,
    }
}

// ---------------------------------------------------------------------------
// Argument formatting
// ---------------------------------------------------------------------------

/// Renders the argument list to display text. Top-level strings print bare;
/// structured values expand to an indented bracketed form until `depth`,
/// where objects collapse to their key list and arrays to `[Array(n)]`.
pub fn format_args(args: &[Value], depth: usize) -> String {
    let mut parts = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            Value::String(text) => parts.push(text.clone()),
            other => {
                let mut out = String::new();
                format_value(other, 1, depth.max(1), 0, &mut out);
                parts.push(out);
            }
        }
    }
    parts.join(" ")
}

fn format_value(value: &Value, level: usize, max_depth: usize, indent: usize, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        Value::Number(num) => out.push_str(&num.to_string()),
        Value::String(text) => {
            out.push('"');
            out.push_str(text);
            out.push('"');
        }
        Value::Object(map) => {
            if map.is_empty() {
                out.push_str("{}");
                return;
            }
            if level >= max_depth {
                // Depth limit: collapse to the key list.
                out.push('{');
                let keys: Vec<&str> = map.keys().map(String::as_str).collect();
                out.push_str(&keys.join(", "));
                out.push('}');
                return;
            }
            out.push_str("{\n");
            let pad = "  ".repeat(indent + 1);
            for (idx, (key, item)) in map.iter().enumerate() {
                out.push_str(&pad);
                out.push_str(key);
                out.push_str(": ");
                format_value(item, level + 1, max_depth, indent + 1, out);
                if idx + 1 < map.len() {
                    out.push(',');
                }
                out.push('\n');
            }
            out.push_str(&"  ".repeat(indent));
            out.push('}');
        }
        Value::Array(items) => {
            if items.is_empty() {
                out.push_str("[]");
                return;
            }
            if level >= max_depth {
                out.push_str(&format!("[Array({})]", items.len()));
                return;
            }
            out.push_str("[\n");
            let pad = "  ".repeat(indent + 1);
            for (idx, item) in items.iter().enumerate() {
                out.push_str(&pad);
                format_value(item, level + 1, max_depth, indent + 1, out);
                if idx + 1 < items.len() {
                    out.push(',');
                }
                out.push('\n');
            }
            out.push_str(&"  ".repeat(indent));
            out.push(']');
        }
    }
}

// ---------------------------------------------------------------------------
// Text decoration
// ---------------------------------------------------------------------------

const HIGHLIGHT_STYLE: Style =
    Style::new().bg(Color::Yellow).fg(Color::Black).add_modifier(Modifier::BOLD);

fn decorate_line(text: &str, opts: &RenderOptions<'_>) -> Line<'static> {
    if let Some(matcher) = opts.matcher {
        return highlight_line(text, matcher);
    }
    if opts.syntax_highlight {
        return Line::from(syntax_spans(text));
    }
    Line::from(text.to_string())
}

fn highlight_line(text: &str, matcher: &QueryMatcher) -> Line<'static> {
    let ranges = matcher.find_ranges(text);
    if ranges.is_empty() {
        return Line::from(text.to_string());
    }
    let mut spans = Vec::new();
    let mut cursor = 0usize;
    for (start, end) in ranges {
        if start > cursor {
            spans.push(Span::raw(text[cursor..start].to_string()));
        }
        spans.push(Span::styled(text[start..end].to_string(), HIGHLIGHT_STYLE));
        cursor = end;
    }
    if cursor < text.len() {
        spans.push(Span::raw(text[cursor..].to_string()));
    }
    Line::from(spans)
}

/// Hand-rolled tokenizer for the formatted argument text: strings, numbers,
/// booleans, null, `key:` names and brackets each get their own style.
pub fn syntax_spans(text: &str) -> Vec<Span<'static>> {
    let string_style = Style::new().fg(Color::Green);
    let number_style = Style::new().fg(Color::Magenta);
    let keyword_style = Style::new().fg(Color::Cyan);
    let key_style = Style::new().fg(Color::Blue);
    let bracket_style = Style::new().fg(Color::DarkGray);

    let chars: Vec<char> = text.chars().collect();
    let mut spans = Vec::new();
    let mut plain = String::new();
    let mut idx = 0usize;

    let flush = |plain: &mut String, spans: &mut Vec<Span<'static>>| {
        if !plain.is_empty() {
            spans.push(Span::raw(std::mem::take(plain)));
        }
    };

    while idx < chars.len() {
        let ch = chars[idx];
        match ch {
            '"' => {
                let mut token = String::from('"');
                idx += 1;
                while idx < chars.len() {
                    let c = chars[idx];
                    token.push(c);
                    idx += 1;
                    if c == '"' {
                        break;
                    }
                }
                flush(&mut plain, &mut spans);
                spans.push(Span::styled(token, string_style));
            }
            '{' | '}' | '[' | ']' => {
                flush(&mut plain, &mut spans);
                spans.push(Span::styled(ch.to_string(), bracket_style));
                idx += 1;
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(idx + 1).is_some_and(char::is_ascii_digit)) =>
            {
                let mut token = String::new();
                if c == '-' {
                    token.push('-');
                    idx += 1;
                }
                while idx < chars.len()
                    && (chars[idx].is_ascii_digit() || chars[idx] == '.' || chars[idx] == 'e')
                {
                    token.push(chars[idx]);
                    idx += 1;
                }
                flush(&mut plain, &mut spans);
                spans.push(Span::styled(token, number_style));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut token = String::new();
                while idx < chars.len()
                    && (chars[idx].is_ascii_alphanumeric() || chars[idx] == '_')
                {
                    token.push(chars[idx]);
                    idx += 1;
                }
                let next_meaningful =
                    chars[idx..].iter().find(|c| !c.is_whitespace()).copied();
                flush(&mut plain, &mut spans);
                if matches!(token.as_str(), "true" | "false" | "null") {
                    spans.push(Span::styled(token, keyword_style));
                } else if next_meaningful == Some(':') {
                    spans.push(Span::styled(token, key_style));
                } else {
                    spans.push(Span::raw(token));
                }
            }
            other => {
                plain.push(other);
                idx += 1;
            }
        }
    }
    flush(&mut plain, &mut spans);
    spans
}

// ---------------------------------------------------------------------------
// Entry layouts
// ---------------------------------------------------------------------------

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%H:%M:%S%.3f").to_string()
}

/// Renders one entry as display lines in the requested layout.
pub fn render_entry(
    entry: &LogEntry,
    chips: &[CheckChip],
    opts: &RenderOptions<'_>,
) -> Vec<Line<'static>> {
    match opts.mode {
        DisplayMode::Box => render_box(entry, chips, opts),
        DisplayMode::Inline => vec![render_inline(entry, chips, opts)],
    }
}

fn header_spans(entry: &LogEntry, chips: &[CheckChip]) -> Vec<Span<'static>> {
    let badge_style = Style::new()
        .fg(Color::Black)
        .bg(level_color(entry.level))
        .add_modifier(Modifier::BOLD);
    let mut spans = vec![
        Span::raw(if entry.is_new { "▎" } else { " " }.to_string()),
        Span::styled(format!(" {} ", entry.level.label()), badge_style),
        Span::raw(" "),
        Span::styled(format_timestamp(entry.timestamp), Style::new().fg(Color::DarkGray)),
    ];
    if let Some(origin) = &entry.origin {
        spans.push(Span::raw(" "));
        spans.push(Span::styled(origin.clone(), Style::new().fg(Color::DarkGray)));
    }
    for chip in chips {
        let (mark, color) =
            if chip.passed { ("✓", Color::Green) } else { ("✗", Color::Red) };
        spans.push(Span::raw(" "));
        spans.push(Span::styled(
            format!("[{mark} {}]", chip.name),
            Style::new().fg(color),
        ));
    }
    spans
}

fn render_box(
    entry: &LogEntry,
    chips: &[CheckChip],
    opts: &RenderOptions<'_>,
) -> Vec<Line<'static>> {
    let mut lines = vec![Line::from(header_spans(entry, chips))];
    let body = format_args(&entry.args, opts.depth);
    for raw in body.lines() {
        let mut line = decorate_line(raw, opts);
        line.spans.insert(0, Span::raw("   "));
        lines.push(line);
    }
    lines
}

fn render_inline(
    entry: &LogEntry,
    chips: &[CheckChip],
    opts: &RenderOptions<'_>,
) -> Line<'static> {
    let body = format_args(&entry.args, opts.depth);
    let flattened: String = body
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    let mut spans = header_spans(entry, chips);
    spans.push(Span::raw(" "));
    spans.extend(decorate_line(&flattened, opts).spans);
    Line::from(spans)
}

// ---------------------------------------------------------------------------
// Detail view
// ---------------------------------------------------------------------------

/// Renders one entry at maximum depth, with the per-check readout beneath.
/// Independent of the list-wide depth setting.
pub fn render_detail(entry: &LogEntry, checks: &[DetailCheckRow]) -> Text<'static> {
    let mut lines = vec![Line::from(header_spans(entry, &[]))];

    if !entry.bound_data.is_empty() {
        lines.push(Line::from(Span::styled(
            "bound data:",
            Style::new().add_modifier(Modifier::BOLD),
        )));
        let bound = Value::Object(entry.bound_data.clone());
        let mut out = String::new();
        format_value(&bound, 1, DETAIL_DEPTH, 0, &mut out);
        for raw in out.lines() {
            lines.push(Line::from(vec![Span::raw("  "), Span::raw(raw.to_string())]));
        }
    }

    lines.push(Line::from(Span::styled(
        "arguments:",
        Style::new().add_modifier(Modifier::BOLD),
    )));
    let body = format_args(&entry.args, DETAIL_DEPTH);
    for raw in body.lines() {
        let mut spans = syntax_spans(raw);
        spans.insert(0, Span::raw("  "));
        lines.push(Line::from(spans));
    }

    if !checks.is_empty() {
        lines.push(Line::from(Span::styled(
            "checks:",
            Style::new().add_modifier(Modifier::BOLD),
        )));
        for row in checks {
            let (mark, color) = match (row.killed, row.passed) {
                (true, _) => ("☠", Color::Red),
                (false, Some(true)) => ("✓", Color::Green),
                (false, Some(false)) => ("✗", Color::Red),
                (false, None) => ("·", Color::DarkGray),
            };
            let timing = row
                .eval_millis
                .map(|millis| format!(" {millis:.2}ms"))
                .unwrap_or_default();
            lines.push(Line::from(vec![
                Span::raw("  "),
                Span::styled(mark.to_string(), Style::new().fg(color)),
                Span::raw(format!(" {}{timing}", row.name)),
                if row.killed {
                    Span::styled(" (killed)".to_string(), Style::new().fg(Color::Red))
                } else {
                    Span::raw(String::new())
                },
            ]));
        }
    }

    Text::from(lines)
}

/// Raw argument list for copy-to-clipboard.
pub fn clipboard_payload(entry: &LogEntry, pretty: bool) -> String {
    let args = Value::Array(entry.args.clone());
    let result = if pretty {
        serde_json::to_string_pretty(&args)
    } else {
        serde_json::to_string(&args)
    };
    result.unwrap_or_else(|_| "[]".to_string())
}

/// Recording export line: `<date> <LEVEL> (<origin>): <space-joined args>`.
pub fn format_record_line(entry: &LogEntry) -> String {
    let date = entry.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
    let origin = entry.origin.as_deref().unwrap_or("unknown");
    let args: Vec<String> =
        entry.args.iter().map(crate::logdeck_core::arg_to_plain_string).collect();
    format!("{date} {} ({origin}): {}", entry.level.label(), args.join(" "))
}
