//! Dashboard controller and ratatui interface: owns the store, checks,
//! filters and telemetry, applies transport events, and turns the whole
//! state into frames.

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap};
use ratatui::Frame;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::logdeck_checks::{CheckRegistry, ResultCache, StoredCheck};
use crate::logdeck_core::{Level, LogEntry};
use crate::logdeck_filters::{FilterPipeline, FilterState};
use crate::logdeck_perf::PerfMonitor;
use crate::logdeck_render::{
    self, level_color, CheckChip, DetailCheckRow, DisplayMode, RenderOptions, DEFAULT_DEPTH,
};
use crate::logdeck_store::{LogStore, CAPACITY_PRESETS, DEFAULT_CAPACITY};
use crate::logdeck_transport::{FileCatalog, TransportEvent};

/// Search keystrokes settle for this long before the filter recomputes.
pub const SEARCH_DEBOUNCE: Duration = Duration::from_millis(500);
/// Aggregate check time spent on a single entry that trips the breaker.
pub const BREAKER_MILLIS: f64 = 1000.0;

/// Key handling modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    Search,
    CheckEditor,
    Picker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickerKind {
    Levels,
    Capacity,
    Files,
    Checks,
}

/// Input buffer with a cursor.
#[derive(Debug, Clone, Default)]
pub struct InputState {
    pub buffer: String,
    pub cursor: usize,
}

impl InputState {
    pub fn from_str(value: &str) -> Self {
        Self { buffer: value.to_string(), cursor: value.len() }
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.cursor = 0;
    }

    pub fn insert_char(&mut self, ch: char) {
        if self.cursor >= self.buffer.len() {
            self.buffer.push(ch);
        } else {
            self.buffer.insert(self.cursor, ch);
        }
        self.cursor += ch.len_utf8();
    }

    pub fn backspace(&mut self) {
        if self.cursor == 0 || self.buffer.is_empty() {
            return;
        }
        let prev = self.buffer[..self.cursor]
            .char_indices()
            .last()
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        self.buffer.remove(prev);
        self.cursor = prev;
    }
}

#[derive(Debug, Clone)]
pub struct CheckEditorState {
    pub check_id: Option<u64>,
    pub name: InputState,
    pub source: InputState,
    pub editing_source: bool,
    pub error: Option<String>,
}

impl CheckEditorState {
    fn blank() -> Self {
        Self {
            check_id: None,
            name: InputState::default(),
            source: InputState::default(),
            editing_source: false,
            error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PickerState {
    pub kind: PickerKind,
    pub selected: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration, since: Instant },
    Connected,
}

/// Clipboard abstraction for copy support.
pub trait Clipboard: Send {
    fn set(&mut self, contents: &str) -> Result<(), TuiError>;
}

/// System clipboard using arboard.
#[derive(Default)]
pub struct SystemClipboard {
    inner: Option<arboard::Clipboard>,
}

impl Clipboard for SystemClipboard {
    fn set(&mut self, contents: &str) -> Result<(), TuiError> {
        if self.inner.is_none() {
            self.inner = Some(arboard::Clipboard::new().map_err(TuiError::Clipboard)?);
        }
        let clipboard = self.inner.as_mut().expect("clipboard just initialized");
        clipboard.set_text(contents.to_string()).map_err(TuiError::Clipboard)
    }
}

/// Actions requiring external side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    None,
    Quit,
    Connect,
    Disconnect,
}

#[derive(Debug, Error)]
pub enum TuiError {
    #[error("clipboard error: {0}")]
    Clipboard(#[from] arboard::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of ingesting one entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOutcome {
    pub displayed: bool,
    /// Checks burned through the aggregate budget on this entry; the
    /// caller must force the transport down.
    pub breaker_tripped: bool,
}

/// Capture of every received entry while armed; the export is written
/// sorted by producer timestamp.
#[derive(Debug)]
struct Recording {
    started_at: DateTime<Utc>,
    lines: Vec<(DateTime<Utc>, String)>,
}

/// Settings surviving restarts, written next to the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub capacity: Option<usize>,
    #[serde(default)]
    pub inline: bool,
    #[serde(default)]
    pub depth: Option<usize>,
    #[serde(default)]
    pub syntax_highlight: Option<bool>,
    #[serde(default)]
    pub query_is_regex: bool,
    #[serde(default)]
    pub checks: Vec<StoredCheck>,
    #[serde(default)]
    pub levels: Option<Vec<Level>>,
}

#[derive(Debug, Clone)]
pub struct DashboardConfig {
    pub capacity: usize,
    pub inline: bool,
    pub depth: usize,
    pub syntax_highlight: bool,
    pub records_dir: PathBuf,
    pub breaker_millis: f64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            inline: false,
            depth: DEFAULT_DEPTH,
            syntax_highlight: true,
            records_dir: PathBuf::from("."),
            breaker_millis: BREAKER_MILLIS,
        }
    }
}

/// Main dashboard container.
pub struct Dashboard {
    store: LogStore,
    registry: CheckRegistry,
    cache: ResultCache,
    pipeline: FilterPipeline,
    perf: PerfMonitor,

    display: Vec<u64>,
    selected: usize,
    auto_scroll: bool,
    missed_while_scrolled: usize,

    paused: bool,
    pending: VecDeque<LogEntry>,

    mode: Mode,
    search_draft: InputState,
    search_settled_at: Option<Instant>,
    editor: Option<CheckEditorState>,
    picker: Option<PickerState>,
    status: Option<String>,

    connection: ConnectionStatus,
    dropped_frames: u64,
    recording: Option<Recording>,
    catalog: FileCatalog,

    display_mode: DisplayMode,
    depth: usize,
    syntax_highlight: bool,
    records_dir: PathBuf,
    breaker_millis: f64,
    clipboard: Box<dyn Clipboard>,

    list_state: ListState,
}

impl Dashboard {
    pub fn new(config: DashboardConfig) -> Self {
        Self::with_clipboard(config, Box::new(SystemClipboard::default()))
    }

    pub fn with_clipboard(config: DashboardConfig, clipboard: Box<dyn Clipboard>) -> Self {
        Self {
            store: LogStore::new(config.capacity),
            registry: CheckRegistry::default(),
            cache: ResultCache::default(),
            pipeline: FilterPipeline::new(Default::default()),
            perf: PerfMonitor::new(),
            display: Vec::new(),
            selected: 0,
            auto_scroll: true,
            missed_while_scrolled: 0,
            paused: false,
            pending: VecDeque::new(),
            mode: Mode::Normal,
            search_draft: InputState::default(),
            search_settled_at: None,
            editor: None,
            picker: None,
            status: None,
            connection: ConnectionStatus::Disconnected,
            dropped_frames: 0,
            recording: None,
            catalog: FileCatalog::default(),
            display_mode: if config.inline { DisplayMode::Inline } else { DisplayMode::Box },
            depth: config.depth.clamp(1, 5),
            syntax_highlight: config.syntax_highlight,
            records_dir: config.records_dir,
            breaker_millis: config.breaker_millis,
            clipboard,
            list_state: ListState::default(),
        }
    }

    pub fn store(&self) -> &LogStore {
        &self.store
    }

    pub fn registry_mut(&mut self) -> &mut CheckRegistry {
        &mut self.registry
    }

    pub fn display_ids(&self) -> &[u64] {
        &self.display
    }

    /// Direct access to the filter dimensions. Callers mutate and then
    /// call `rebuild_display`.
    pub fn pipeline_state_mut(&mut self) -> &mut FilterState {
        &mut self.pipeline.state
    }

    pub fn connection(&self) -> &ConnectionStatus {
        &self.connection
    }

    pub fn status_message(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    pub fn missed_while_scrolled(&self) -> usize {
        self.missed_while_scrolled
    }

    pub fn set_catalog(&mut self, catalog: FileCatalog) {
        self.catalog = catalog;
    }

    // -- ingestion ----------------------------------------------------------

    /// Applies one transport event. Returns true when the check breaker
    /// tripped and the caller must force the link down.
    pub fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) -> bool {
        match event {
            TransportEvent::Connected => {
                self.connection = ConnectionStatus::Connected;
                self.status = Some("connected".to_string());
                false
            }
            TransportEvent::Disconnected { forced } => {
                self.connection = ConnectionStatus::Disconnected;
                self.perf.clear_rtt();
                if forced {
                    self.status =
                        Some("disconnected: checks exceeded the time budget".to_string());
                }
                false
            }
            TransportEvent::Reconnecting { attempt, delay } => {
                self.connection = ConnectionStatus::Reconnecting { attempt, delay, since: now };
                false
            }
            TransportEvent::Pong { rtt_millis } => {
                self.perf.record_rtt(rtt_millis);
                false
            }
            TransportEvent::BadFrame => {
                self.dropped_frames += 1;
                false
            }
            TransportEvent::Entry(entry) => {
                // Recording captures the raw stream at receipt, before any
                // filtering or pause queueing.
                if let Some(recording) = &mut self.recording {
                    recording
                        .lines
                        .push((entry.timestamp, logdeck_render::format_record_line(&entry)));
                }
                self.push_entry(entry, now).breaker_tripped
            }
        }
    }

    /// Ingests one entry: assign an id, cascade evictions, run checks,
    /// filter, and update scroll state. Paused dashboards queue instead.
    pub fn push_entry(&mut self, entry: LogEntry, now: Instant) -> PushOutcome {
        if self.paused {
            self.pending.push_back(entry);
            while self.pending.len() > self.store.capacity() {
                self.pending.pop_front();
            }
            return PushOutcome::default();
        }

        self.perf.record_ingest(now);
        let (id, evicted) = self.store.append(entry);
        self.forget_entries(&evicted);

        let (check_millis, breaker_tripped) = self.run_checks_for(id);
        self.perf.record_check_eval(now, check_millis);

        let displayed = self.admit_to_display(id, now);
        PushOutcome { displayed, breaker_tripped }
    }

    fn forget_entries(&mut self, evicted: &[u64]) {
        for id in evicted {
            self.cache.purge_entry(*id);
        }
        if evicted.is_empty() {
            return;
        }
        let before = self.display.len();
        self.display.retain(|id| !evicted.contains(id));
        let removed = before - self.display.len();
        self.selected = self.selected.saturating_sub(removed);
        self.clamp_selected();
    }

    fn run_checks_for(&mut self, id: u64) -> (f64, bool) {
        let Some(entry) = self.store.get(id).cloned() else {
            return (0.0, false);
        };
        let mut total = 0.0;
        for check_id in self.registry.enabled_ids() {
            let outcome = self.registry.run_check(check_id, &entry, &mut self.cache);
            total += outcome.eval_millis;
        }
        let tripped = total > self.breaker_millis;
        if tripped {
            self.status = Some(format!(
                "checks spent {total:.0}ms on one entry, disconnecting"
            ));
        }
        (total, tripped)
    }

    fn admit_to_display(&mut self, id: u64, now: Instant) -> bool {
        let Some(entry) = self.store.get(id).cloned() else {
            return false;
        };
        let search_text = search_text(&entry);
        if !self.pipeline.should_display(&entry, &search_text, &mut self.registry, &mut self.cache)
        {
            return false;
        }
        self.display.push(id);
        self.perf.record_display(now);
        if self.auto_scroll {
            self.selected = self.display.len() - 1;
        } else {
            self.missed_while_scrolled += 1;
        }
        true
    }

    /// Recomputes the visible set from scratch. Used whenever a filter
    /// dimension, check set or capacity changes.
    pub fn rebuild_display(&mut self) {
        self.store.clear_new_flags();
        let ids = self.store.ids();
        let mut display = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(entry) = self.store.get(id).cloned() else { continue };
            let text = search_text(&entry);
            if self.pipeline.should_display(&entry, &text, &mut self.registry, &mut self.cache) {
                display.push(id);
            }
        }
        self.display = display;
        self.missed_while_scrolled = 0;
        if self.auto_scroll {
            self.selected = self.display.len().saturating_sub(1);
        }
        self.clamp_selected();
    }

    fn clamp_selected(&mut self) {
        if self.display.is_empty() {
            self.selected = 0;
        } else if self.selected >= self.display.len() {
            self.selected = self.display.len() - 1;
        }
    }

    /// Periodic upkeep: commit a settled search draft and drain killswitch
    /// notices into the status line.
    pub fn tick(&mut self, now: Instant) {
        if let Some(settled) = self.search_settled_at {
            if now.duration_since(settled) >= SEARCH_DEBOUNCE {
                self.commit_search();
            }
        }
        for notice in self.registry.take_notices() {
            self.status = Some(format!(
                "check '{}' disabled after {:.1}ms",
                notice.name, notice.eval_millis
            ));
        }
    }

    fn commit_search(&mut self) {
        self.search_settled_at = None;
        self.pipeline.set_query(&self.search_draft.buffer);
        self.rebuild_display();
    }

    // -- pause and recording ------------------------------------------------

    pub fn toggle_pause(&mut self, now: Instant) {
        if self.paused {
            self.paused = false;
            let pending: Vec<LogEntry> = self.pending.drain(..).collect();
            for entry in pending {
                self.push_entry(entry, now);
            }
            self.status = Some("resumed".to_string());
        } else {
            self.paused = true;
            self.status = Some("paused".to_string());
        }
    }

    pub fn start_recording(&mut self, started_at: DateTime<Utc>) {
        if self.recording.is_none() {
            self.recording = Some(Recording { started_at, lines: Vec::new() });
            self.status = Some("recording".to_string());
        }
    }

    /// Stops recording and writes the capture, one line per received entry
    /// sorted by timestamp ascending. Returns the path, or `None` when no
    /// recording was running.
    pub fn stop_recording(
        &mut self,
        ended_at: DateTime<Utc>,
    ) -> Result<Option<PathBuf>, TuiError> {
        let Some(recording) = self.recording.take() else {
            return Ok(None);
        };
        let stamp = |at: DateTime<Utc>| at.format("%Y-%m-%dT%H-%M-%S%.3fZ").to_string();
        let name = format!("{}_{}_records.log", stamp(recording.started_at), stamp(ended_at));
        let path = self.records_dir.join(name);
        fs::create_dir_all(&self.records_dir)?;
        let mut lines = recording.lines;
        lines.sort_by_key(|(produced_at, _)| *produced_at);
        let mut contents =
            lines.iter().map(|(_, line)| line.as_str()).collect::<Vec<_>>().join("\n");
        contents.push('\n');
        fs::write(&path, contents)?;
        info!(path = %path.display(), lines = lines.len(), "recording saved");
        self.status = Some(format!("recording saved to {}", path.display()));
        Ok(Some(path))
    }

    /// Empties the buffer and resets ids, caches and telemetry. Checks and
    /// filters survive.
    pub fn clear(&mut self, now: Instant) {
        self.store.clear();
        self.cache.clear();
        self.display.clear();
        self.pending.clear();
        self.selected = 0;
        self.missed_while_scrolled = 0;
        self.auto_scroll = true;
        self.perf.reset(now);
        self.status = Some("cleared".to_string());
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        let evicted = self.store.set_capacity(capacity);
        self.forget_entries(&evicted);
        self.status = Some(format!("buffer capacity {capacity}"));
    }

    // -- persistence --------------------------------------------------------

    pub fn export_state(&self) -> PersistedState {
        PersistedState {
            capacity: Some(self.store.capacity()),
            inline: self.display_mode == DisplayMode::Inline,
            depth: Some(self.depth),
            syntax_highlight: Some(self.syntax_highlight),
            query_is_regex: self.pipeline.state.query_is_regex,
            checks: self.registry.export(),
            levels: Some(self.pipeline.state.levels.iter().copied().collect()),
        }
    }

    pub fn apply_state(&mut self, state: PersistedState) {
        if let Some(capacity) = state.capacity {
            self.store.set_capacity(capacity);
        }
        self.display_mode = if state.inline { DisplayMode::Inline } else { DisplayMode::Box };
        if let Some(depth) = state.depth {
            self.depth = depth.clamp(1, 5);
        }
        if let Some(syntax) = state.syntax_highlight {
            self.syntax_highlight = syntax;
        }
        self.pipeline.set_regex_mode(state.query_is_regex);
        let restored = self.registry.restore(state.checks);
        if restored > 0 {
            info!(restored, "checks restored");
        }
        if let Some(levels) = state.levels {
            self.pipeline.state.levels = levels.into_iter().collect();
        }
        self.rebuild_display();
    }

    // -- key handling -------------------------------------------------------

    pub fn handle_key(&mut self, key: KeyEvent) -> Action {
        if key.modifiers.contains(KeyModifiers::CONTROL) && matches!(key.code, KeyCode::Char('c'))
        {
            return Action::Quit;
        }
        match self.mode {
            Mode::Normal => self.handle_normal(key),
            Mode::Search => self.handle_search(key),
            Mode::CheckEditor => self.handle_editor(key),
            Mode::Picker => self.handle_picker(key),
        }
    }

    fn handle_normal(&mut self, key: KeyEvent) -> Action {
        match key.code {
            KeyCode::Char('q') => return Action::Quit,
            KeyCode::Char('o') => return Action::Connect,
            KeyCode::Char('O') => return Action::Disconnect,
            KeyCode::Char('/') => {
                self.mode = Mode::Search;
            }
            KeyCode::Char('a') => {
                self.editor = Some(CheckEditorState::blank());
                self.mode = Mode::CheckEditor;
            }
            KeyCode::Char('j') | KeyCode::Down => self.move_selection(1),
            KeyCode::Char('k') | KeyCode::Up => self.move_selection(-1),
            KeyCode::Char('G') | KeyCode::End => self.jump_to_bottom(),
            KeyCode::Char('p') => self.toggle_pause(Instant::now()),
            KeyCode::Char('c') => self.clear(Instant::now()),
            KeyCode::Char('r') => {
                if self.recording.is_some() {
                    if let Err(err) = self.stop_recording(Utc::now()) {
                        self.status = Some(format!("recording failed: {err}"));
                    }
                } else {
                    self.start_recording(Utc::now());
                }
            }
            KeyCode::Char('d') => {
                self.depth = self.depth % 5 + 1;
                self.status = Some(format!("depth {}", self.depth));
            }
            KeyCode::Char('m') => {
                self.display_mode = match self.display_mode {
                    DisplayMode::Box => DisplayMode::Inline,
                    DisplayMode::Inline => DisplayMode::Box,
                };
            }
            KeyCode::Char('h') => {
                self.syntax_highlight = !self.syntax_highlight;
            }
            KeyCode::Char('y') => self.copy_selected(false),
            KeyCode::Char('Y') => self.copy_selected(true),
            KeyCode::Char('L') => self.open_picker(PickerKind::Levels),
            KeyCode::Char('B') => self.open_picker(PickerKind::Capacity),
            KeyCode::Char('F') => self.open_picker(PickerKind::Files),
            KeyCode::Char('C') => self.open_picker(PickerKind::Checks),
            _ => {}
        }
        Action::None
    }

    fn handle_search(&mut self, key: KeyEvent) -> Action {
        match key.code {
            KeyCode::Esc => {
                self.search_draft.clear();
                self.search_settled_at = None;
                self.commit_search();
                self.mode = Mode::Normal;
            }
            KeyCode::Enter => {
                self.commit_search();
                self.mode = Mode::Normal;
            }
            KeyCode::Char('r') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                let regex = !self.pipeline.state.query_is_regex;
                self.pipeline.set_regex_mode(regex);
                self.search_settled_at = Some(Instant::now());
            }
            KeyCode::Char(ch) => {
                self.search_draft.insert_char(ch);
                self.search_settled_at = Some(Instant::now());
            }
            KeyCode::Backspace => {
                self.search_draft.backspace();
                self.search_settled_at = Some(Instant::now());
            }
            _ => {}
        }
        Action::None
    }

    fn handle_editor(&mut self, key: KeyEvent) -> Action {
        let Some(editor) = &mut self.editor else {
            self.mode = Mode::Normal;
            return Action::None;
        };
        match key.code {
            KeyCode::Esc => {
                self.editor = None;
                self.mode = Mode::Normal;
            }
            KeyCode::Tab => editor.editing_source = !editor.editing_source,
            KeyCode::Enter => return self.submit_editor(),
            KeyCode::Char(ch) => {
                let field =
                    if editor.editing_source { &mut editor.source } else { &mut editor.name };
                field.insert_char(ch);
            }
            KeyCode::Backspace => {
                let field =
                    if editor.editing_source { &mut editor.source } else { &mut editor.name };
                field.backspace();
            }
            _ => {}
        }
        Action::None
    }

    fn submit_editor(&mut self) -> Action {
        let Some(editor) = self.editor.take() else {
            return Action::None;
        };
        let result = match editor.check_id {
            Some(id) => self
                .registry
                .update(id, &editor.name.buffer, &editor.source.buffer, &mut self.cache)
                .map(|_| id),
            None => self.registry.add(&editor.name.buffer, &editor.source.buffer),
        };
        match result {
            Ok(id) => {
                let name = self.registry.get(id).map(|check| check.name.clone());
                self.status = name.map(|name| format!("check '{name}' saved"));
                self.mode = Mode::Normal;
                self.rebuild_display();
            }
            Err(err) => {
                let mut editor = editor;
                editor.error = Some(err.to_string());
                self.editor = Some(editor);
            }
        }
        Action::None
    }

    fn open_picker(&mut self, kind: PickerKind) {
        self.picker = Some(PickerState { kind, selected: 0 });
        self.mode = Mode::Picker;
    }

    fn picker_len(&self) -> usize {
        match self.picker.as_ref().map(|picker| picker.kind) {
            Some(PickerKind::Levels) => Level::ALL.len(),
            Some(PickerKind::Capacity) => CAPACITY_PRESETS.len(),
            Some(PickerKind::Files) => self.picker_files().len(),
            Some(PickerKind::Checks) => self.registry.len(),
            None => 0,
        }
    }

    fn picker_files(&self) -> Vec<String> {
        let mut files: BTreeSet<String> = self.catalog.files.iter().cloned().collect();
        for entry in self.store.iter() {
            if let Some(origin) = entry.origin_parts() {
                files.insert(origin.file);
            }
        }
        files.into_iter().collect()
    }

    fn handle_picker(&mut self, key: KeyEvent) -> Action {
        let Some(picker) = &mut self.picker else {
            self.mode = Mode::Normal;
            return Action::None;
        };
        let kind = picker.kind;
        match key.code {
            KeyCode::Esc | KeyCode::Enter if kind != PickerKind::Capacity => {
                self.picker = None;
                self.mode = Mode::Normal;
                return Action::None;
            }
            KeyCode::Esc => {
                self.picker = None;
                self.mode = Mode::Normal;
                return Action::None;
            }
            KeyCode::Char('j') | KeyCode::Down => {
                let len = self.picker_len();
                if let Some(picker) = &mut self.picker {
                    if picker.selected + 1 < len {
                        picker.selected += 1;
                    }
                }
                return Action::None;
            }
            KeyCode::Char('k') | KeyCode::Up => {
                if let Some(picker) = &mut self.picker {
                    picker.selected = picker.selected.saturating_sub(1);
                }
                return Action::None;
            }
            _ => {}
        }
        let selected = self.picker.as_ref().map(|picker| picker.selected).unwrap_or(0);
        match kind {
            PickerKind::Levels => self.picker_levels_key(key, selected),
            PickerKind::Capacity => self.picker_capacity_key(key, selected),
            PickerKind::Files => self.picker_files_key(key, selected),
            PickerKind::Checks => self.picker_checks_key(key, selected),
        }
        Action::None
    }

    fn picker_levels_key(&mut self, key: KeyEvent, selected: usize) {
        if key.code != KeyCode::Char(' ') {
            return;
        }
        let Some(level) = Level::ALL.get(selected).copied() else { return };
        let levels = &mut self.pipeline.state.levels;
        if !levels.remove(&level) {
            levels.insert(level);
        }
        self.rebuild_display();
    }

    fn picker_capacity_key(&mut self, key: KeyEvent, selected: usize) {
        if key.code != KeyCode::Enter {
            return;
        }
        if let Some(capacity) = CAPACITY_PRESETS.get(selected).copied() {
            self.set_capacity(capacity);
        }
        self.picker = None;
        self.mode = Mode::Normal;
    }

    fn picker_files_key(&mut self, key: KeyEvent, selected: usize) {
        if key.code != KeyCode::Char(' ') {
            return;
        }
        let files = self.picker_files();
        let Some(file) = files.get(selected).cloned() else { return };
        let active = &mut self.pipeline.state.files;
        if !active.remove(&file) {
            active.insert(file.clone());
        } else {
            self.pipeline.state.line_ranges.remove(&file);
        }
        self.rebuild_display();
    }

    fn picker_checks_key(&mut self, key: KeyEvent, selected: usize) {
        let Some(check) = self.registry.checks().get(selected) else { return };
        let id = check.id;
        match key.code {
            KeyCode::Char(' ') => {
                let _ = self.registry.toggle(id);
                self.rebuild_display();
            }
            KeyCode::Char('d') => {
                let _ = self.registry.remove(id, &mut self.cache);
                self.pipeline.state.required_checks.remove(&id);
                self.rebuild_display();
            }
            KeyCode::Char('f') => {
                let required = &mut self.pipeline.state.required_checks;
                if !required.remove(&id) {
                    required.insert(id);
                }
                self.rebuild_display();
            }
            KeyCode::Char('e') => {
                if let Some(check) = self.registry.get(id) {
                    self.editor = Some(CheckEditorState {
                        check_id: Some(id),
                        name: InputState::from_str(&check.name),
                        source: InputState::from_str(&check.source),
                        editing_source: true,
                        error: None,
                    });
                    self.picker = None;
                    self.mode = Mode::CheckEditor;
                }
            }
            _ => {}
        }
    }

    fn move_selection(&mut self, delta: i32) {
        if self.display.is_empty() {
            return;
        }
        let last = self.display.len() - 1;
        let next = (self.selected as i64 + delta as i64).clamp(0, last as i64) as usize;
        self.selected = next;
        if next < last {
            self.auto_scroll = false;
        } else {
            self.auto_scroll = true;
            self.missed_while_scrolled = 0;
        }
    }

    fn jump_to_bottom(&mut self) {
        self.auto_scroll = true;
        self.missed_while_scrolled = 0;
        self.clamp_selected();
        if !self.display.is_empty() {
            self.selected = self.display.len() - 1;
        }
    }

    pub fn selected_entry(&self) -> Option<&LogEntry> {
        self.display.get(self.selected).and_then(|id| self.store.get(*id))
    }

    fn copy_selected(&mut self, pretty: bool) {
        let Some(entry) = self.selected_entry() else {
            self.status = Some("nothing selected".to_string());
            return;
        };
        let payload = logdeck_render::clipboard_payload(entry, pretty);
        match self.clipboard.set(&payload) {
            Ok(()) => self.status = Some("copied".to_string()),
            Err(err) => self.status = Some(format!("copy failed: {err}")),
        }
    }

    // -- rendering ----------------------------------------------------------

    pub fn render(&mut self, frame: &mut Frame<'_>) {
        let started = Instant::now();
        let size = frame.area();
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(1), Constraint::Min(0), Constraint::Length(1)])
            .split(size);

        self.render_top_bar(frame, chunks[0]);
        self.render_main(frame, chunks[1]);
        self.render_footer(frame, chunks[2]);

        if self.mode == Mode::CheckEditor {
            self.render_editor(frame);
        } else if self.mode == Mode::Picker {
            self.render_picker(frame);
        }

        let millis = started.elapsed().as_secs_f64() * 1000.0;
        self.perf.record_render(Instant::now(), millis);
    }

    fn render_top_bar(&mut self, frame: &mut Frame<'_>, area: Rect) {
        let snapshot = self.perf.snapshot(Instant::now());
        let mut spans = vec![match &self.connection {
            ConnectionStatus::Connected => {
                Span::styled(" ● connected ", Style::new().fg(Color::Green))
            }
            ConnectionStatus::Disconnected => {
                Span::styled(" ○ offline ", Style::new().fg(Color::Red))
            }
            ConnectionStatus::Reconnecting { attempt, delay, since } => Span::styled(
                format!(
                    " ◌ retry #{attempt} in {}s ",
                    reconnect_remaining_secs(*since, *delay, Instant::now())
                ),
                Style::new().fg(Color::Yellow),
            ),
        }];
        spans.push(Span::raw(format!(
            "in {:.0}/s shown {:.0}/s ",
            snapshot.ingest_rate, snapshot.display_rate
        )));
        if let Some(render_avg) = snapshot.render_avg_millis {
            let style = if snapshot.render_slow {
                Style::new().fg(Color::Red)
            } else {
                Style::new().fg(Color::DarkGray)
            };
            spans.push(Span::styled(format!("render {render_avg:.1}ms "), style));
        }
        if let Some(check_avg) = snapshot.check_avg_millis {
            let style = if snapshot.checks_slow {
                Style::new().fg(Color::Red)
            } else {
                Style::new().fg(Color::DarkGray)
            };
            spans.push(Span::styled(format!("checks {check_avg:.2}ms "), style));
        }
        if let Some(rtt) = snapshot.rtt_millis {
            spans.push(Span::raw(format!("rtt {rtt:.0}ms ")));
        }
        if self.dropped_frames > 0 {
            spans.push(Span::styled(
                format!("dropped {} ", self.dropped_frames),
                Style::new().fg(Color::Yellow),
            ));
        }
        if self.paused {
            spans.push(Span::styled(" PAUSED ", Style::new().fg(Color::Black).bg(Color::Yellow)));
        }
        if self.recording.is_some() {
            spans.push(Span::styled(" REC ", Style::new().fg(Color::White).bg(Color::Red)));
        }
        frame.render_widget(Paragraph::new(Line::from(spans)), area);
    }

    fn render_main(&mut self, frame: &mut Frame<'_>, area: Rect) {
        let chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
            .split(area);
        self.render_list(frame, chunks[0]);
        self.render_detail(frame, chunks[1]);
    }

    fn entry_chips(&mut self, entry: &LogEntry) -> Vec<CheckChip> {
        let mut chips = Vec::new();
        for check_id in self.registry.enabled_ids() {
            let Some(name) = self.registry.get(check_id).map(|check| check.name.clone()) else {
                continue;
            };
            let outcome = self.registry.run_check(check_id, entry, &mut self.cache);
            chips.push(CheckChip { name, passed: outcome.passed });
        }
        chips
    }

    fn render_list(&mut self, frame: &mut Frame<'_>, area: Rect) {
        let mut title = format!(
            " logs {}/{} cap {} ",
            self.display.len(),
            self.store.len(),
            self.store.capacity()
        );
        if self.missed_while_scrolled > 0 {
            title.push_str(&format!("▼ {} new ", self.missed_while_scrolled));
        }

        let ids: Vec<u64> = self.display.clone();
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(entry) = self.store.get(id).cloned() else { continue };
            let chips = self.entry_chips(&entry);
            let opts = RenderOptions {
                mode: self.display_mode,
                depth: self.depth,
                syntax_highlight: self.syntax_highlight,
                matcher: self.pipeline.matcher(),
            };
            items.push(ListItem::new(logdeck_render::render_entry(&entry, &chips, &opts)));
        }

        self.list_state.select(if items.is_empty() { None } else { Some(self.selected) });
        let list = List::new(items)
            .block(Block::default().borders(Borders::ALL).title(title))
            .highlight_style(Style::new().add_modifier(Modifier::REVERSED));
        frame.render_stateful_widget(list, area, &mut self.list_state);
    }

    fn render_detail(&mut self, frame: &mut Frame<'_>, area: Rect) {
        let block = Block::default().borders(Borders::ALL).title(" detail ");
        let Some(entry) = self.selected_entry().cloned() else {
            frame.render_widget(
                Paragraph::new("no entry selected").block(block),
                area,
            );
            return;
        };
        let mut rows = Vec::new();
        for check in self.registry.checks() {
            let outcome = self.cache.get(entry.id, check.id);
            let avg = self.registry.timing_stats(check.id).map(|(_, avg, _)| avg);
            rows.push(DetailCheckRow {
                name: check.name.clone(),
                passed: outcome.map(|outcome| outcome.passed),
                eval_millis: outcome.map(|outcome| outcome.eval_millis).or(avg),
                killed: check.killed,
            });
        }
        let text = logdeck_render::render_detail(&entry, &rows);
        frame.render_widget(Paragraph::new(text).wrap(Wrap { trim: false }).block(block), area);
    }

    fn render_footer(&mut self, frame: &mut Frame<'_>, area: Rect) {
        let line = match self.mode {
            Mode::Search => {
                let flag = if self.pipeline.state.query_is_regex { "re" } else { "sub" };
                let mut spans = vec![
                    Span::styled(format!(" /{} ", flag), Style::new().fg(Color::Cyan)),
                    Span::raw(self.search_draft.buffer.clone()),
                    Span::styled("█", Style::new().fg(Color::Cyan)),
                ];
                if let Some(error) = self.pipeline.query_error() {
                    spans.push(Span::styled(
                        format!("  {error}"),
                        Style::new().fg(Color::Red),
                    ));
                }
                Line::from(spans)
            }
            _ => match &self.status {
                Some(status) => Line::from(Span::styled(
                    format!(" {status}"),
                    Style::new().fg(Color::DarkGray),
                )),
                None => Line::from(Span::styled(
                    " q quit  / search  a check  L levels  F files  C checks  B buffer  p pause  r rec  c clear",
                    Style::new().fg(Color::DarkGray),
                )),
            },
        };
        frame.render_widget(Paragraph::new(line), area);
    }

    fn render_editor(&mut self, frame: &mut Frame<'_>) {
        let Some(editor) = &self.editor else { return };
        let area = centered_rect(70, 9, frame.area());
        frame.render_widget(Clear, area);
        let title = if editor.check_id.is_some() { " edit check " } else { " new check " };
        let focus = |active: bool| {
            if active {
                Style::new().fg(Color::Cyan)
            } else {
                Style::new().fg(Color::DarkGray)
            }
        };
        let mut lines = vec![
            Line::from(vec![
                Span::styled("name   ", focus(!editor.editing_source)),
                Span::raw(editor.name.buffer.clone()),
            ]),
            Line::from(vec![
                Span::styled("source ", focus(editor.editing_source)),
                Span::raw(editor.source.buffer.clone()),
            ]),
            Line::from(Span::styled(
                "tab switch field, enter save, esc cancel",
                Style::new().fg(Color::DarkGray),
            )),
        ];
        if let Some(error) = &editor.error {
            lines.push(Line::from(Span::styled(
                error.clone(),
                Style::new().fg(Color::Red),
            )));
        }
        let block = Block::default().borders(Borders::ALL).title(title);
        frame.render_widget(Paragraph::new(lines).wrap(Wrap { trim: false }).block(block), area);
    }

    fn render_picker(&mut self, frame: &mut Frame<'_>) {
        let Some(picker) = self.picker.clone() else { return };
        let area = centered_rect(50, 40, frame.area());
        frame.render_widget(Clear, area);

        let (title, lines): (&str, Vec<Line<'static>>) = match picker.kind {
            PickerKind::Levels => (
                " levels (space toggles) ",
                Level::ALL
                    .iter()
                    .map(|level| {
                        let active = self.pipeline.state.levels.contains(level);
                        picker_row(
                            active,
                            level.as_str(),
                            Some(Style::new().fg(level_color(*level))),
                        )
                    })
                    .collect(),
            ),
            PickerKind::Capacity => (
                " buffer capacity (enter applies) ",
                CAPACITY_PRESETS
                    .iter()
                    .map(|preset| {
                        picker_row(*preset == self.store.capacity(), &preset.to_string(), None)
                    })
                    .collect(),
            ),
            PickerKind::Files => (
                " files (space toggles) ",
                self.picker_files()
                    .iter()
                    .map(|file| {
                        picker_row(self.pipeline.state.files.contains(file), file, None)
                    })
                    .collect(),
            ),
            PickerKind::Checks => (
                " checks (space toggle, f filter, e edit, d delete) ",
                self.registry
                    .checks()
                    .iter()
                    .map(|check| {
                        let mut label = check.name.clone();
                        if check.killed {
                            label.push_str(" (killed)");
                        }
                        if self.pipeline.state.required_checks.contains(&check.id) {
                            label.push_str(" [filter]");
                        }
                        picker_row(check.enabled, &label, None)
                    })
                    .collect(),
            ),
        };

        let items: Vec<ListItem<'_>> = lines.into_iter().map(ListItem::new).collect();
        let mut state = ListState::default();
        state.select(if items.is_empty() { None } else { Some(picker.selected) });
        let list = List::new(items)
            .block(Block::default().borders(Borders::ALL).title(title))
            .highlight_style(Style::new().add_modifier(Modifier::REVERSED));
        frame.render_stateful_widget(list, area, &mut state);
    }
}

fn picker_row(active: bool, label: &str, style: Option<Style>) -> Line<'static> {
    let mark = if active { "[x] " } else { "[ ] " };
    let span = match style {
        Some(style) => Span::styled(label.to_string(), style),
        None => Span::raw(label.to_string()),
    };
    Line::from(vec![Span::raw(mark), span])
}

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);
    let horizontal = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(vertical[1]);
    horizontal[1]
}

/// Text the search filter runs against: the full-depth rendering, so a
/// term buried below the list depth still matches.
fn search_text(entry: &LogEntry) -> String {
    logdeck_render::format_args(&entry.args, logdeck_render::DETAIL_DEPTH)
}

/// Whole seconds left before the next reconnect attempt, rounded up.
fn reconnect_remaining_secs(since: Instant, delay: Duration, now: Instant) -> u64 {
    delay.saturating_sub(now.duration_since(since)).as_secs_f64().ceil() as u64
}
