//! CLI entry point, config resolution and the run loop wiring the
//! transport task to the dashboard.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use crossterm::event::{self, Event, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use url::Url;

use crate::logdeck_core::{Level, LogEntry};
use crate::logdeck_store::DEFAULT_CAPACITY;
use crate::logdeck_transport::{self, TransportCommand, TransportEvent};
use crate::logdeck_tui::{Action, Dashboard, DashboardConfig, PersistedState};

const DEFAULT_URL: &str = "ws://127.0.0.1:3456/";
const CONFIG_FILE_NAME: &str = "logdeck.json";
const STATE_FILE_NAME: &str = "logdeck-state.json";
const TUI_TICK_MS: u64 = 50;
const CATALOG_FETCH_TIMEOUT: Duration = Duration::from_secs(2);

pub type DynError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "logdeck", version, about = "Live log dashboard")]
struct Cli {
    /// Relay WebSocket URL.
    #[arg(long)]
    url: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    capacity: Option<usize>,
    #[arg(long, action = clap::ArgAction::SetTrue)]
    inline: bool,
    #[arg(long, action = clap::ArgAction::SetTrue)]
    no_connect: bool,
    #[arg(long)]
    records_dir: Option<PathBuf>,
    #[arg(long)]
    state_file: Option<PathBuf>,
    /// Generate local events instead of connecting anywhere.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    demo: bool,
}

#[derive(Debug, Clone)]
struct Config {
    url: Url,
    capacity: usize,
    inline: bool,
    autoconnect: bool,
    records_dir: PathBuf,
    state_file: PathBuf,
}

#[derive(Debug, Default, Clone)]
struct PartialConfig {
    url: Option<String>,
    capacity: Option<usize>,
    inline: Option<bool>,
    autoconnect: Option<bool>,
    records_dir: Option<PathBuf>,
    state_file: Option<PathBuf>,
}

impl PartialConfig {
    fn merge(&mut self, other: PartialConfig) {
        if other.url.is_some() {
            self.url = other.url;
        }
        if other.capacity.is_some() {
            self.capacity = other.capacity;
        }
        if other.inline.is_some() {
            self.inline = other.inline;
        }
        if other.autoconnect.is_some() {
            self.autoconnect = other.autoconnect;
        }
        if other.records_dir.is_some() {
            self.records_dir = other.records_dir;
        }
        if other.state_file.is_some() {
            self.state_file = other.state_file;
        }
    }
}

impl Config {
    fn from_partial(partial: PartialConfig, cwd: &Path) -> Result<Self, ConfigError> {
        let raw_url = partial.url.unwrap_or_else(|| DEFAULT_URL.to_string());
        let url = Url::parse(&raw_url)
            .map_err(|source| ConfigError::InvalidUrl { value: raw_url, source })?;
        Ok(Self {
            url,
            capacity: partial.capacity.unwrap_or(DEFAULT_CAPACITY),
            inline: partial.inline.unwrap_or(false),
            autoconnect: partial.autoconnect.unwrap_or(true),
            records_dir: partial.records_dir.unwrap_or_else(|| cwd.to_path_buf()),
            state_file: partial.state_file.unwrap_or_else(|| cwd.join(STATE_FILE_NAME)),
        })
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileConfig {
    url: Option<String>,
    capacity: Option<usize>,
    inline: Option<bool>,
    #[serde(alias = "autoConnect", alias = "auto-connect")]
    autoconnect: Option<bool>,
    #[serde(alias = "recordsDir")]
    records_dir: Option<PathBuf>,
    #[serde(alias = "stateFile")]
    state_file: Option<PathBuf>,
}

impl FileConfig {
    fn into_partial(self) -> PartialConfig {
        PartialConfig {
            url: self.url,
            capacity: self.capacity,
            inline: self.inline,
            autoconnect: self.autoconnect,
            records_dir: self.records_dir,
            state_file: self.state_file,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    ParseFile { path: PathBuf, source: serde_json::Error },
    #[error("config file not found: {path}")]
    MissingConfig { path: PathBuf },
    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },
    #[error("invalid relay url {value}: {source}")]
    InvalidUrl { value: String, source: url::ParseError },
}

fn load_file_config(path: &Path) -> Result<PartialConfig, ConfigError> {
    let contents = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
    let file: FileConfig = serde_json::from_str(&contents)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })?;
    Ok(file.into_partial())
}

fn env_config(env_map: &BTreeMap<String, String>) -> Result<PartialConfig, ConfigError> {
    let mut partial = PartialConfig::default();
    if let Some(url) = env_map.get("LOGDECK_URL") {
        partial.url = Some(url.clone());
    }
    if let Some(raw) = env_map.get("LOGDECK_CAPACITY") {
        let capacity = raw.parse::<usize>().map_err(|_| ConfigError::InvalidEnv {
            name: "LOGDECK_CAPACITY".to_string(),
            value: raw.clone(),
        })?;
        partial.capacity = Some(capacity);
    }
    if let Some(raw) = env_map.get("LOGDECK_NO_CONNECT") {
        partial.autoconnect = Some(!matches!(raw.as_str(), "1" | "true" | "yes"));
    }
    if let Some(dir) = env_map.get("LOGDECK_RECORDS_DIR") {
        partial.records_dir = Some(PathBuf::from(dir));
    }
    Ok(partial)
}

fn cli_config(cli: &Cli) -> PartialConfig {
    PartialConfig {
        url: cli.url.clone(),
        capacity: cli.capacity,
        inline: cli.inline.then_some(true),
        autoconnect: cli.no_connect.then_some(false),
        records_dir: cli.records_dir.clone(),
        state_file: cli.state_file.clone(),
    }
}

/// Defaults, then file, then environment, then CLI flags.
fn resolve_config(
    cli: &Cli,
    cwd: &Path,
    env_map: &BTreeMap<String, String>,
) -> Result<(Config, Option<PathBuf>), ConfigError> {
    let mut partial = PartialConfig::default();

    let config_path = match &cli.config {
        Some(path) => {
            if !path.exists() {
                return Err(ConfigError::MissingConfig { path: path.clone() });
            }
            Some(path.clone())
        }
        None => {
            let candidate = cwd.join(CONFIG_FILE_NAME);
            candidate.exists().then_some(candidate)
        }
    };
    if let Some(path) = &config_path {
        partial.merge(load_file_config(path)?);
    }
    partial.merge(env_config(env_map)?);
    partial.merge(cli_config(cli));

    Ok((Config::from_partial(partial, cwd)?, config_path))
}

// ---------------------------------------------------------------------------
// Persisted state
// ---------------------------------------------------------------------------

fn load_state(path: &Path) -> Option<PersistedState> {
    let contents = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(state) => Some(state),
        Err(error) => {
            warn!(path = %path.display(), "ignoring unreadable state file: {error}");
            None
        }
    }
}

fn save_state(path: &Path, state: &PersistedState) -> Result<(), DynError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(state)?)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Terminal lifecycle
// ---------------------------------------------------------------------------

struct TerminalGuard;

impl TerminalGuard {
    fn enter() -> Result<Self, DynError> {
        enable_raw_mode()?;
        execute!(io::stdout(), EnterAlternateScreen)?;
        Ok(Self)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = execute!(io::stdout(), LeaveAlternateScreen);
        let _ = disable_raw_mode();
    }
}

// ---------------------------------------------------------------------------
// Run loop
// ---------------------------------------------------------------------------

fn run_tui_loop(
    config: DashboardConfig,
    state: Option<PersistedState>,
    state_file: PathBuf,
    mut events: mpsc::Receiver<TransportEvent>,
    commands: mpsc::Sender<TransportCommand>,
    catalog: logdeck_transport::FileCatalog,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DynError> {
    let _guard = TerminalGuard::enter()?;
    let stdout = io::stdout();
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;
    terminal.hide_cursor()?;

    let mut dash = Dashboard::new(config);
    dash.set_catalog(catalog);
    if let Some(state) = state {
        dash.apply_state(state);
    }

    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        while let Ok(event) = events.try_recv() {
            if dash.handle_transport_event(event, now) {
                let _ = commands.try_send(TransportCommand::ForceDisconnect {
                    reason: "check budget exhausted".to_string(),
                });
            }
        }
        dash.tick(now);

        terminal.draw(|frame| dash.render(frame))?;

        if event::poll(Duration::from_millis(TUI_TICK_MS))? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                match dash.handle_key(key) {
                    Action::Quit => {
                        let _ = shutdown_tx.send(());
                        running.store(false, Ordering::SeqCst);
                    }
                    Action::Connect => {
                        let _ = commands.try_send(TransportCommand::Connect);
                    }
                    Action::Disconnect => {
                        let _ = commands.try_send(TransportCommand::Disconnect);
                    }
                    Action::None => {}
                }
            }
        }
    }

    if let Err(error) = save_state(&state_file, &dash.export_state()) {
        warn!("failed to save state: {error}");
    }
    Ok(())
}

/// Local event generator for `--demo`: cycles levels and payload shapes so
/// every dashboard surface has something to chew on.
async fn run_demo(
    mut shutdown: broadcast::Receiver<()>,
    events: mpsc::Sender<TransportEvent>,
) {
    let _ = events.send(TransportEvent::Connected).await;
    let mut ticker = tokio::time::interval(Duration::from_millis(300));
    let mut seq: u64 = 0;
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = ticker.tick() => {}
        }
        let level = Level::ALL[(seq % Level::ALL.len() as u64) as usize];
        let args = match seq % 3 {
            0 => vec![json!(format!("demo event {seq}"))],
            1 => vec![json!("payload"), json!({"seq": seq, "nested": {"ok": true}})],
            _ => vec![json!({"items": [1, 2, 3], "seq": seq})],
        };
        let entry = LogEntry {
            id: 0,
            level,
            timestamp: chrono::Utc::now(),
            origin: Some(format!("demo/generator.js:{}", 10 + seq % 40)),
            args,
            bound_data: serde_json::Map::new(),
            is_new: true,
        };
        if events.send(TransportEvent::Entry(entry)).await.is_err() {
            return;
        }
        seq += 1;
    }
}

pub async fn run() -> Result<(), DynError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let cwd = env::current_dir()?;
    let env_map: BTreeMap<String, String> = env::vars().collect();
    let (config, config_path) = resolve_config(&cli, &cwd, &env_map)?;

    if let Some(path) = &config_path {
        info!(path = %path.display(), "loaded config file");
    } else {
        info!("no logdeck.json found, using defaults and env/cli overrides");
    }
    info!(
        url = %config.url,
        capacity = config.capacity,
        inline = config.inline,
        autoconnect = config.autoconnect,
        demo = cli.demo,
        "resolved config"
    );

    let persisted = load_state(&config.state_file);

    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    let mut shutdown_rx = shutdown_tx.subscribe();

    let (commands, events, catalog) = if cli.demo {
        let (command_tx, _command_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(1024);
        tokio::spawn(run_demo(shutdown_tx.subscribe(), event_tx));
        (command_tx, event_rx, logdeck_transport::FileCatalog::default())
    } else {
        let (commands, events) =
            logdeck_transport::spawn(config.url.clone(), config.autoconnect, shutdown_tx.subscribe());
        let catalog = match tokio::time::timeout(
            CATALOG_FETCH_TIMEOUT,
            logdeck_transport::fetch_file_catalog(&config.url),
        )
        .await
        {
            Ok(Ok(catalog)) => {
                info!(files = catalog.files.len(), "file catalog loaded");
                catalog
            }
            Ok(Err(error)) => {
                warn!("file catalog unavailable: {error}");
                Default::default()
            }
            Err(_) => {
                warn!("file catalog fetch timed out");
                Default::default()
            }
        };
        (commands, events, catalog)
    };

    let dashboard_config = DashboardConfig {
        capacity: config.capacity,
        inline: config.inline,
        records_dir: config.records_dir.clone(),
        ..DashboardConfig::default()
    };

    let running = Arc::new(AtomicBool::new(true));
    let running_signal = running.clone();
    let state_file = config.state_file.clone();
    let shutdown_for_tui = shutdown_tx.clone();

    let shutdown_watcher = tokio::spawn(async move {
        let _ = shutdown_rx.recv().await;
        running_signal.store(false, Ordering::SeqCst);
    });

    let mut tui_handle = tokio::task::spawn_blocking(move || {
        run_tui_loop(
            dashboard_config,
            persisted,
            state_file,
            events,
            commands,
            catalog,
            running,
            shutdown_for_tui,
        )
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            let _ = shutdown_tx.send(());
            (&mut tui_handle).await??;
        }
        result = &mut tui_handle => {
            result??;
            let _ = shutdown_tx.send(());
        }
    }

    shutdown_watcher.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn base_cli() -> Cli {
        Cli {
            url: None,
            config: None,
            capacity: None,
            inline: false,
            no_connect: false,
            records_dir: None,
            state_file: None,
            demo: false,
        }
    }

    #[test]
    fn defaults_apply_without_any_sources() {
        let dir = TempDir::new().expect("tempdir");
        let (config, path) =
            resolve_config(&base_cli(), dir.path(), &BTreeMap::new()).expect("config");
        assert!(path.is_none());
        assert_eq!(config.url.as_str(), DEFAULT_URL);
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
        assert!(config.autoconnect);
        assert_eq!(config.state_file, dir.path().join(STATE_FILE_NAME));
    }

    #[test]
    fn file_config_is_found_in_the_working_directory() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{"url": "ws://relay:9000/", "capacity": 500, "autoConnect": false}"#,
        )
        .expect("write");
        let (config, path) =
            resolve_config(&base_cli(), dir.path(), &BTreeMap::new()).expect("config");
        assert!(path.is_some());
        assert_eq!(config.url.as_str(), "ws://relay:9000/");
        assert_eq!(config.capacity, 500);
        assert!(!config.autoconnect);
    }

    #[test]
    fn cli_flags_override_file_and_env() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join(CONFIG_FILE_NAME), r#"{"capacity": 500}"#).expect("write");
        let mut env_map = BTreeMap::new();
        env_map.insert("LOGDECK_CAPACITY".to_string(), "2500".to_string());
        let mut cli = base_cli();
        cli.capacity = Some(100);
        cli.no_connect = true;
        let (config, _) = resolve_config(&cli, dir.path(), &env_map).expect("config");
        assert_eq!(config.capacity, 100);
        assert!(!config.autoconnect);
    }

    #[test]
    fn env_overrides_file() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join(CONFIG_FILE_NAME), r#"{"capacity": 500}"#).expect("write");
        let mut env_map = BTreeMap::new();
        env_map.insert("LOGDECK_CAPACITY".to_string(), "2500".to_string());
        let (config, _) = resolve_config(&base_cli(), dir.path(), &env_map).expect("config");
        assert_eq!(config.capacity, 2500);
    }

    #[rstest]
    #[case("not-a-number")]
    #[case("-5")]
    fn bad_capacity_env_is_an_error(#[case] raw: &str) {
        let mut env_map = BTreeMap::new();
        env_map.insert("LOGDECK_CAPACITY".to_string(), raw.to_string());
        let result = resolve_config(&base_cli(), Path::new("/tmp"), &env_map);
        assert!(matches!(result, Err(ConfigError::InvalidEnv { .. })));
    }

    #[test]
    fn explicit_missing_config_path_is_an_error() {
        let mut cli = base_cli();
        cli.config = Some(PathBuf::from("/definitely/not/here.json"));
        let result = resolve_config(&cli, Path::new("/tmp"), &BTreeMap::new());
        assert!(matches!(result, Err(ConfigError::MissingConfig { .. })));
    }

    #[test]
    fn invalid_url_is_an_error() {
        let mut cli = base_cli();
        cli.url = Some("::not a url::".to_string());
        let result = resolve_config(&cli, Path::new("/tmp"), &BTreeMap::new());
        assert!(matches!(result, Err(ConfigError::InvalidUrl { .. })));
    }

    #[test]
    fn state_file_round_trips() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("state.json");
        let state = PersistedState {
            capacity: Some(500),
            inline: true,
            depth: Some(3),
            syntax_highlight: Some(false),
            query_is_regex: true,
            checks: Vec::new(),
            levels: None,
        };
        save_state(&path, &state).expect("save");
        let loaded = load_state(&path).expect("load");
        assert_eq!(loaded.capacity, Some(500));
        assert!(loaded.inline);
        assert_eq!(loaded.depth, Some(3));
        assert!(loaded.query_is_regex);
    }

    #[test]
    fn corrupt_state_file_is_ignored() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("state.json");
        fs::write(&path, "{broken").expect("write");
        assert!(load_state(&path).is_none());
    }
}
