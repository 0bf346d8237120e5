//! Logdeck: live dashboard for a developer log stream.

mod cli;
mod logdeck_checks;
mod logdeck_core;
mod logdeck_filters;
mod logdeck_perf;
mod logdeck_render;
mod logdeck_store;
mod logdeck_transport;
mod logdeck_tui;

pub use cli::{run, DynError};
pub use logdeck_checks::{
    CheckError, CheckInputs, CheckLimits, CheckOutcome, CheckProgram, CheckRegistry, ResultCache,
    StoredCheck,
};
pub use logdeck_core::{parse_frame, InboundFrame, Level, LogEntry, Origin, WireEvent};
pub use logdeck_filters::{FilterPipeline, FilterState, LineRange, QueryMatcher};
pub use logdeck_perf::{PerfMonitor, PerfSnapshot};
pub use logdeck_render::{DisplayMode, RenderOptions};
pub use logdeck_store::{LogStore, CAPACITY_PRESETS, DEFAULT_CAPACITY};
pub use logdeck_transport::{FileCatalog, TransportCommand, TransportEvent};
pub use logdeck_tui::{Dashboard, DashboardConfig, PersistedState};
