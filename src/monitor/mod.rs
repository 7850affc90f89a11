//! Pipeline monitoring core
//!
//! Polls a [`StatusFetcher`], diffs the result against the [`StatusLedger`],
//! gates notifications through a per-(project, status) cooldown and
//! publishes every completed cycle to subscribers.

pub mod differ;
pub mod fetcher;
pub mod gate;
pub mod ledger;
pub mod manager;
pub mod model;

pub use differ::diff;
pub use fetcher::{FetchError, StatusFetcher};
pub use gate::{NotificationGate, DEFAULT_COOLDOWN};
pub use ledger::StatusLedger;
pub use manager::{
    Monitor, MonitorEvent, MonitorSettings, MonitorState, UpdateCallback, DEFAULT_POLL_INTERVAL,
};
pub use model::{OverallHealth, PipelineStatus, ProjectId, ProjectSnapshot, Severity, Transition};
