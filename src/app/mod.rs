pub mod config;
pub mod persist;

pub use config::{Config, GitLabConfig, MonitorConfig};
pub use persist::{SavedState, StateWriter};
