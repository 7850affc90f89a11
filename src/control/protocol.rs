//! Protocol definitions for control socket messages

use serde::{Deserialize, Serialize};

use crate::monitor::{MonitorState, OverallHealth, ProjectId, ProjectSnapshot};

/// Largest frame either side accepts
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Requests sent by the CLI to a running `watch` process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Report the current monitor state and latest snapshots
    Status,
    /// Replace the monitored project set and restart polling
    Select {
        project_ids: Vec<ProjectId>,
    },
    /// Stop polling (the process keeps serving requests)
    Stop,
    /// Stop polling, forget every observed status and shut the watcher down
    Logout,
}

/// Replies written back on the same connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Snapshot {
        state: MonitorState,
        health: OverallHealth,
        projects: Vec<ProjectSnapshot>,
    },
    Ack {
        message: String,
    },
    Error {
        message: String,
    },
}

impl ControlResponse {
    pub fn ack(message: impl Into<String>) -> Self {
        ControlResponse::Ack {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ControlResponse::Error {
            message: message.into(),
        }
    }
}
