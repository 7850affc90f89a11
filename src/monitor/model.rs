//! Core data types shared by the fetcher, differ, ledger and notifier

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// GitLab project identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub u64);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ProjectId {
    fn from(id: u64) -> Self {
        ProjectId(id)
    }
}

impl FromStr for ProjectId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(ProjectId)
    }
}

/// Pipeline status as reported by GitLab, folded into the states we notify on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Success,
    Failed,
    Running,
    #[serde(
        alias = "created",
        alias = "waiting_for_resource",
        alias = "preparing",
        alias = "scheduled",
        alias = "manual"
    )]
    Pending,
    #[serde(alias = "canceling")]
    Canceled,
    Skipped,
    #[default]
    #[serde(other)]
    Unknown,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Success => "success",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Running => "running",
            PipelineStatus::Pending => "pending",
            PipelineStatus::Canceled => "canceled",
            PipelineStatus::Skipped => "skipped",
            PipelineStatus::Unknown => "unknown",
        }
    }

    /// Human-readable label for notifications and the status table
    pub fn label(&self) -> &'static str {
        match self {
            PipelineStatus::Success => "passed",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Running => "running",
            PipelineStatus::Pending => "pending",
            PipelineStatus::Canceled => "canceled",
            PipelineStatus::Skipped => "skipped",
            PipelineStatus::Unknown => "unknown",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            PipelineStatus::Failed => Severity::Critical,
            PipelineStatus::Success => Severity::Normal,
            _ => Severity::Low,
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification urgency derived from the new pipeline status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Normal,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Normal => "normal",
            Severity::Critical => "critical",
        }
    }
}

/// One project's pipeline state as observed in a single poll cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub id: ProjectId,
    pub name: String,
    pub status: PipelineStatus,
    /// Pipeline page, or the project page when there is no pipeline
    pub web_url: String,
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub pipeline_id: Option<u64>,
    #[serde(default)]
    pub ref_name: Option<String>,
}

impl ProjectSnapshot {
    pub fn new(
        id: ProjectId,
        name: impl Into<String>,
        status: PipelineStatus,
        web_url: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            status,
            web_url: web_url.into(),
            observed_at: Utc::now(),
            pipeline_id: None,
            ref_name: None,
        }
    }
}

/// A status change for one project between two cycles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub project_id: ProjectId,
    /// `None` only for a first observation, which the differ never reports
    pub from: Option<PipelineStatus>,
    pub to: PipelineStatus,
    pub snapshot: ProjectSnapshot,
}

/// Aggregate health across all monitored projects (tray colour)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    /// Nothing is being monitored
    Idle,
    Passing,
    Running,
    Failing,
    Mixed,
}

impl OverallHealth {
    /// Failure wins over running, running wins over success.
    pub fn from_snapshots(snapshots: &[ProjectSnapshot]) -> Self {
        if snapshots.is_empty() {
            return OverallHealth::Idle;
        }
        if snapshots.iter().any(|s| s.status == PipelineStatus::Failed) {
            OverallHealth::Failing
        } else if snapshots.iter().any(|s| s.status == PipelineStatus::Running) {
            OverallHealth::Running
        } else if snapshots.iter().all(|s| s.status == PipelineStatus::Success) {
            OverallHealth::Passing
        } else {
            OverallHealth::Mixed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OverallHealth::Idle => "idle",
            OverallHealth::Passing => "passing",
            OverallHealth::Running => "running",
            OverallHealth::Failing => "failing",
            OverallHealth::Mixed => "mixed",
        }
    }
}
