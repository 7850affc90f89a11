//! The status-fetching capability consumed by the monitor

use async_trait::async_trait;
use std::collections::BTreeSet;
use thiserror::Error;

use super::model::{ProjectId, ProjectSnapshot};

/// Errors raised while talking to the CI platform
#[derive(Debug, Error)]
pub enum FetchError {
    /// Credentials were rejected (HTTP 401/403)
    #[error("authentication rejected by {endpoint} (HTTP {status})")]
    Unauthorized { endpoint: String, status: u16 },

    #[error("request to {endpoint} failed with HTTP {status}")]
    Status { endpoint: String, status: u16 },

    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to decode response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

impl FetchError {
    pub fn is_auth(&self) -> bool {
        matches!(self, FetchError::Unauthorized { .. })
    }
}

/// Source of current pipeline statuses
///
/// Implementations must tolerate per-project failures: a project whose
/// pipeline cannot be read is left out of the result and logged. Only a
/// failure of the prerequisite project listing fails the whole call.
#[async_trait]
pub trait StatusFetcher: Send + Sync {
    async fn fetch_all(
        &self,
        project_ids: &BTreeSet<ProjectId>,
    ) -> Result<Vec<ProjectSnapshot>, FetchError>;
}
