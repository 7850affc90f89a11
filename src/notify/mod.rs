//! Desktop notification delivery for pipeline transitions
//!
//! Delivery is result-returning so the monitor only starts a cooldown once a
//! notification was actually handed to the platform.

pub mod desktop;

use async_trait::async_trait;
use thiserror::Error;

use crate::monitor::{Severity, Transition};

pub use desktop::DesktopNotifier;

/// Title used for every pipeline notification
pub const NOTIFICATION_TITLE: &str = "GitLab CI/CD status update";
/// Title used when status checks themselves keep failing
pub const PROBLEM_TITLE: &str = "GitLab CI/CD monitoring problem";

/// A notification ready to be shown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    /// Page to open for details (pipeline or project)
    pub target_url: String,
    pub severity: Severity,
}

impl Notification {
    pub fn for_transition(transition: &Transition) -> Self {
        let name = &transition.snapshot.name;
        let body = match transition.from {
            Some(from) => format!(
                "{}: pipeline {} → {}",
                name,
                from.label(),
                transition.to.label()
            ),
            None => format!("{}: pipeline {}", name, transition.to.label()),
        };

        Self {
            title: NOTIFICATION_TITLE.to_string(),
            body,
            target_url: transition.snapshot.web_url.clone(),
            severity: transition.to.severity(),
        }
    }

    /// Status checks are failing as a whole (bad token, unreachable server)
    pub fn for_cycle_failure(auth_rejected: bool, message: &str, target_url: &str) -> Self {
        let body = if auth_rejected {
            format!("GitLab rejected the access token: {}", message)
        } else {
            format!("Pipeline status checks keep failing: {}", message)
        };

        Self {
            title: PROBLEM_TITLE.to_string(),
            body,
            target_url: target_url.to_string(),
            severity: Severity::Critical,
        }
    }
}

/// Decides when a failing streak of status checks deserves a desktop alert
///
/// One alert per streak: on the first rejected token, or once the streak
/// reaches the threshold, whichever comes first.
#[derive(Debug, Clone)]
pub struct FailureAlerts {
    threshold: u32,
    alerted: bool,
}

impl FailureAlerts {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            alerted: false,
        }
    }

    /// Returns true if this failure should be shown
    pub fn on_failure(&mut self, consecutive: u32, auth_rejected: bool) -> bool {
        // A count of 1 starts a new streak (the monitor was restarted)
        if consecutive <= 1 {
            self.alerted = false;
        }
        if self.alerted {
            return false;
        }
        if auth_rejected || consecutive >= self.threshold {
            self.alerted = true;
            return true;
        }
        false
    }

    /// A cycle succeeded; the next streak may alert again
    pub fn on_success(&mut self) {
        self.alerted = false;
    }
}

/// Errors from a notification sink
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The platform has no way to show notifications
    #[error("notifications are not supported: {0}")]
    Unsupported(String),

    #[error("notification command failed: {0}")]
    Failed(String),

    #[error("notification I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Something that can display a notification
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

/// Sink that only writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        tracing::info!(
            severity = notification.severity.as_str(),
            url = %notification.target_url,
            "{}: {}",
            notification.title,
            notification.body
        );
        Ok(())
    }
}
