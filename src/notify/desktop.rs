//! Native desktop notifications via the platform's notification command
//!
//! Linux/BSD use `notify-send` (libnotify), macOS uses `osascript`.

use async_trait::async_trait;
use std::io::ErrorKind;
use tokio::process::Command;

use super::{DeliveryError, Notification, NotificationSink};
use crate::monitor::Severity;

/// Notifier that shells out to the desktop notification tool
#[derive(Debug, Clone)]
pub struct DesktopNotifier {
    app_name: String,
}

impl Default for DesktopNotifier {
    fn default() -> Self {
        Self::new("ci-notifier")
    }
}

impl DesktopNotifier {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
        }
    }

    fn command(&self, notification: &Notification) -> Command {
        if cfg!(target_os = "macos") {
            let mut cmd = Command::new("osascript");
            cmd.arg("-e").arg(osascript_script(notification));
            cmd
        } else {
            let mut cmd = Command::new("notify-send");
            cmd.args(notify_send_args(&self.app_name, notification));
            cmd
        }
    }
}

#[async_trait]
impl NotificationSink for DesktopNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        let output = match self.command(notification).output().await {
            Ok(output) => output,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(DeliveryError::Unsupported(
                    "no desktop notification command found".to_string(),
                ));
            }
            Err(e) => return Err(DeliveryError::Io(e)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DeliveryError::Failed(format!(
                "exit status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        tracing::debug!("Desktop notification shown: {}", notification.body);
        Ok(())
    }
}

/// Freedesktop standard icon name
fn icon_for(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "dialog-error",
        Severity::Normal => "dialog-information",
        Severity::Low => "appointment-soon",
    }
}

fn notify_send_args(app_name: &str, notification: &Notification) -> Vec<String> {
    vec![
        "--app-name".to_string(),
        app_name.to_string(),
        "--urgency".to_string(),
        notification.severity.as_str().to_string(),
        "--icon".to_string(),
        icon_for(notification.severity).to_string(),
        notification.title.clone(),
        format!("{}\n{}", notification.body, notification.target_url),
    ]
}

fn osascript_script(notification: &Notification) -> String {
    format!(
        "display notification \"{}\" with title \"{}\"",
        escape_applescript(&format!("{} ({})", notification.body, notification.target_url)),
        escape_applescript(&notification.title)
    )
}

fn escape_applescript(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
