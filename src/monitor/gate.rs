//! Per (project, status) notification cooldown

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;

use super::model::{PipelineStatus, ProjectId};

/// Default cooldown between two notifications for the same project and status
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Suppresses repeated notifications for a flapping pipeline
#[derive(Debug, Clone)]
pub struct NotificationGate {
    cooldown: Duration,
    last_fired: HashMap<(ProjectId, PipelineStatus), Instant>,
}

impl Default for NotificationGate {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

impl NotificationGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_fired: HashMap::new(),
        }
    }

    /// Whether a notification for this key may fire at `now`
    pub fn allow(&self, project_id: ProjectId, status: PipelineStatus, now: Instant) -> bool {
        match self.last_fired.get(&(project_id, status)) {
            Some(last) => now.saturating_duration_since(*last) >= self.cooldown,
            None => true,
        }
    }

    /// Record a delivered notification. Must only be called after delivery succeeded.
    pub fn mark_fired(&mut self, project_id: ProjectId, status: PipelineStatus, now: Instant) {
        self.last_fired.insert((project_id, status), now);
    }

    /// Forget cooldowns of projects that are no longer monitored
    pub fn retain(&mut self, project_ids: &BTreeSet<ProjectId>) {
        self.last_fired.retain(|(id, _), _| project_ids.contains(id));
    }

    pub fn reset(&mut self) {
        self.last_fired.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: ProjectId = ProjectId(1);

    #[test]
    fn test_allows_without_history() {
        let gate = NotificationGate::default();
        assert!(gate.allow(ID, PipelineStatus::Success, Instant::now()));
    }

    #[test]
    fn test_cooldown_window() {
        let mut gate = NotificationGate::default();
        let t0 = Instant::now();
        assert!(gate.allow(ID, PipelineStatus::Success, t0));
        gate.mark_fired(ID, PipelineStatus::Success, t0);

        assert!(!gate.allow(ID, PipelineStatus::Success, t0));
        assert!(!gate.allow(ID, PipelineStatus::Success, t0 + Duration::from_secs(30)));
        assert!(!gate.allow(ID, PipelineStatus::Success, t0 + Duration::from_millis(59_999)));
        assert!(gate.allow(ID, PipelineStatus::Success, t0 + DEFAULT_COOLDOWN));
        assert!(gate.allow(ID, PipelineStatus::Success, t0 + Duration::from_secs(600)));
    }

    #[test]
    fn test_keys_are_independent() {
        let mut gate = NotificationGate::default();
        let t0 = Instant::now();
        gate.mark_fired(ID, PipelineStatus::Failed, t0);

        assert!(gate.allow(ID, PipelineStatus::Success, t0));
        assert!(gate.allow(ProjectId(2), PipelineStatus::Failed, t0));
        assert!(!gate.allow(ID, PipelineStatus::Failed, t0));
    }

    #[test]
    fn test_retain_and_reset() {
        let mut gate = NotificationGate::new(Duration::from_secs(10));
        let t0 = Instant::now();
        gate.mark_fired(ProjectId(1), PipelineStatus::Failed, t0);
        gate.mark_fired(ProjectId(2), PipelineStatus::Failed, t0);

        gate.retain(&BTreeSet::from([ProjectId(2)]));
        assert!(gate.allow(ProjectId(1), PipelineStatus::Failed, t0));
        assert!(!gate.allow(ProjectId(2), PipelineStatus::Failed, t0));

        gate.reset();
        assert!(gate.allow(ProjectId(2), PipelineStatus::Failed, t0));
    }
}
