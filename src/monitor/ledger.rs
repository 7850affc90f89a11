//! Last-known pipeline status per monitored project

use std::collections::{BTreeSet, HashMap};

use super::model::{PipelineStatus, ProjectId, ProjectSnapshot};

/// Ledger of the last committed snapshot for each project
///
/// Holds at most one entry per project id. Mutation needs `&mut self`, so a
/// whole batch commit is exclusive with respect to readers sharing the same lock.
#[derive(Debug, Default, Clone)]
pub struct StatusLedger {
    entries: HashMap<ProjectId, ProjectSnapshot>,
}

impl StatusLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ProjectId) -> Option<PipelineStatus> {
        self.entries.get(&id).map(|s| s.status)
    }

    /// Previous-status map consumed by the differ
    pub fn statuses(&self) -> HashMap<ProjectId, PipelineStatus> {
        self.entries
            .iter()
            .map(|(id, snapshot)| (*id, snapshot.status))
            .collect()
    }

    /// Insert or replace the entries for every given snapshot, leaving others untouched
    pub fn commit_all(&mut self, snapshots: &[ProjectSnapshot]) {
        for snapshot in snapshots {
            self.entries.insert(snapshot.id, snapshot.clone());
        }
    }

    /// Seed from persisted state
    pub fn restore(&mut self, snapshots: impl IntoIterator<Item = ProjectSnapshot>) {
        for snapshot in snapshots {
            self.entries.insert(snapshot.id, snapshot);
        }
    }

    /// Drop entries for projects that are no longer monitored
    pub fn retain(&mut self, project_ids: &BTreeSet<ProjectId>) {
        self.entries.retain(|id, _| project_ids.contains(id));
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &ProjectSnapshot> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(id: u64, status: PipelineStatus) -> ProjectSnapshot {
        ProjectSnapshot::new(ProjectId(id), format!("project-{}", id), status, "https://gitlab.test")
    }

    #[test]
    fn test_commit_all_inserts_and_replaces() {
        let mut ledger = StatusLedger::new();
        ledger.commit_all(&[snap(1, PipelineStatus::Running), snap(2, PipelineStatus::Pending)]);
        ledger.commit_all(&[snap(1, PipelineStatus::Success)]);

        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.get(ProjectId(1)), Some(PipelineStatus::Success));
        assert_eq!(ledger.get(ProjectId(2)), Some(PipelineStatus::Pending));
        assert_eq!(ledger.get(ProjectId(3)), None);
    }

    #[test]
    fn test_retain_purges_removed_projects() {
        let mut ledger = StatusLedger::new();
        ledger.commit_all(&[snap(1, PipelineStatus::Failed), snap(2, PipelineStatus::Failed)]);

        ledger.retain(&BTreeSet::from([ProjectId(2)]));

        assert_eq!(ledger.get(ProjectId(1)), None);
        assert_eq!(ledger.get(ProjectId(2)), Some(PipelineStatus::Failed));
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut ledger = StatusLedger::new();
        ledger.restore(vec![snap(7, PipelineStatus::Success)]);
        assert!(!ledger.is_empty());

        ledger.reset();
        assert!(ledger.is_empty());
        assert!(ledger.statuses().is_empty());
    }
}
