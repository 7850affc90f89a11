//! Transition detection between two poll cycles

use std::collections::HashMap;

use super::model::{PipelineStatus, ProjectId, ProjectSnapshot, Transition};

/// Compare the previous statuses with the snapshots of the current cycle.
///
/// A project seen for the first time only seeds the ledger and yields no
/// transition, so starting to monitor never floods the desktop. The result
/// keeps the order of `current`.
pub fn diff(
    previous: &HashMap<ProjectId, PipelineStatus>,
    current: &[ProjectSnapshot],
) -> Vec<Transition> {
    current
        .iter()
        .filter_map(|snapshot| {
            let from = *previous.get(&snapshot.id)?;
            (from != snapshot.status).then(|| Transition {
                project_id: snapshot.id,
                from: Some(from),
                to: snapshot.status,
                snapshot: snapshot.clone(),
            })
        })
        .collect()
}
