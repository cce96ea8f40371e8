use std::collections::{BTreeSet, HashSet};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::tracking::TargetId;
use crate::Entity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionOperator {
    Copy,
    CopyContentOnly,
    CopyDatesOnly,
    CreateDirectory,
    Delete,
    DoNothing,
}

/// One logical synchronization action as declared by the starting client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionsGroupDefinition {
    pub actions_group_id: String,
    pub operator: ActionOperator,
    pub source_client_instance_id: Option<String>,
    pub targets: Vec<TargetId>,
    pub size: Option<u64>,
}

impl ActionsGroupDefinition {
    #[must_use]
    pub fn is_do_nothing(&self) -> bool {
        self.operator == ActionOperator::DoNothing
    }
}

/// Folds the definitions that do something into one definition per
/// actions group, in first-seen order.
///
/// Repeated ids union their targets; the first definition's operator, source
/// and size are kept. The number of atomic actions of a run is the total
/// target count of the result.
#[must_use]
pub fn merge_actions_groups(
    definitions: &[ActionsGroupDefinition],
) -> Vec<ActionsGroupDefinition> {
    let mut merged: Vec<ActionsGroupDefinition> = Vec::new();
    for definition in definitions.iter().filter(|definition| !definition.is_do_nothing()) {
        let index = match merged
            .iter()
            .position(|group| group.actions_group_id == definition.actions_group_id)
        {
            Some(index) => index,
            None => {
                merged.push(ActionsGroupDefinition {
                    targets: Vec::new(),
                    ..definition.clone()
                });
                merged.len() - 1
            }
        };
        let group = &mut merged[index];
        let mut seen: HashSet<TargetId> = group.targets.iter().cloned().collect();
        for target in &definition.targets {
            if seen.insert(target.clone()) {
                group.targets.push(target.clone());
            }
        }
    }
    merged
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SynchronizationEndStatus {
    Success,
    CompletedWithErrors,
    Aborted,
    FatalError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SynchronizationState {
    Running,
    Aborting,
    Ended,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynchronizationProgress {
    pub total_atomic_actions_count: u64,
    pub finished_actions_count: u64,
    pub errors_count: u64,
    /// Bytes attributed to ledger entries when they finish.
    pub synchronized_volume: u64,
    /// Bytes applied on targets, whatever path they took.
    pub processed_volume: u64,
    /// Bytes physically moved through uploads; a bundle serving several
    /// actions counts once.
    pub exchanged_volume: u64,
    /// Participants snapshotted when the synchronization started.
    pub members: Vec<String>,
    pub completed_members: BTreeSet<String>,
}

impl SynchronizationProgress {
    #[must_use]
    pub fn all_actions_finished(&self) -> bool {
        self.finished_actions_count >= self.total_atomic_actions_count
    }

    #[must_use]
    pub fn all_members_completed(&self) -> bool {
        self.members
            .iter()
            .all(|member| self.completed_members.contains(member))
    }
}

/// Session-wide synchronization run, keyed by `sessionId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Synchronization {
    pub session_id: String,
    pub synchronization_id: String,
    pub started_on: SystemTime,
    pub started_by: String,
    pub abort_requested_on: Option<SystemTime>,
    pub abort_requested_by: BTreeSet<String>,
    pub ended_on: Option<SystemTime>,
    pub end_status: Option<SynchronizationEndStatus>,
    pub is_fatal_error: bool,
    pub progress: SynchronizationProgress,
}

impl Synchronization {
    #[must_use]
    pub fn new(session_id: &str, started_by: &str, progress: SynchronizationProgress) -> Self {
        Self {
            session_id: session_id.to_owned(),
            synchronization_id: uuid::Uuid::new_v4().to_string(),
            started_on: SystemTime::now(),
            started_by: started_by.to_owned(),
            abort_requested_on: None,
            abort_requested_by: BTreeSet::new(),
            ended_on: None,
            end_status: None,
            is_fatal_error: false,
            progress,
        }
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended_on.is_some()
    }

    #[must_use]
    pub fn is_abort_requested(&self) -> bool {
        self.abort_requested_on.is_some()
    }

    #[must_use]
    pub fn state(&self) -> SynchronizationState {
        if self.is_ended() {
            SynchronizationState::Ended
        } else if self.is_abort_requested() {
            SynchronizationState::Aborting
        } else {
            SynchronizationState::Running
        }
    }

    /// Marks the run ended. Returns false if it already was; the first end
    /// status wins.
    pub fn end(&mut self, status: SynchronizationEndStatus, now: SystemTime) -> bool {
        if self.is_ended() {
            return false;
        }
        self.ended_on = Some(now);
        self.end_status = Some(status);
        true
    }
}

impl Entity for Synchronization {
    const KIND: &'static str = "synchronization";
}

/// Index entry for a run with a pending abort, keyed by session id. Lets the
/// abort sweep visit only those runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortingSynchronization {
    pub session_id: String,
    pub synchronization_id: String,
}

impl AbortingSynchronization {
    /// Whether this entry still points at an open, aborting `synchronization`.
    #[must_use]
    pub fn is_current(&self, synchronization: &Synchronization) -> bool {
        synchronization.synchronization_id == self.synchronization_id
            && synchronization.is_abort_requested()
            && !synchronization.is_ended()
    }
}

impl Entity for AbortingSynchronization {
    const KIND: &'static str = "aborting-synchronization";
}
