use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{CoreError, Entity};

/// A `(clientInstanceId, nodeId)` destination of an actions group.
///
/// Displayed as `"{clientInstanceId}_{nodeId}"` in logs and error messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId {
    pub client_instance_id: String,
    pub node_id: String,
}

impl TargetId {
    #[must_use]
    pub fn new(client_instance_id: &str, node_id: &str) -> Self {
        Self {
            client_instance_id: client_instance_id.to_owned(),
            node_id: node_id.to_owned(),
        }
    }
}

impl Display for TargetId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.client_instance_id, self.node_id)
    }
}

/// Explicit lifecycle of a ledger entry, derived from the recorded facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackingActionState {
    /// Source outcome not known yet.
    Pending,
    /// Source known but at least one target has no outcome.
    TargetsPending,
    /// Source failed; every target carries an outcome.
    SourceFailed,
    /// Every target succeeded.
    Succeeded,
    /// Finished with at least one target error.
    Failed,
}

impl TrackingActionState {
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::SourceFailed | Self::Succeeded | Self::Failed)
    }
}

/// Per-actions-group completion record, keyed by `(sessionId, actionsGroupId)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingAction {
    pub session_id: String,
    pub actions_group_id: String,
    /// `None` for actions that need no source data (deletes, directory creation).
    pub source_client_instance_id: Option<String>,
    pub is_source_success: Option<bool>,
    pub targets: BTreeSet<TargetId>,
    pub success_targets: BTreeSet<TargetId>,
    pub error_targets: BTreeSet<TargetId>,
    pub size: Option<u64>,
    /// Shared files whose uploaded length is already in the exchanged volume.
    #[serde(default)]
    pub counted_shared_files: BTreeSet<String>,
}

impl TrackingAction {
    #[must_use]
    pub fn key(session_id: &str, actions_group_id: &str) -> String {
        format!("{session_id}_{actions_group_id}")
    }

    #[must_use]
    pub fn new(session_id: &str, actions_group_id: &str) -> Self {
        Self {
            session_id: session_id.to_owned(),
            actions_group_id: actions_group_id.to_owned(),
            source_client_instance_id: None,
            is_source_success: None,
            targets: BTreeSet::new(),
            success_targets: BTreeSet::new(),
            error_targets: BTreeSet::new(),
            size: None,
            counted_shared_files: BTreeSet::new(),
        }
    }

    /// Source outcome; actions without a source count as a known success.
    #[must_use]
    pub fn source_outcome(&self) -> Option<bool> {
        match (&self.source_client_instance_id, self.is_source_success) {
            (None, outcome) => Some(outcome.unwrap_or(true)),
            (Some(_), outcome) => outcome,
        }
    }

    #[must_use]
    pub fn has_outcome(&self, target: &TargetId) -> bool {
        self.success_targets.contains(target) || self.error_targets.contains(target)
    }

    pub fn pending_targets(&self) -> impl Iterator<Item = &TargetId> {
        self.targets.iter().filter(|target| !self.has_outcome(target))
    }

    #[must_use]
    pub fn state(&self) -> TrackingActionState {
        let all_targets_done = self.pending_targets().next().is_none();
        match (self.source_outcome(), all_targets_done) {
            (None, _) => TrackingActionState::Pending,
            (Some(_), false) => TrackingActionState::TargetsPending,
            (Some(false), true) => TrackingActionState::SourceFailed,
            (Some(true), true) if self.error_targets.is_empty() => TrackingActionState::Succeeded,
            (Some(true), true) => TrackingActionState::Failed,
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.source_outcome() == Some(false) || !self.error_targets.is_empty()
    }

    /// Records a successful target. Returns `Ok(false)` when nothing changed:
    /// the entry is already finished or the target already has an outcome.
    pub fn add_success_on_target(&mut self, target: &TargetId) -> Result<bool, CoreError> {
        self.record_target(target, true)
    }

    /// Records a failed target, with the same idempotence as
    /// [`Self::add_success_on_target`].
    pub fn add_error_on_target(&mut self, target: &TargetId) -> Result<bool, CoreError> {
        self.record_target(target, false)
    }

    /// Records the source outcome once. A failed source also fails every
    /// target still waiting, since none of them can receive the data.
    pub fn set_source_outcome(&mut self, success: bool) -> bool {
        if self.is_finished() || self.is_source_success.is_some() {
            return false;
        }
        self.is_source_success = Some(success);
        if !success {
            let pending = self.pending_targets().cloned().collect::<Vec<_>>();
            self.error_targets.extend(pending);
        }
        true
    }

    /// Marks a shared file as counted. Returns `false` if it already was.
    pub fn count_shared_file(&mut self, shared_file_id: &str) -> bool {
        self.counted_shared_files.insert(shared_file_id.to_owned())
    }

    fn record_target(&mut self, target: &TargetId, success: bool) -> Result<bool, CoreError> {
        if !self.targets.contains(target) {
            return Err(CoreError::UnknownTarget {
                actions_group_id: self.actions_group_id.clone(),
                target: target.to_string(),
            });
        }
        if self.is_finished() || self.has_outcome(target) {
            return Ok(false);
        }
        if success {
            self.success_targets.insert(target.clone());
        } else {
            self.error_targets.insert(target.clone());
        }
        Ok(true)
    }
}

impl Entity for TrackingAction {
    const KIND: &'static str = "tracking-action";
}
