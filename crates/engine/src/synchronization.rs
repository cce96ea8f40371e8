use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use cloudsync_core::protocol::{
    ActionReportParameters, RequestAbortStatus, StartSynchronizationStatus,
    SynchronizationErrorParameters,
};
use cloudsync_core::synchronization::merge_actions_groups;
use cloudsync_core::{
    AbortingSynchronization, ActionsGroupDefinition, Client, CloudSession, PushEvent,
    Synchronization, SynchronizationEndStatus, SynchronizationProgress, TargetId, TrackingAction,
    TrackingActionState,
};
use cloudsync_storage::{Entities, Transaction};

use crate::ledger::{LedgerUpdate, TrackingActionLedger};
use crate::presence::{ClientPresence, PushTarget};
use crate::EngineError;

/// A fatal departure staged in a caller's transaction. Holds the run as the
/// committed mutation left it.
#[derive(Debug)]
pub struct StagedDeparture {
    client_instance_id: String,
    outcome: Arc<Mutex<Option<(Synchronization, bool)>>>,
}

pub const DEFAULT_ABORT_GRACE_PERIOD: Duration = Duration::from_secs(300);

/// When a requested abort is honored.
///
/// An abort ends the run once every participant reported `MemberHasFinished`,
/// once all actions are finished anyway, or once `abort_grace_period` has
/// elapsed since the first request, whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynchronizationPolicy {
    pub abort_grace_period: Duration,
}

impl Default for SynchronizationPolicy {
    fn default() -> Self {
        Self {
            abort_grace_period: DEFAULT_ABORT_GRACE_PERIOD,
        }
    }
}

/// Whether ledger and progress mutations are still accepted. An abort that is
/// only requested keeps the run open so in-flight actions can still report.
#[must_use]
pub fn check_synchronization_can_be_updated(synchronization: &Synchronization) -> bool {
    !synchronization.is_ended() && !synchronization.is_fatal_error
}

/// Pure finish decision: the status the run should end with now, if any.
#[must_use]
pub fn check_synchronization_is_finished(
    synchronization: &Synchronization,
    policy: &SynchronizationPolicy,
    now: SystemTime,
) -> Option<SynchronizationEndStatus> {
    if synchronization.is_ended() {
        return None;
    }
    if synchronization.is_fatal_error {
        return Some(SynchronizationEndStatus::FatalError);
    }

    let progress = &synchronization.progress;
    if let Some(requested_on) = synchronization.abort_requested_on {
        let grace_elapsed = now
            .duration_since(requested_on)
            .is_ok_and(|elapsed| elapsed >= policy.abort_grace_period);
        let wound_down = progress.all_members_completed() || progress.all_actions_finished();
        return (grace_elapsed || wound_down).then_some(SynchronizationEndStatus::Aborted);
    }

    if progress.all_actions_finished() || progress.all_members_completed() {
        return Some(if progress.errors_count > 0 {
            SynchronizationEndStatus::CompletedWithErrors
        } else {
            SynchronizationEndStatus::Success
        });
    }
    None
}

/// Ends the run if it is finished. Returns whether this call ended it.
pub(crate) fn finish_if_complete(
    synchronization: &mut Synchronization,
    policy: &SynchronizationPolicy,
    now: SystemTime,
) -> bool {
    match check_synchronization_is_finished(synchronization, policy, now) {
        Some(status) => synchronization.end(status, now),
        None => false,
    }
}

/// Snapshot taken before a ledger entry is mutated, used to count each
/// transition exactly once.
pub(crate) struct EntryTransition {
    was_finished: bool,
    was_error: bool,
    succeeded_targets: usize,
}

impl EntryTransition {
    pub(crate) fn capture(action: &TrackingAction) -> Self {
        Self {
            was_finished: action.is_finished(),
            was_error: action.is_error(),
            succeeded_targets: action.success_targets.len(),
        }
    }

    /// Folds the difference between the snapshot and `action` into `progress`.
    pub(crate) fn account(self, action: &TrackingAction, progress: &mut SynchronizationProgress) {
        let size = action.size.unwrap_or(0);
        let newly_succeeded = action
            .success_targets
            .len()
            .saturating_sub(self.succeeded_targets) as u64;
        progress.processed_volume += size * newly_succeeded;

        if !self.was_finished && action.is_finished() {
            // One finishing transition covers every target of the entry.
            progress.finished_actions_count += action.targets.len() as u64;
            if action.state() == TrackingActionState::Succeeded {
                progress.synchronized_volume += size;
            }
        }
        if !self.was_error && action.is_error() {
            progress.errors_count += 1;
        }
    }
}

/// Records an outcome on a ledger entry, updates counters and ends the run
/// when that completes it. `record` returns whether anything changed.
pub(crate) fn record_outcome<F>(
    action: &mut TrackingAction,
    synchronization: &mut Synchronization,
    policy: &SynchronizationPolicy,
    record: F,
) -> Result<bool, EngineError>
where
    F: FnOnce(&mut TrackingAction) -> Result<bool, EngineError>,
{
    let transition = EntryTransition::capture(action);
    if !record(action)? {
        return Ok(false);
    }
    transition.account(action, &mut synchronization.progress);
    finish_if_complete(synchronization, policy, SystemTime::now());
    Ok(true)
}

/// Session-wide synchronization state machine:
/// `NotStarted -> Running -> (Aborting) -> Ended`.
#[derive(Clone)]
pub struct SynchronizationEngine {
    entities: Entities,
    presence: ClientPresence,
    ledger: TrackingActionLedger,
    policy: SynchronizationPolicy,
}

impl SynchronizationEngine {
    #[must_use]
    pub fn new(
        entities: Entities,
        presence: ClientPresence,
        ledger: TrackingActionLedger,
        policy: SynchronizationPolicy,
    ) -> Self {
        Self {
            entities,
            presence,
            ledger,
            policy,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &SynchronizationPolicy {
        &self.policy
    }

    #[must_use]
    pub fn ledger(&self) -> &TrackingActionLedger {
        &self.ledger
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<Synchronization>, EngineError> {
        Ok(self.entities.get::<Synchronization>(session_id).await?)
    }

    #[must_use]
    pub fn check_synchronization_can_be_updated(&self, synchronization: &Synchronization) -> bool {
        check_synchronization_can_be_updated(synchronization)
    }

    #[must_use]
    pub fn check_synchronization_is_finished(
        &self,
        synchronization: &Synchronization,
        now: SystemTime,
    ) -> Option<SynchronizationEndStatus> {
        check_synchronization_is_finished(synchronization, &self.policy, now)
    }

    /// Starts a run from the action definitions. A previous run that already
    /// ended is replaced together with its ledger.
    pub async fn start_synchronization(
        &self,
        client: &Client,
        session_id: &str,
        definitions: Vec<ActionsGroupDefinition>,
    ) -> Result<StartSynchronizationStatus, EngineError> {
        let Some(session) = self
            .entities
            .get::<CloudSession>(session_id)
            .await?
            .filter(|session| !session.is_removed)
        else {
            return Ok(StartSynchronizationStatus::SessionNotFound);
        };
        let starter = client.client_instance_id.clone();
        if !session.is_member(&starter) {
            return Err(EngineError::NotSessionMember {
                client_instance_id: starter,
                session_id: session_id.to_owned(),
            });
        }

        let actions: Vec<TrackingAction> = merge_actions_groups(&definitions)
            .into_iter()
            .map(|definition| {
                let mut action = TrackingAction::new(session_id, &definition.actions_group_id);
                action.source_client_instance_id = definition.source_client_instance_id;
                action.targets = definition.targets.into_iter().collect();
                action.size = definition.size;
                action
            })
            .collect();
        let progress = SynchronizationProgress {
            // Counted from the seeded entries so the total matches the ledger.
            total_atomic_actions_count: actions
                .iter()
                .map(|action| action.targets.len() as u64)
                .sum(),
            members: session.member_instance_ids(),
            ..SynchronizationProgress::default()
        };
        let mut synchronization = Synchronization::new(session_id, &starter, progress);
        let ended = finish_if_complete(&mut synchronization, &self.policy, SystemTime::now());

        let mut tx = Transaction::new();
        let candidate = synchronization.clone();
        let staged = self
            .entities
            .stage_add_or_update(&mut tx, session_id, move |current: Option<Synchronization>| {
                match current {
                    Some(existing) if !existing.is_ended() => None,
                    _ => Some(candidate.clone()),
                }
            })
            .await?;
        if !staged.is_accepted() {
            return Ok(StartSynchronizationStatus::AlreadyStarted);
        }

        let member = starter.clone();
        self.entities
            .stage_update(&mut tx, session_id, move |session: &mut CloudSession| {
                if session.is_removed || !session.is_member(&member) {
                    return false;
                }
                session.is_activated = true;
                true
            })
            .await?;

        for stale in self
            .entities
            .list_ids::<TrackingAction>(&format!("{session_id}_"))
            .await?
        {
            self.entities.stage_delete::<TrackingAction>(&mut tx, &stale);
        }
        for action in actions {
            let key = TrackingAction::key(session_id, &action.actions_group_id);
            self.entities
                .stage_add_or_update(&mut tx, &key, move |_: Option<TrackingAction>| {
                    Some(action.clone())
                })
                .await?;
        }

        if !self.entities.commit(tx).await? {
            let running = self.get(session_id).await?.is_some_and(|sync| !sync.is_ended());
            return Ok(if running {
                StartSynchronizationStatus::AlreadyStarted
            } else {
                StartSynchronizationStatus::SessionNotFound
            });
        }

        tracing::info!(
            session_id,
            started_by = %starter,
            total = synchronization.progress.total_atomic_actions_count,
            "synchronization started"
        );
        self.presence
            .push(
                PushTarget::SessionGroup(session_id.to_owned()),
                PushEvent::SynchronizationStarted {
                    synchronization: synchronization.clone(),
                },
            )
            .await;
        if ended {
            self.update_synchronization_progress(&synchronization, true)
                .await;
        }
        Ok(StartSynchronizationStatus::Started)
    }

    pub async fn request_abort(
        &self,
        client: &Client,
        session_id: &str,
    ) -> Result<RequestAbortStatus, EngineError> {
        let requester = client.client_instance_id.as_str();
        let policy = self.policy;
        let mut status = RequestAbortStatus::NotRunning;
        let mut participant = true;
        let mut ended = false;

        let result = self
            .entities
            .update_pair(
                session_id,
                session_id,
                |synchronization: &mut Option<Synchronization>,
                 aborting: &mut Option<AbortingSynchronization>| {
                    ended = false;
                    let Some(synchronization) = synchronization.as_mut() else {
                        status = RequestAbortStatus::NotRunning;
                        return false;
                    };
                    participant = synchronization
                        .progress
                        .members
                        .iter()
                        .any(|member| member == requester);
                    if !participant || !check_synchronization_can_be_updated(synchronization) {
                        status = RequestAbortStatus::NotRunning;
                        return false;
                    }
                    if !synchronization.abort_requested_by.insert(requester.to_owned()) {
                        status = RequestAbortStatus::AlreadyRequested;
                        return false;
                    }
                    let now = SystemTime::now();
                    synchronization.abort_requested_on.get_or_insert(now);
                    ended = finish_if_complete(synchronization, &policy, now);
                    // Indexed for the sweep that enforces the grace period.
                    *aborting = (!ended).then(|| AbortingSynchronization {
                        session_id: synchronization.session_id.clone(),
                        synchronization_id: synchronization.synchronization_id.clone(),
                    });
                    status = RequestAbortStatus::Requested;
                    true
                },
            )
            .await?;

        if !participant {
            return Err(EngineError::NotSessionMember {
                client_instance_id: requester.to_owned(),
                session_id: session_id.to_owned(),
            });
        }
        if let (true, Some(synchronization)) = (result.is_saved, result.first.as_ref()) {
            tracing::info!(session_id, requested_by = requester, "synchronization abort requested");
            self.presence
                .push(
                    PushTarget::SessionGroup(session_id.to_owned()),
                    PushEvent::SynchronizationAbortRequested {
                        synchronization: synchronization.clone(),
                    },
                )
                .await;
            if ended {
                self.update_synchronization_progress(synchronization, true)
                    .await;
            }
        }
        Ok(status)
    }

    /// Records that a participant has nothing left to do for this run.
    pub async fn member_has_finished(
        &self,
        client: &Client,
        session_id: &str,
    ) -> Result<bool, EngineError> {
        let member = client.client_instance_id.as_str();
        let policy = self.policy;
        let mut ended = false;

        let result = self
            .entities
            .update(session_id, |synchronization: &mut Synchronization| {
                ended = false;
                if !check_synchronization_can_be_updated(synchronization)
                    || !synchronization.progress.members.iter().any(|m| m == member)
                    || !synchronization
                        .progress
                        .completed_members
                        .insert(member.to_owned())
                {
                    return false;
                }
                ended = finish_if_complete(synchronization, &policy, SystemTime::now());
                true
            })
            .await?;

        if let (true, Some(synchronization)) = (result.is_saved, result.element.as_ref()) {
            self.update_synchronization_progress(synchronization, ended)
                .await;
        }
        Ok(result.is_saved)
    }

    /// Pushes progress, and the terminal event when `ended` is set. Callers
    /// only set `ended` from the mutation that flipped the run to ended, so
    /// the terminal push goes out exactly once per run.
    pub async fn update_synchronization_progress(
        &self,
        synchronization: &Synchronization,
        ended: bool,
    ) {
        let session_id = synchronization.session_id.clone();
        self.presence
            .push(
                PushTarget::SessionGroup(session_id.clone()),
                PushEvent::SynchronizationProgress {
                    synchronization: synchronization.clone(),
                },
            )
            .await;
        if !ended {
            return;
        }

        tracing::info!(
            %session_id,
            status = ?synchronization.end_status,
            finished = synchronization.progress.finished_actions_count,
            errors = synchronization.progress.errors_count,
            "synchronization ended"
        );
        self.presence
            .push(
                PushTarget::SessionGroup(session_id),
                PushEvent::SynchronizationEnded {
                    synchronization: synchronization.clone(),
                },
            )
            .await;
    }

    /// Target-side success reports (`LocalCopyIsDone`, `DateIsCopied`,
    /// `DirectoryIsCreated`, `FileOrDirectoryIsDeleted`).
    pub async fn on_targets_succeeded(
        &self,
        client: &Client,
        params: &ActionReportParameters,
    ) -> Result<LedgerUpdate, EngineError> {
        let node_id = params.node_id.as_deref().ok_or(EngineError::MissingNodeId)?;
        let target = TargetId::new(&client.client_instance_id, node_id);
        let policy = self.policy;

        let update = self
            .ledger
            .add_or_update(
                &params.session_id,
                &params.actions_group_ids,
                |action, synchronization| {
                    record_outcome(action, synchronization, &policy, |action| {
                        // The target holding the data implies the source delivered it.
                        let source_recorded = action.source_client_instance_id.is_some()
                            && action.is_source_success.is_none()
                            && action.targets.contains(&target)
                            && action.set_source_outcome(true);
                        let target_recorded = action.add_success_on_target(&target)?;
                        Ok(source_recorded || target_recorded)
                    })
                },
            )
            .await?;
        self.publish(&update).await;
        Ok(update)
    }

    /// `SynchronizationError(s)`: a node id blames that target, no node id
    /// blames the source, which must then be the caller.
    pub async fn on_errors(
        &self,
        client: &Client,
        params: &SynchronizationErrorParameters,
    ) -> Result<LedgerUpdate, EngineError> {
        let reporter = client.client_instance_id.clone();
        let target = params
            .node_id
            .as_deref()
            .map(|node_id| TargetId::new(&reporter, node_id));
        let policy = self.policy;

        let update = self
            .ledger
            .add_or_update(
                &params.session_id,
                &params.actions_group_ids,
                |action, synchronization| {
                    record_outcome(action, synchronization, &policy, |action| match &target {
                        Some(target) => {
                            // A target-side failure still means the source delivered.
                            let target_recorded = action.add_error_on_target(target)?;
                            let source_recorded = target_recorded
                                && action.source_client_instance_id.is_some()
                                && action.is_source_success.is_none()
                                && action.set_source_outcome(true);
                            Ok(target_recorded || source_recorded)
                        }
                        None => {
                            if action.source_client_instance_id.as_deref() != Some(reporter.as_str())
                            {
                                return Err(EngineError::NotActionSource {
                                    client_instance_id: reporter.clone(),
                                    subject: action.actions_group_id.clone(),
                                });
                            }
                            Ok(action.set_source_outcome(false))
                        }
                    })
                },
            )
            .await?;
        self.publish(&update).await;
        Ok(update)
    }

    /// A participant left while the run was open: the run can no longer
    /// complete, so it is marked fatal and ended.
    pub async fn on_fatal_member_departure(
        &self,
        session_id: &str,
        client_instance_id: &str,
    ) -> Result<bool, EngineError> {
        let mut tx = Transaction::new();
        let Some(departure) = self
            .stage_fatal_member_departure(&mut tx, session_id, client_instance_id)
            .await?
        else {
            return Ok(false);
        };
        if !self.entities.commit(tx).await? {
            return Ok(false);
        }
        Ok(self.publish_departure(&departure).await)
    }

    /// Stages the fatal end of the open run `client_instance_id` takes part
    /// in, so it commits together with the caller's other mutations. Returns
    /// `None` when there is no such run. After a successful commit, hand the
    /// result to [`Self::publish_departure`].
    pub async fn stage_fatal_member_departure(
        &self,
        tx: &mut Transaction,
        session_id: &str,
        client_instance_id: &str,
    ) -> Result<Option<StagedDeparture>, EngineError> {
        let takes_part = |synchronization: &Synchronization| {
            check_synchronization_can_be_updated(synchronization)
                && synchronization
                    .progress
                    .members
                    .iter()
                    .any(|member| member == client_instance_id)
        };
        if !self.get(session_id).await?.is_some_and(|sync| takes_part(&sync)) {
            return Ok(None);
        }

        let departure = StagedDeparture {
            client_instance_id: client_instance_id.to_owned(),
            outcome: Arc::new(Mutex::new(None)),
        };
        let outcome = Arc::clone(&departure.outcome);
        let departing = departure.client_instance_id.clone();
        let policy = self.policy;
        self.entities
            .stage_add_or_update(tx, session_id, move |current: Option<Synchronization>| {
                let mut synchronization = current?;
                let mut recorded = None;
                // A run that ended meanwhile is kept as is.
                if check_synchronization_can_be_updated(&synchronization)
                    && synchronization.progress.members.contains(&departing)
                {
                    synchronization.is_fatal_error = true;
                    let ended = finish_if_complete(&mut synchronization, &policy, SystemTime::now());
                    recorded = Some((synchronization.clone(), ended));
                }
                if let Ok(mut slot) = outcome.lock() {
                    *slot = recorded;
                }
                Some(synchronization)
            })
            .await?;
        Ok(Some(departure))
    }

    /// Pushes the run a committed departure made fatal. Returns whether the
    /// departure changed the run.
    pub async fn publish_departure(&self, departure: &StagedDeparture) -> bool {
        let recorded = departure.outcome.lock().ok().and_then(|mut slot| slot.take());
        let Some((synchronization, ended)) = recorded else {
            return false;
        };
        tracing::warn!(
            session_id = %synchronization.session_id,
            client_instance_id = %departure.client_instance_id,
            "member left a running synchronization"
        );
        self.update_synchronization_progress(&synchronization, ended)
            .await;
        true
    }

    /// Ends every aborting run whose grace period is over. Returns how many
    /// runs were ended.
    ///
    /// Only runs indexed by [`AbortingSynchronization`] are visited. Index
    /// entries whose run ended some other way are dropped on the way.
    pub async fn finalize_expired_aborts(&self, now: SystemTime) -> Result<usize, EngineError> {
        let policy = self.policy;
        let mut finalized = 0;

        for session_id in self.entities.list_ids::<AbortingSynchronization>("").await? {
            let mut ended = false;
            let result = self
                .entities
                .update_pair(
                    &session_id,
                    &session_id,
                    |synchronization: &mut Option<Synchronization>,
                     aborting: &mut Option<AbortingSynchronization>| {
                        ended = false;
                        let Some(entry) = aborting.as_ref() else {
                            return false;
                        };
                        let is_current = synchronization
                            .as_ref()
                            .is_some_and(|synchronization| entry.is_current(synchronization));
                        let Some(synchronization) = synchronization.as_mut().filter(|_| is_current)
                        else {
                            *aborting = None;
                            return true;
                        };
                        if !check_synchronization_can_be_updated(synchronization) {
                            *aborting = None;
                            return true;
                        }
                        ended = finish_if_complete(synchronization, &policy, now);
                        if ended {
                            *aborting = None;
                        }
                        ended
                    },
                )
                .await?;
            if let (true, true, Some(synchronization)) =
                (result.is_saved, ended, result.first.as_ref())
            {
                finalized += 1;
                self.update_synchronization_progress(synchronization, true)
                    .await;
            }
        }
        Ok(finalized)
    }

    pub(crate) async fn publish(&self, update: &LedgerUpdate) {
        if !update.is_changed() {
            return;
        }
        if let Some(synchronization) = &update.synchronization {
            self.update_synchronization_progress(synchronization, update.ended)
                .await;
        }
    }
}
