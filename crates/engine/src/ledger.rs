use cloudsync_core::{Synchronization, TrackingAction};
use cloudsync_storage::Entities;

use crate::synchronization::check_synchronization_can_be_updated;
use crate::EngineError;

/// Outcome of one [`TrackingActionLedger::add_or_update`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerUpdate {
    /// Actions groups whose mutation was durably applied.
    pub applied: Vec<String>,
    /// Latest synchronization seen, after the last applied mutation.
    pub synchronization: Option<Synchronization>,
    /// Set when one of the applied mutations moved the synchronization to ended.
    pub ended: bool,
}

impl LedgerUpdate {
    #[must_use]
    pub fn is_changed(&self) -> bool {
        !self.applied.is_empty()
    }
}

/// Per-actions-group completion bookkeeping.
///
/// Every mutation loads the ledger entry together with the session's
/// synchronization and writes both atomically, so counters can never drift
/// from the entries they summarize.
#[derive(Clone)]
pub struct TrackingActionLedger {
    entities: Entities,
}

impl TrackingActionLedger {
    #[must_use]
    pub fn new(entities: Entities) -> Self {
        Self { entities }
    }

    pub async fn get(
        &self,
        session_id: &str,
        actions_group_id: &str,
    ) -> Result<Option<TrackingAction>, EngineError> {
        Ok(self
            .entities
            .get(&TrackingAction::key(session_id, actions_group_id))
            .await?)
    }

    /// Applies `apply` to each ledger entry and the synchronization together.
    ///
    /// Missing entries are handed to `apply` empty. Nothing is written for an
    /// id when `apply` returns `Ok(false)` or when the synchronization can no
    /// longer be updated. An `Err` from `apply` stops processing and is
    /// returned after the store call, with nothing written for that id.
    pub async fn add_or_update<F>(
        &self,
        session_id: &str,
        actions_group_ids: &[String],
        mut apply: F,
    ) -> Result<LedgerUpdate, EngineError>
    where
        F: FnMut(&mut TrackingAction, &mut Synchronization) -> Result<bool, EngineError> + Send,
    {
        let mut outcome = LedgerUpdate::default();

        for actions_group_id in actions_group_ids {
            let key = TrackingAction::key(session_id, actions_group_id);
            let mut violation = None;
            let mut ended = false;

            let update = self
                .entities
                .update_pair(
                    &key,
                    session_id,
                    |action: &mut Option<TrackingAction>,
                     synchronization: &mut Option<Synchronization>| {
                        violation = None;
                        ended = false;
                        let Some(synchronization) = synchronization.as_mut() else {
                            return false;
                        };
                        if !check_synchronization_can_be_updated(synchronization) {
                            return false;
                        }
                        let action = action
                            .get_or_insert_with(|| TrackingAction::new(session_id, actions_group_id));
                        let was_ended = synchronization.is_ended();
                        match apply(action, synchronization) {
                            Ok(changed) => {
                                ended = changed && !was_ended && synchronization.is_ended();
                                changed
                            }
                            Err(error) => {
                                violation = Some(error);
                                false
                            }
                        }
                    },
                )
                .await?;

            if let Some(error) = violation {
                tracing::warn!(%error, session_id, %actions_group_id, "rejected ledger update");
                return Err(error);
            }
            if update.is_saved {
                outcome.applied.push(actions_group_id.clone());
                outcome.ended |= ended;
                outcome.synchronization = update.second;
            } else if outcome.synchronization.is_none() {
                outcome.synchronization = update.second;
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::SystemTime;

    use cloudsync_core::{
        CoreError, Synchronization, SynchronizationEndStatus, SynchronizationProgress, TargetId,
        TrackingAction,
    };
    use cloudsync_storage::{Entities, MemoryStore};

    use super::TrackingActionLedger;
    use crate::EngineError;

    async fn seeded() -> (Entities, TrackingActionLedger) {
        let entities = Entities::new(Arc::new(MemoryStore::new()));
        let progress = SynchronizationProgress {
            total_atomic_actions_count: 2,
            members: vec!["a".to_owned(), "b".to_owned()],
            ..SynchronizationProgress::default()
        };
        let synchronization = Synchronization::new("S", "a", progress);
        entities
            .add_or_update("S", move |_: Option<Synchronization>| Some(synchronization.clone()))
            .await
            .expect("seed synchronization");
        let mut action = TrackingAction::new("S", "g1");
        action.targets.insert(TargetId::new("b", "n1"));
        entities
            .add_or_update(&TrackingAction::key("S", "g1"), move |_: Option<TrackingAction>| {
                Some(action.clone())
            })
            .await
            .expect("seed action");
        (entities.clone(), TrackingActionLedger::new(entities))
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| (*id).to_owned()).collect()
    }

    #[tokio::test]
    async fn applies_entry_and_synchronization_together() {
        let (entities, ledger) = seeded().await;
        let target = TargetId::new("b", "n1");

        let update = ledger
            .add_or_update("S", &ids(&["g1"]), |action, synchronization| {
                let changed = action.add_success_on_target(&target)?;
                if changed {
                    synchronization.progress.finished_actions_count += 1;
                }
                Ok(changed)
            })
            .await
            .expect("ledger update");

        assert_eq!(update.applied, ids(&["g1"]));
        assert!(!update.ended);
        let synchronization = update.synchronization.expect("synchronization");
        assert_eq!(synchronization.progress.finished_actions_count, 1);

        let stored = entities
            .get::<Synchronization>("S")
            .await
            .expect("get")
            .expect("synchronization");
        assert_eq!(stored.progress.finished_actions_count, 1);
        let action = ledger.get("S", "g1").await.expect("get").expect("action");
        assert!(action.success_targets.contains(&target));
    }

    #[tokio::test]
    async fn unknown_target_is_a_protocol_violation() {
        let (_, ledger) = seeded().await;
        let error = ledger
            .add_or_update("S", &ids(&["g1"]), |action, _| {
                Ok(action.add_success_on_target(&TargetId::new("c", "n9"))?)
            })
            .await
            .expect_err("unknown target");
        assert!(matches!(error, EngineError::Protocol(CoreError::UnknownTarget { .. })));
    }

    #[tokio::test]
    async fn missing_entry_is_created_only_when_applied() {
        let (_, ledger) = seeded().await;

        let update = ledger
            .add_or_update("S", &ids(&["g2"]), |_, _| Ok(false))
            .await
            .expect("ledger update");
        assert!(!update.is_changed());
        assert!(ledger.get("S", "g2").await.expect("get").is_none());

        let update = ledger
            .add_or_update("S", &ids(&["g2"]), |action, _| {
                action.size = Some(10);
                Ok(true)
            })
            .await
            .expect("ledger update");
        assert!(update.is_changed());
        assert!(ledger.get("S", "g2").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn ended_synchronization_freezes_ledger() {
        let (entities, ledger) = seeded().await;
        entities
            .update("S", |synchronization: &mut Synchronization| {
                synchronization.end(SynchronizationEndStatus::Aborted, SystemTime::now())
            })
            .await
            .expect("end");

        let mut calls = 0;
        let update = ledger
            .add_or_update("S", &ids(&["g1", "g2"]), |_, _| {
                calls += 1;
                Ok(true)
            })
            .await
            .expect("ledger update");
        assert_eq!(calls, 0);
        assert!(!update.is_changed());
    }

    #[tokio::test]
    async fn reports_the_mutation_that_ended_the_run() {
        let (_, ledger) = seeded().await;
        let update = ledger
            .add_or_update("S", &ids(&["g1"]), |_, synchronization| {
                Ok(synchronization.end(SynchronizationEndStatus::Success, SystemTime::now()))
            })
            .await
            .expect("ledger update");
        assert!(update.ended);
    }
}
