use std::sync::Arc;

use cloudsync_engine::{
    ClientPresence, SessionRegistry, SynchronizationEngine, SynchronizationPolicy,
    TrackingActionLedger, TransferTracker,
};
use cloudsync_realtime::broker::GroupBroker;
use cloudsync_storage::Entities;

/// Every engine component a command handler may need, wired over one store
/// and one broker.
#[derive(Clone)]
pub struct Services {
    pub entities: Entities,
    pub presence: ClientPresence,
    pub sessions: SessionRegistry,
    pub synchronizations: SynchronizationEngine,
    pub transfers: TransferTracker,
}

impl Services {
    #[must_use]
    pub fn new(
        entities: Entities,
        broker: Arc<GroupBroker>,
        policy: SynchronizationPolicy,
    ) -> Self {
        let presence = ClientPresence::new(entities.clone(), broker);
        let ledger = TrackingActionLedger::new(entities.clone());
        let synchronizations =
            SynchronizationEngine::new(entities.clone(), presence.clone(), ledger, policy);
        let sessions =
            SessionRegistry::new(entities.clone(), presence.clone(), synchronizations.clone());
        let transfers =
            TransferTracker::new(entities.clone(), presence.clone(), synchronizations.clone());
        Self {
            entities,
            presence,
            sessions,
            synchronizations,
            transfers,
        }
    }
}
