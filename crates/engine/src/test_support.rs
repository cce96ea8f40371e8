use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use cloudsync_core::protocol::{
    AskJoinParameters, AskPasswordExchangeKeyParameters, CreateSessionParameters,
    FinalizeJoinParameters, FinalizeJoinSessionStatus, GivePasswordExchangeKeyParameters,
    SetAuthCheckedParameters, ValidateJoinParameters,
};
use cloudsync_core::{ActionOperator, ActionsGroupDefinition, Client, PushEvent, TargetId};
use cloudsync_realtime::broker::{BrokerConfig, GroupBroker};
use cloudsync_storage::{
    Entities, EntityKey, EntityStore, MemoryStore, StorageError, StoredEntry, VersionedWrite,
};

use crate::{
    ClientPresence, Connection, SessionRegistry, SynchronizationEngine, SynchronizationPolicy,
    TrackingActionLedger, TransferTracker,
};

pub(crate) const PASSWORD: &str = "finalization-password";

pub(crate) struct Harness {
    pub(crate) entities: Entities,
    pub(crate) presence: ClientPresence,
    pub(crate) synchronizations: SynchronizationEngine,
    pub(crate) sessions: SessionRegistry,
    pub(crate) transfers: TransferTracker,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_policy(SynchronizationPolicy::default())
    }

    pub(crate) fn with_policy(policy: SynchronizationPolicy) -> Self {
        Self::with_entities(Entities::new(Arc::new(MemoryStore::new())), policy)
    }

    pub(crate) fn with_entities(entities: Entities, policy: SynchronizationPolicy) -> Self {
        let broker = Arc::new(GroupBroker::new(BrokerConfig::default()));
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
            synchronizations,
            sessions,
            transfers,
        }
    }

    pub(crate) async fn client(&self, client_instance_id: &str) -> (Client, Connection) {
        let client = self
            .presence
            .register(&format!("owner-{client_instance_id}"), client_instance_id)
            .await
            .expect("register client");
        let connection = self
            .presence
            .connect(client_instance_id, &format!("conn-{client_instance_id}"))
            .await
            .expect("connect client");
        (client, connection)
    }

    pub(crate) async fn create_session(&self, creator: &Client) -> String {
        self.sessions
            .create_session(
                creator,
                CreateSessionParameters {
                    settings: b"settings".to_vec(),
                    creator_public_key: b"creator-key".to_vec(),
                    creator_private_data: Some(b"creator-data".to_vec()),
                },
            )
            .await
            .expect("create session")
            .session_id
    }

    /// Runs the handshake up to the point where only `finalize_join` is left,
    /// with every member having auth-checked the joiner.
    pub(crate) async fn prepare_join(&self, session_id: &str, members: &[&Client], joiner: &Client) {
        let validator = members[0];
        let asked = self
            .sessions
            .ask_password_exchange_key(
                joiner,
                AskPasswordExchangeKeyParameters {
                    session_id: session_id.to_owned(),
                    public_key: b"joiner-key".to_vec(),
                },
            )
            .await
            .expect("ask password exchange key");
        assert!(asked.is_ok(), "{asked:?}");

        let given = self
            .sessions
            .give_password_exchange_key(
                validator,
                GivePasswordExchangeKeyParameters {
                    session_id: session_id.to_owned(),
                    joiner_instance_id: joiner.client_instance_id.clone(),
                    public_key: b"validator-key".to_vec(),
                },
            )
            .await
            .expect("give password exchange key");
        assert!(given.is_ok(), "{given:?}");

        let ask_join = self
            .sessions
            .ask_join(
                joiner,
                AskJoinParameters {
                    session_id: session_id.to_owned(),
                    validator_instance_id: validator.client_instance_id.clone(),
                    encrypted_password: b"encrypted".to_vec(),
                },
            )
            .await
            .expect("ask join");
        assert!(ask_join.is_ok(), "{ask_join:?}");

        let validated = self
            .sessions
            .validate_join(
                validator,
                ValidateJoinParameters {
                    session_id: session_id.to_owned(),
                    joiner_instance_id: joiner.client_instance_id.clone(),
                    finalization_password: PASSWORD.to_owned(),
                },
            )
            .await
            .expect("validate join");
        assert!(validated.is_ok(), "{validated:?}");

        for member in members {
            let checked = self
                .sessions
                .set_auth_checked(
                    member,
                    SetAuthCheckedParameters {
                        session_id: session_id.to_owned(),
                        checked_instance_id: joiner.client_instance_id.clone(),
                    },
                )
                .await
                .expect("set auth checked");
            assert!(checked.is_ok(), "{checked:?}");
        }
    }

    pub(crate) fn finalize_params(&self, session_id: &str, validator: &Client) -> FinalizeJoinParameters {
        FinalizeJoinParameters {
            session_id: session_id.to_owned(),
            validator_instance_id: validator.client_instance_id.clone(),
            finalization_password: PASSWORD.to_owned(),
            encrypted_private_data: b"joiner-data".to_vec(),
        }
    }

    pub(crate) async fn join(&self, session_id: &str, members: &[&Client], joiner: &Client) {
        self.prepare_join(session_id, members, joiner).await;
        let result = self
            .sessions
            .finalize_join(joiner, self.finalize_params(session_id, members[0]))
            .await
            .expect("finalize join");
        assert_eq!(result.status, FinalizeJoinSessionStatus::Success);
    }
}

/// Memory store that refuses the next `refusals` batches touching one
/// entity kind, as if another writer kept winning the race.
pub(crate) struct RefusingStore {
    inner: MemoryStore,
    kind: &'static str,
    refusals: AtomicUsize,
}

impl RefusingStore {
    pub(crate) fn new(kind: &'static str) -> Self {
        Self {
            inner: MemoryStore::new(),
            kind,
            refusals: AtomicUsize::new(0),
        }
    }

    pub(crate) fn refuse(&self, refusals: usize) {
        self.refusals.store(refusals, Ordering::SeqCst);
    }
}

#[async_trait]
impl EntityStore for RefusingStore {
    async fn ping(&self) -> Result<(), StorageError> {
        self.inner.ping().await
    }

    async fn load_many(&self, keys: &[EntityKey]) -> Result<Vec<Option<StoredEntry>>, StorageError> {
        self.inner.load_many(keys).await
    }

    async fn write_batch(&self, writes: &[VersionedWrite]) -> Result<bool, StorageError> {
        let touches_kind = writes.iter().any(|write| write.key.kind == self.kind);
        if touches_kind
            && self
                .refusals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
        {
            return Ok(false);
        }
        self.inner.write_batch(writes).await
    }

    async fn list_ids(&self, kind: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list_ids(kind, prefix).await
    }
}

pub(crate) fn copy_action(
    actions_group_id: &str,
    source: &str,
    targets: &[(&str, &str)],
    size: u64,
) -> ActionsGroupDefinition {
    ActionsGroupDefinition {
        actions_group_id: actions_group_id.to_owned(),
        operator: ActionOperator::Copy,
        source_client_instance_id: Some(source.to_owned()),
        targets: targets
            .iter()
            .map(|(client, node)| TargetId::new(client, node))
            .collect(),
        size: Some(size),
    }
}

/// Decodes every event queued on a connection.
pub(crate) fn drain(connection: &mut Connection) -> Vec<PushEvent> {
    let mut events = Vec::new();
    while let Ok(payload) = connection.receiver.try_recv() {
        events.push(serde_cbor::from_slice(&payload).expect("decode push event"));
    }
    events
}

pub(crate) fn methods(events: &[PushEvent]) -> Vec<&'static str> {
    events.iter().map(PushEvent::method).collect()
}
