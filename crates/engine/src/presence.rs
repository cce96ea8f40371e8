use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::SystemTime;

use cloudsync_core::{Client, ClientStatus, GroupName, PushEvent};
use cloudsync_realtime::broker::{BrokerError, GroupBroker, SubscriberId};
use cloudsync_realtime::channel::{outbound_channel, ChannelSubscriber, OutboundReceiver};
use cloudsync_storage::{Entities, Transaction};

use crate::EngineError;

/// Who receives a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushTarget {
    Client(String),
    Clients(Vec<String>),
    SessionGroup(String),
    /// Joiners still in the handshake for a session.
    LobbyGroup(String),
    /// Session group minus one client instance, to avoid echoing a change to
    /// its originator.
    SessionGroupExcept {
        session_id: String,
        excluded: String,
    },
}

/// Live side of a connected client instance.
pub struct Connection {
    pub connection_id: String,
    pub subscriber_id: SubscriberId,
    pub receiver: OutboundReceiver,
    closed: Arc<AtomicBool>,
}

impl Connection {
    /// Flag the transport sets once the socket is gone.
    #[must_use]
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }
}

/// Persisted client state plus its live group membership.
///
/// Group subscriptions are written to the `Client` entity first and mirrored
/// into the broker only after the write committed.
#[derive(Clone)]
pub struct ClientPresence {
    entities: Entities,
    broker: Arc<GroupBroker>,
}

impl ClientPresence {
    #[must_use]
    pub fn new(entities: Entities, broker: Arc<GroupBroker>) -> Self {
        Self { entities, broker }
    }

    #[must_use]
    pub fn broker(&self) -> &Arc<GroupBroker> {
        &self.broker
    }

    /// Returns the client, creating it on first authentication.
    pub async fn register(
        &self,
        client_id: &str,
        client_instance_id: &str,
    ) -> Result<Client, EngineError> {
        let result = self
            .entities
            .add_or_update(client_instance_id, |current: Option<Client>| match current {
                Some(_) => None,
                None => Some(Client::new(client_id, client_instance_id)),
            })
            .await?;
        if result.is_saved {
            tracing::info!(client_id, client_instance_id, "client registered");
        }
        result
            .element
            .ok_or_else(|| EngineError::UnknownClient(client_instance_id.to_owned()))
    }

    pub async fn get(&self, client_instance_id: &str) -> Result<Option<Client>, EngineError> {
        Ok(self.entities.get::<Client>(client_instance_id).await?)
    }

    /// Opens a live connection and subscribes it to every persisted group
    /// plus the client's own group.
    pub async fn connect(
        &self,
        client_instance_id: &str,
        connection_id: &str,
    ) -> Result<Connection, EngineError> {
        let client = self
            .get(client_instance_id)
            .await?
            .ok_or_else(|| EngineError::UnknownClient(client_instance_id.to_owned()))?;

        let (sender, receiver) = outbound_channel();
        let subscriber = ChannelSubscriber::new(
            connection_id.to_owned(),
            client_instance_id.to_owned(),
            sender,
        );
        let closed = subscriber.closed_flag();
        let subscriber_id = self
            .broker
            .register_subscriber(Arc::new(subscriber), &live_groups(&client))
            .await?;

        let connection = connection_id.to_owned();
        let updated = self
            .entities
            .update(client_instance_id, |client: &mut Client| {
                client.connection_ids.insert(connection.clone());
                client.status = ClientStatus::Connected;
                client.last_seen_on = SystemTime::now();
                true
            })
            .await;
        let client = match updated {
            Ok(result) => result.element,
            Err(error) => {
                let _ = self.broker.unregister_subscriber(subscriber_id).await;
                return Err(error.into());
            }
        };

        // Subscription changes committed since the first read, additions and
        // removals alike.
        if let Some(client) = client {
            let _ = self
                .broker
                .set_groups(subscriber_id, &live_groups(&client))
                .await;
        }

        tracing::debug!(client_instance_id, connection_id, "client connected");
        Ok(Connection {
            connection_id: connection_id.to_owned(),
            subscriber_id,
            receiver,
            closed,
        })
    }

    pub async fn disconnect(
        &self,
        client_instance_id: &str,
        connection: Connection,
    ) -> Result<(), EngineError> {
        match self
            .broker
            .unregister_subscriber(connection.subscriber_id)
            .await
        {
            Ok(()) | Err(BrokerError::SubscriberNotFound) => {}
            Err(error) => return Err(error.into()),
        }

        let connection_id = connection.connection_id;
        self.entities
            .update(client_instance_id, |client: &mut Client| {
                if !client.connection_ids.remove(&connection_id) {
                    return false;
                }
                if client.connection_ids.is_empty() {
                    client.status = ClientStatus::Disconnected;
                }
                client.last_seen_on = SystemTime::now();
                true
            })
            .await?;
        tracing::debug!(client_instance_id, %connection_id, "client disconnected");
        Ok(())
    }

    /// Stages a persisted subscription. Unknown clients stage nothing.
    pub async fn stage_group_subscription(
        &self,
        tx: &mut Transaction,
        client_instance_id: &str,
        group: GroupName,
    ) -> Result<(), EngineError> {
        let group = group.into_string();
        self.entities
            .stage_update(tx, client_instance_id, move |client: &mut Client| {
                client.subscribed_groups.insert(group.clone());
                true
            })
            .await?;
        Ok(())
    }

    pub async fn stage_group_unsubscription(
        &self,
        tx: &mut Transaction,
        client_instance_id: &str,
        group: GroupName,
    ) -> Result<(), EngineError> {
        let group = group.into_string();
        self.entities
            .stage_update(tx, client_instance_id, move |client: &mut Client| {
                client.subscribed_groups.remove(&group);
                true
            })
            .await?;
        Ok(())
    }

    /// Mirrors a committed subscription onto the client's live connections.
    pub async fn join_group(&self, client_instance_id: &str, group: &GroupName) {
        self.broker
            .add_client_groups(client_instance_id, &[group.as_str().to_owned()])
            .await;
    }

    pub async fn leave_group(&self, client_instance_id: &str, group: &GroupName) {
        self.broker
            .remove_client_groups(client_instance_id, &[group.as_str().to_owned()])
            .await;
    }

    /// Sends an event to its target. Returns the number of connections reached.
    pub async fn push(&self, target: PushTarget, event: PushEvent) -> usize {
        let encoded = match serde_cbor::to_vec(&event) {
            Ok(encoded) => encoded,
            Err(error) => {
                tracing::error!(%error, method = event.method(), "failed to encode push event");
                return 0;
            }
        };

        let delivered = match &target {
            PushTarget::Client(client_instance_id) => {
                self.broker.send_to_client(client_instance_id, &encoded).await
            }
            PushTarget::Clients(client_instance_ids) => {
                let mut delivered = 0;
                for client_instance_id in client_instance_ids.iter().collect::<BTreeSet<_>>() {
                    delivered += self.broker.send_to_client(client_instance_id, &encoded).await;
                }
                delivered
            }
            PushTarget::SessionGroup(session_id) => {
                self.broker
                    .broadcast_group(GroupName::session(session_id).as_str(), None, &encoded)
                    .await
            }
            PushTarget::LobbyGroup(session_id) => {
                self.broker
                    .broadcast_group(GroupName::lobby(session_id).as_str(), None, &encoded)
                    .await
            }
            PushTarget::SessionGroupExcept {
                session_id,
                excluded,
            } => {
                self.broker
                    .broadcast_group(
                        GroupName::session(session_id).as_str(),
                        Some(excluded.as_str()),
                        &encoded,
                    )
                    .await
            }
        };
        tracing::trace!(method = event.method(), delivered, "push sent");
        delivered
    }
}

fn live_groups(client: &Client) -> Vec<String> {
    client
        .subscribed_groups
        .iter()
        .cloned()
        .chain(std::iter::once(
            GroupName::client(&client.client_instance_id).into_string(),
        ))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use cloudsync_core::{Client, ClientStatus, GroupName, PushEvent};
    use cloudsync_realtime::broker::{BrokerConfig, GroupBroker};
    use cloudsync_storage::{Entities, MemoryStore, Transaction};

    use super::{ClientPresence, PushTarget};

    fn presence() -> ClientPresence {
        ClientPresence::new(
            Entities::new(Arc::new(MemoryStore::new())),
            Arc::new(GroupBroker::new(BrokerConfig::default())),
        )
    }

    fn wrong_password(session_id: &str) -> PushEvent {
        PushEvent::WrongPassword {
            session_id: session_id.to_owned(),
            validator_instance_id: "validator".to_owned(),
        }
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let presence = presence();
        let first = presence.register("user-a", "instance-a").await.expect("register");
        let second = presence.register("user-a", "instance-a").await.expect("register again");
        assert_eq!(first, second);
        assert_eq!(first.status, ClientStatus::Created);
    }

    #[tokio::test]
    async fn connect_and_disconnect_track_status() {
        let presence = presence();
        presence.register("user-a", "instance-a").await.expect("register");

        let connection = presence.connect("instance-a", "conn-1").await.expect("connect");
        let client = presence.get("instance-a").await.expect("get").expect("client");
        assert_eq!(client.status, ClientStatus::Connected);
        assert!(client.connection_ids.contains("conn-1"));

        presence
            .disconnect("instance-a", connection)
            .await
            .expect("disconnect");
        let client = presence.get("instance-a").await.expect("get").expect("client");
        assert_eq!(client.status, ClientStatus::Disconnected);
        assert!(client.connection_ids.is_empty());
    }

    #[tokio::test]
    async fn connect_requires_registered_client() {
        let presence = presence();
        assert!(presence.connect("ghost", "conn-1").await.is_err());
    }

    #[tokio::test]
    async fn committed_subscription_reaches_live_and_future_connections() {
        let presence = presence();
        presence.register("user-a", "instance-a").await.expect("register");
        let mut live = presence.connect("instance-a", "conn-1").await.expect("connect");

        let group = GroupName::session("S");
        let mut tx = Transaction::new();
        presence
            .stage_group_subscription(&mut tx, "instance-a", group.clone())
            .await
            .expect("stage");
        assert!(presence.entities.commit(tx).await.expect("commit"));
        presence.join_group("instance-a", &group).await;

        let delivered = presence
            .push(PushTarget::SessionGroup("S".to_owned()), wrong_password("S"))
            .await;
        assert_eq!(delivered, 1);
        assert!(live.receiver.try_recv().is_ok());

        let mut later = presence.connect("instance-a", "conn-2").await.expect("connect");
        let delivered = presence
            .push(PushTarget::SessionGroup("S".to_owned()), wrong_password("S"))
            .await;
        assert_eq!(delivered, 2);
        let payload = later.receiver.try_recv().expect("payload");
        let event: PushEvent = serde_cbor::from_slice(&payload).expect("decode");
        assert_eq!(event, wrong_password("S"));
    }

    #[tokio::test]
    async fn session_group_except_skips_originator() {
        let presence = presence();
        for instance in ["instance-a", "instance-b"] {
            presence.register("user", instance).await.expect("register");
        }
        let mut a = presence.connect("instance-a", "conn-a").await.expect("connect");
        let mut b = presence.connect("instance-b", "conn-b").await.expect("connect");
        let group = GroupName::session("S");
        for instance in ["instance-a", "instance-b"] {
            presence.join_group(instance, &group).await;
        }

        let delivered = presence
            .push(
                PushTarget::SessionGroupExcept {
                    session_id: "S".to_owned(),
                    excluded: "instance-a".to_owned(),
                },
                wrong_password("S"),
            )
            .await;
        assert_eq!(delivered, 1);
        assert!(a.receiver.try_recv().is_err());
        assert!(b.receiver.try_recv().is_ok());
    }

    #[tokio::test]
    async fn clients_target_deduplicates_instances() {
        let presence = presence();
        presence.register("user-a", "instance-a").await.expect("register");
        let mut connection = presence.connect("instance-a", "conn-1").await.expect("connect");

        let delivered = presence
            .push(
                PushTarget::Clients(vec!["instance-a".to_owned(), "instance-a".to_owned()]),
                wrong_password("S"),
            )
            .await;
        assert_eq!(delivered, 1);
        assert!(connection.receiver.try_recv().is_ok());
        assert!(connection.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscription_is_persisted() {
        let presence = presence();
        let client: Client = presence.register("user-a", "instance-a").await.expect("register");
        assert!(client.subscribed_groups.is_empty());

        let group = GroupName::session("S");
        let mut tx = Transaction::new();
        presence
            .stage_group_subscription(&mut tx, "instance-a", group.clone())
            .await
            .expect("stage");
        presence.entities.commit(tx).await.expect("commit");

        let mut tx = Transaction::new();
        presence
            .stage_group_unsubscription(&mut tx, "instance-a", group)
            .await
            .expect("stage");
        presence.entities.commit(tx).await.expect("commit");

        let client = presence.get("instance-a").await.expect("get").expect("client");
        assert!(client.subscribed_groups.is_empty());
    }
}
