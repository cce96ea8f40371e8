use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::broker::{BrokerConfig, BrokerError, Subscriber, SubscriberId};

/// Routes encoded events to the live connections subscribed to a group.
///
/// Group membership is tracked per connection; the client-level helpers apply
/// a change to every connection a client instance currently has open.
pub struct GroupBroker {
    config: BrokerConfig,
    next_subscriber_id: AtomicU64,
    state: RwLock<BrokerState>,
}

impl GroupBroker {
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            next_subscriber_id: AtomicU64::new(1),
            state: RwLock::new(BrokerState::default()),
        }
    }

    pub async fn connection_count(&self, client_instance_id: &str) -> usize {
        let state = self.state.read().await;
        state
            .client_index
            .get(client_instance_id)
            .map_or(0, HashSet::len)
    }

    pub async fn register_subscriber(
        &self,
        subscriber: Arc<dyn Subscriber>,
        groups: &[String],
    ) -> Result<SubscriberId, BrokerError> {
        let client_instance_id = subscriber.client_instance_id().to_owned();
        let mut state = self.state.write().await;
        let current_connections = state
            .client_index
            .get(&client_instance_id)
            .map_or(0, HashSet::len);
        if current_connections >= self.config.max_connections_per_client {
            return Err(BrokerError::TooManyConnections);
        }

        let subscriber_id = SubscriberId(self.next_subscriber_id.fetch_add(1, Ordering::Relaxed));
        state.subscribers.insert(subscriber_id, subscriber);
        state
            .subscriber_client
            .insert(subscriber_id, client_instance_id.clone());
        state
            .client_index
            .entry(client_instance_id)
            .or_default()
            .insert(subscriber_id);
        state.subscriber_groups.insert(subscriber_id, HashSet::new());
        state.join(subscriber_id, groups);

        Ok(subscriber_id)
    }

    pub async fn unregister_subscriber(
        &self,
        subscriber_id: SubscriberId,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.write().await;
        if state.remove_subscriber(subscriber_id) {
            Ok(())
        } else {
            Err(BrokerError::SubscriberNotFound)
        }
    }

    /// Drops every connection of a client instance. Returns how many were removed.
    pub async fn unregister_client(&self, client_instance_id: &str) -> usize {
        let mut state = self.state.write().await;
        let subscriber_ids = state
            .client_index
            .get(client_instance_id)
            .map(|ids| ids.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        subscriber_ids
            .into_iter()
            .filter(|subscriber_id| state.remove_subscriber(*subscriber_id))
            .count()
    }

    /// Replaces the subscriber's groups with exactly `groups`.
    pub async fn set_groups(
        &self,
        subscriber_id: SubscriberId,
        groups: &[String],
    ) -> Result<(), BrokerError> {
        let mut state = self.state.write().await;
        let Some(current) = state.subscriber_groups.get(&subscriber_id) else {
            return Err(BrokerError::SubscriberNotFound);
        };
        let stale: Vec<String> = current
            .iter()
            .filter(|group| !groups.contains(group))
            .cloned()
            .collect();
        state.leave(subscriber_id, &stale);
        state.join(subscriber_id, groups);
        Ok(())
    }

    /// Subscribes every open connection of a client instance. Returns the
    /// number of connections touched; zero when the client is offline.
    pub async fn add_client_groups(&self, client_instance_id: &str, groups: &[String]) -> usize {
        let mut state = self.state.write().await;
        let subscriber_ids = state.client_subscribers(client_instance_id);
        for subscriber_id in &subscriber_ids {
            state.join(*subscriber_id, groups);
        }
        subscriber_ids.len()
    }

    pub async fn remove_client_groups(
        &self,
        client_instance_id: &str,
        groups: &[String],
    ) -> usize {
        let mut state = self.state.write().await;
        let subscriber_ids = state.client_subscribers(client_instance_id);
        for subscriber_id in &subscriber_ids {
            state.leave(*subscriber_id, groups);
        }
        subscriber_ids.len()
    }

    /// Delivers to every connection in `group`, skipping the connections of
    /// `exclude_client` when given.
    pub async fn broadcast_group(
        &self,
        group: &str,
        exclude_client: Option<&str>,
        payload: &[u8],
    ) -> usize {
        let recipients = {
            let state = self.state.read().await;
            state
                .group_index
                .get(group)
                .map(|watchers| state.resolve(watchers.iter().copied()))
                .unwrap_or_default()
        };
        self.deliver(recipients, exclude_client, payload).await
    }

    /// Delivers to every open connection of one client instance.
    pub async fn send_to_client(&self, client_instance_id: &str, payload: &[u8]) -> usize {
        let recipients = {
            let state = self.state.read().await;
            state
                .client_index
                .get(client_instance_id)
                .map(|ids| state.resolve(ids.iter().copied()))
                .unwrap_or_default()
        };
        self.deliver(recipients, None, payload).await
    }

    async fn deliver(
        &self,
        recipients: Vec<(SubscriberId, Arc<dyn Subscriber>)>,
        exclude_client: Option<&str>,
        payload: &[u8],
    ) -> usize {
        if recipients.is_empty() {
            return 0;
        }

        let shared_payload = Arc::<[u8]>::from(payload.to_vec());
        let mut delivered_count = 0;
        let mut stale_subscribers = Vec::new();

        for (subscriber_id, subscriber) in recipients {
            if subscriber.is_closed() {
                stale_subscribers.push(subscriber_id);
                continue;
            }
            if exclude_client == Some(subscriber.client_instance_id()) {
                continue;
            }
            if subscriber.send(Arc::clone(&shared_payload)) {
                delivered_count += 1;
            } else {
                stale_subscribers.push(subscriber_id);
            }
        }

        if !stale_subscribers.is_empty() {
            tracing::debug!(
                stale = stale_subscribers.len(),
                "evicting closed realtime subscribers"
            );
            let mut state = self.state.write().await;
            for subscriber_id in stale_subscribers {
                let _ = state.remove_subscriber(subscriber_id);
            }
        }

        delivered_count
    }
}

#[derive(Default)]
struct BrokerState {
    subscribers: HashMap<SubscriberId, Arc<dyn Subscriber>>,
    subscriber_client: HashMap<SubscriberId, String>,
    subscriber_groups: HashMap<SubscriberId, HashSet<String>>,
    group_index: HashMap<String, HashSet<SubscriberId>>,
    client_index: HashMap<String, HashSet<SubscriberId>>,
}

impl BrokerState {
    fn client_subscribers(&self, client_instance_id: &str) -> Vec<SubscriberId> {
        self.client_index
            .get(client_instance_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    fn resolve(
        &self,
        subscriber_ids: impl Iterator<Item = SubscriberId>,
    ) -> Vec<(SubscriberId, Arc<dyn Subscriber>)> {
        subscriber_ids
            .filter_map(|subscriber_id| {
                self.subscribers
                    .get(&subscriber_id)
                    .map(|subscriber| (subscriber_id, Arc::clone(subscriber)))
            })
            .collect()
    }

    fn join(&mut self, subscriber_id: SubscriberId, groups: &[String]) {
        if let Some(current) = self.subscriber_groups.get_mut(&subscriber_id) {
            current.extend(groups.iter().cloned());
        }
        for group in groups {
            self.group_index
                .entry(group.clone())
                .or_default()
                .insert(subscriber_id);
        }
    }

    fn leave(&mut self, subscriber_id: SubscriberId, groups: &[String]) {
        if let Some(current) = self.subscriber_groups.get_mut(&subscriber_id) {
            for group in groups {
                current.remove(group);
            }
        }
        for group in groups {
            if let Some(watchers) = self.group_index.get_mut(group) {
                watchers.remove(&subscriber_id);
                if watchers.is_empty() {
                    self.group_index.remove(group);
                }
            }
        }
    }

    fn remove_subscriber(&mut self, subscriber_id: SubscriberId) -> bool {
        if self.subscribers.remove(&subscriber_id).is_none() {
            return false;
        }

        if let Some(groups) = self.subscriber_groups.remove(&subscriber_id) {
            for group in groups {
                if let Some(watchers) = self.group_index.get_mut(&group) {
                    watchers.remove(&subscriber_id);
                    if watchers.is_empty() {
                        self.group_index.remove(&group);
                    }
                }
            }
        }

        if let Some(client_instance_id) = self.subscriber_client.remove(&subscriber_id) {
            if let Some(subscribers) = self.client_index.get_mut(&client_instance_id) {
                subscribers.remove(&subscriber_id);
                if subscribers.is_empty() {
                    self.client_index.remove(&client_instance_id);
                }
            }
        }

        true
    }
}
