use std::collections::BTreeSet;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::Entity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientStatus {
    Created,
    Connected,
    Disconnected,
}

/// A running client process, keyed by `client_instance_id`.
///
/// `client_id` is the stable logical owner; one owner may run several
/// instances. Clients are never deleted, only moved between statuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub client_id: String,
    pub client_instance_id: String,
    pub status: ClientStatus,
    pub connection_ids: BTreeSet<String>,
    /// Persisted group names; mirrored into the live broker on connect.
    pub subscribed_groups: BTreeSet<String>,
    pub created_on: SystemTime,
    pub last_seen_on: SystemTime,
}

impl Client {
    #[must_use]
    pub fn new(client_id: impl Into<String>, client_instance_id: impl Into<String>) -> Self {
        let now = SystemTime::now();
        Self {
            client_id: client_id.into(),
            client_instance_id: client_instance_id.into(),
            status: ClientStatus::Created,
            connection_ids: BTreeSet::new(),
            subscribed_groups: BTreeSet::new(),
            created_on: now,
            last_seen_on: now,
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status == ClientStatus::Connected
    }
}

impl Entity for Client {
    const KIND: &'static str = "client";
}
