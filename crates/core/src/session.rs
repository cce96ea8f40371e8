use std::collections::BTreeSet;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::Entity;

/// A member of a cloud session, or a joiner still in the handshake when held
/// in [`CloudSession::pre_members`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMember {
    pub client_id: String,
    pub client_instance_id: String,
    /// Member that validates this joiner's password during the handshake.
    pub validator_instance_id: Option<String>,
    /// One-time token handed to the joiner by its validator.
    pub finalization_password: Option<String>,
    /// Members that completed the peer auth-check for this client.
    pub auth_checked_by: BTreeSet<String>,
    pub public_key: Vec<u8>,
    pub encrypted_private_data: Option<Vec<u8>>,
    pub joined_on: SystemTime,
}

impl SessionMember {
    #[must_use]
    pub fn new(client_id: &str, client_instance_id: &str, public_key: Vec<u8>) -> Self {
        Self {
            client_id: client_id.to_owned(),
            client_instance_id: client_instance_id.to_owned(),
            validator_instance_id: None,
            finalization_password: None,
            auth_checked_by: BTreeSet::new(),
            public_key,
            encrypted_private_data: None,
            joined_on: SystemTime::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudSession {
    pub session_id: String,
    pub creator_instance_id: String,
    /// Encrypted by the clients; opaque to the server.
    pub settings: Vec<u8>,
    pub members: Vec<SessionMember>,
    pub pre_members: Vec<SessionMember>,
    pub is_activated: bool,
    pub is_removed: bool,
    pub created_on: SystemTime,
}

impl CloudSession {
    #[must_use]
    pub fn new(session_id: &str, settings: Vec<u8>, creator: SessionMember) -> Self {
        Self {
            session_id: session_id.to_owned(),
            creator_instance_id: creator.client_instance_id.clone(),
            settings,
            members: vec![creator],
            pre_members: Vec::new(),
            is_activated: false,
            is_removed: false,
            created_on: SystemTime::now(),
        }
    }

    #[must_use]
    pub fn member(&self, client_instance_id: &str) -> Option<&SessionMember> {
        self.members
            .iter()
            .find(|member| member.client_instance_id == client_instance_id)
    }

    #[must_use]
    pub fn is_member(&self, client_instance_id: &str) -> bool {
        self.member(client_instance_id).is_some()
    }

    #[must_use]
    pub fn pre_member(&self, client_instance_id: &str) -> Option<&SessionMember> {
        self.pre_members
            .iter()
            .find(|member| member.client_instance_id == client_instance_id)
    }

    pub fn pre_member_mut(&mut self, client_instance_id: &str) -> Option<&mut SessionMember> {
        self.pre_members
            .iter_mut()
            .find(|member| member.client_instance_id == client_instance_id)
    }

    #[must_use]
    pub fn member_instance_ids(&self) -> Vec<String> {
        self.members
            .iter()
            .map(|member| member.client_instance_id.clone())
            .collect()
    }

    /// True when every current member has completed the auth-check for `joiner`.
    #[must_use]
    pub fn is_auth_checked(&self, joiner: &SessionMember) -> bool {
        self.members
            .iter()
            .all(|member| joiner.auth_checked_by.contains(&member.client_instance_id))
    }

    /// Removes a member and its pending handshakes. Marks the session removed
    /// once nobody is left. Returns whether the member was present.
    pub fn remove_member(&mut self, client_instance_id: &str) -> bool {
        let before = self.members.len();
        self.members
            .retain(|member| member.client_instance_id != client_instance_id);
        let removed = self.members.len() != before;

        self.pre_members.retain(|member| {
            member.client_instance_id != client_instance_id
                && member.validator_instance_id.as_deref() != Some(client_instance_id)
        });
        for pre_member in &mut self.pre_members {
            pre_member.auth_checked_by.remove(client_instance_id);
        }

        if self.members.is_empty() {
            self.is_removed = true;
        }
        removed
    }
}

impl Entity for CloudSession {
    const KIND: &'static str = "session";
}

/// An encrypted data-source declaration owned by one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathItem {
    pub code: String,
    pub client_instance_id: String,
    pub encrypted_data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPathItems {
    pub session_id: String,
    pub items: Vec<PathItem>,
}

impl SessionPathItems {
    #[must_use]
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_owned(),
            items: Vec::new(),
        }
    }

    /// Removes and returns every item owned by `client_instance_id`.
    pub fn remove_owned_by(&mut self, client_instance_id: &str) -> Vec<PathItem> {
        let (removed, kept) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|item| item.client_instance_id == client_instance_id);
        self.items = kept;
        removed
    }
}

impl Entity for SessionPathItems {
    const KIND: &'static str = "path-items";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with(members: &[&str]) -> CloudSession {
        let mut session = CloudSession::new(
            "ABCDEFGH2",
            Vec::new(),
            SessionMember::new("owner", members[0], Vec::new()),
        );
        for instance in &members[1..] {
            session
                .members
                .push(SessionMember::new("owner", instance, Vec::new()));
        }
        session
    }

    #[test]
    fn removing_last_member_marks_session_removed() {
        let mut session = session_with(&["a"]);
        assert!(session.remove_member("a"));
        assert!(session.is_removed);
        assert!(!session.remove_member("a"));
    }

    #[test]
    fn removing_member_drops_its_validations_and_auth_checks() {
        let mut session = session_with(&["a", "b"]);
        let mut validated_by_a = SessionMember::new("c", "c", Vec::new());
        validated_by_a.validator_instance_id = Some("a".to_owned());
        let mut checked_by_a = SessionMember::new("d", "d", Vec::new());
        checked_by_a.validator_instance_id = Some("b".to_owned());
        checked_by_a.auth_checked_by.insert("a".to_owned());
        session.pre_members = vec![validated_by_a, checked_by_a];

        assert!(session.remove_member("a"));
        assert!(!session.is_removed);
        assert_eq!(session.pre_members.len(), 1);
        assert!(session.pre_members[0].auth_checked_by.is_empty());
    }

    #[test]
    fn auth_check_requires_every_member() {
        let session = session_with(&["a", "b"]);
        let mut joiner = SessionMember::new("c", "c", Vec::new());
        joiner.auth_checked_by.insert("a".to_owned());
        assert!(!session.is_auth_checked(&joiner));
        joiner.auth_checked_by.insert("b".to_owned());
        assert!(session.is_auth_checked(&joiner));
    }

    #[test]
    fn remove_owned_by_partitions_items() {
        let mut items = SessionPathItems::new("ABCDEFGH2");
        for (code, owner) in [("A1", "a"), ("B1", "b"), ("A2", "a")] {
            items.items.push(PathItem {
                code: code.to_owned(),
                client_instance_id: owner.to_owned(),
                encrypted_data: Vec::new(),
            });
        }
        let removed = items.remove_owned_by("a");
        assert_eq!(removed.len(), 2);
        assert_eq!(items.items.len(), 1);
        assert_eq!(items.items[0].code, "B1");
    }
}
