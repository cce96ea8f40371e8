use std::fmt::{Display, Formatter};

/// Name of a notification group on the push channel.
///
/// Every client instance is implicitly in its own group. Each session has a
/// member group and a lobby group for joiners still in the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupName(String);

impl GroupName {
    #[must_use]
    pub fn session(session_id: &str) -> Self {
        Self(format!("session:{session_id}"))
    }

    /// Group of clients waiting on a session they are not yet a member of.
    #[must_use]
    pub fn lobby(session_id: &str) -> Self {
        Self(format!("lobby:{session_id}"))
    }

    #[must_use]
    pub fn client(client_instance_id: &str) -> Self {
        Self(format!("client:{client_instance_id}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for GroupName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::GroupName;

    #[test]
    fn group_kinds_do_not_collide() {
        assert_ne!(GroupName::session("ABC"), GroupName::lobby("ABC"));
        assert_ne!(GroupName::session("ABC"), GroupName::client("ABC"));
        assert_eq!(GroupName::session("ABC").as_str(), "session:ABC");
    }
}
