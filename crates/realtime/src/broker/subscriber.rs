use std::fmt::{Display, Formatter};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub(crate) u64);

impl Display for SubscriberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One live connection of a client instance.
pub trait Subscriber: Send + Sync {
    /// Queues an encoded event. `false` means the connection is gone or full.
    fn send(&self, payload: Arc<[u8]>) -> bool;
    fn connection_id(&self) -> &str;
    fn client_instance_id(&self) -> &str;
    fn is_closed(&self) -> bool;
}
