#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("too many connections for client instance")]
    TooManyConnections,
    #[error("subscriber not found")]
    SubscriberNotFound,
}
