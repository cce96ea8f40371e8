use cloudsync_core::CoreError;
use cloudsync_realtime::broker::BrokerError;
use cloudsync_storage::StorageError;

/// Failures surfaced by engine operations.
///
/// Rejected preconditions are not errors: they come back as status values.
/// What ends up here is either a protocol violation by the calling client or
/// an infrastructure failure.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error(transparent)]
    Protocol(#[from] CoreError),
    #[error("action report is missing its node id")]
    MissingNodeId,
    #[error("{0} is required")]
    MissingParameter(&'static str),
    #[error("client instance {client_instance_id} is not the source of {subject}")]
    NotActionSource {
        client_instance_id: String,
        subject: String,
    },
    #[error("client instance {client_instance_id} is not a member of session {session_id}")]
    NotSessionMember {
        client_instance_id: String,
        session_id: String,
    },
    #[error("client instance {client_instance_id} is not a recipient of shared file {shared_file_id}")]
    NotFileRecipient {
        client_instance_id: String,
        shared_file_id: String,
    },
    #[error("unknown client instance {0}")]
    UnknownClient(String),
    #[error("no free session id found")]
    SessionIdExhausted,
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl EngineError {
    /// True for errors caused by the caller breaking the command contract.
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_)
                | Self::MissingNodeId
                | Self::MissingParameter(_)
                | Self::NotActionSource { .. }
                | Self::NotSessionMember { .. }
                | Self::NotFileRecipient { .. }
        )
    }
}
