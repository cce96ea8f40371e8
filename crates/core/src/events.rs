use serde::{Deserialize, Serialize};

use crate::protocol::SessionMemberInfo;
use crate::session::PathItem;
use crate::synchronization::Synchronization;
use crate::transfer::TransferParameters;

/// Notifications pushed to clients after the state they describe is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum PushEvent {
    MemberJoinedSession {
        session_id: String,
        member: SessionMemberInfo,
    },
    MemberQuittedSession {
        session_id: String,
        client_instance_id: String,
    },
    SessionSettingsUpdated {
        session_id: String,
        settings: Vec<u8>,
    },
    SessionResetted {
        session_id: String,
        client_instance_id: String,
    },
    PasswordExchangeKeyRequested {
        session_id: String,
        joiner_instance_id: String,
        public_key: Vec<u8>,
    },
    PasswordExchangeKeyGiven {
        session_id: String,
        validator_instance_id: String,
        public_key: Vec<u8>,
    },
    JoinRequested {
        session_id: String,
        joiner_instance_id: String,
        encrypted_password: Vec<u8>,
    },
    JoinValidated {
        session_id: String,
        validator_instance_id: String,
        finalization_password: String,
    },
    WrongPassword {
        session_id: String,
        validator_instance_id: String,
    },
    PathItemAdded {
        session_id: String,
        item: PathItem,
    },
    PathItemRemoved {
        session_id: String,
        item: PathItem,
    },
    SynchronizationStarted {
        synchronization: Synchronization,
    },
    SynchronizationAbortRequested {
        synchronization: Synchronization,
    },
    SynchronizationProgress {
        synchronization: Synchronization,
    },
    SynchronizationEnded {
        synchronization: Synchronization,
    },
    FilePartUploaded {
        transfer: TransferParameters,
    },
    UploadFinished {
        transfer: TransferParameters,
    },
}

impl PushEvent {
    /// Wire method name, matching the serialized tag.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Self::MemberJoinedSession { .. } => "member_joined_session",
            Self::MemberQuittedSession { .. } => "member_quitted_session",
            Self::SessionSettingsUpdated { .. } => "session_settings_updated",
            Self::SessionResetted { .. } => "session_resetted",
            Self::PasswordExchangeKeyRequested { .. } => "password_exchange_key_requested",
            Self::PasswordExchangeKeyGiven { .. } => "password_exchange_key_given",
            Self::JoinRequested { .. } => "join_requested",
            Self::JoinValidated { .. } => "join_validated",
            Self::WrongPassword { .. } => "wrong_password",
            Self::PathItemAdded { .. } => "path_item_added",
            Self::PathItemRemoved { .. } => "path_item_removed",
            Self::SynchronizationStarted { .. } => "synchronization_started",
            Self::SynchronizationAbortRequested { .. } => "synchronization_abort_requested",
            Self::SynchronizationProgress { .. } => "synchronization_progress",
            Self::SynchronizationEnded { .. } => "synchronization_ended",
            Self::FilePartUploaded { .. } => "file_part_uploaded",
            Self::UploadFinished { .. } => "upload_finished",
        }
    }
}
