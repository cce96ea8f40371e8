//! Command parameters and results exchanged between clients and the server.
//!
//! Rejected preconditions are reported through the status enums below rather
//! than as errors; the client decides whether to retry or give up.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::session::{CloudSession, SessionMember};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionParameters {
    pub settings: Vec<u8>,
    pub creator_public_key: Vec<u8>,
    pub creator_private_data: Option<Vec<u8>>,
}

/// Member as seen by the other participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMemberInfo {
    pub client_id: String,
    pub client_instance_id: String,
    pub public_key: Vec<u8>,
    pub encrypted_private_data: Option<Vec<u8>>,
    pub joined_on: SystemTime,
}

impl From<&SessionMember> for SessionMemberInfo {
    fn from(member: &SessionMember) -> Self {
        Self {
            client_id: member.client_id.clone(),
            client_instance_id: member.client_instance_id.clone(),
            public_key: member.public_key.clone(),
            encrypted_private_data: member.encrypted_private_data.clone(),
            joined_on: member.joined_on,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudSessionResult {
    pub session_id: String,
    pub settings: Vec<u8>,
    pub is_activated: bool,
    pub members: Vec<SessionMemberInfo>,
}

impl From<&CloudSession> for CloudSessionResult {
    fn from(session: &CloudSession) -> Self {
        Self {
            session_id: session.session_id.clone(),
            settings: session.settings.clone(),
            is_activated: session.is_activated,
            members: session.members.iter().map(SessionMemberInfo::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskPasswordExchangeKeyParameters {
    pub session_id: String,
    pub public_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GivePasswordExchangeKeyParameters {
    pub session_id: String,
    pub joiner_instance_id: String,
    pub public_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskJoinParameters {
    pub session_id: String,
    pub validator_instance_id: String,
    pub encrypted_password: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateJoinParameters {
    pub session_id: String,
    pub joiner_instance_id: String,
    pub finalization_password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InformPasswordIsWrongParameters {
    pub session_id: String,
    pub joiner_instance_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetAuthCheckedParameters {
    pub session_id: String,
    pub checked_instance_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeJoinParameters {
    pub session_id: String,
    pub validator_instance_id: String,
    pub finalization_password: String,
    pub encrypted_private_data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinSessionStatus {
    ProcessingNormally,
    SessionNotFound,
    SessionAlreadyActivated,
    PrememberNotFound,
    NotAMember,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSessionResult {
    pub status: JoinSessionStatus,
    pub validator_instance_id: Option<String>,
}

impl JoinSessionResult {
    #[must_use]
    pub fn with_status(status: JoinSessionStatus) -> Self {
        Self {
            status,
            validator_instance_id: None,
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == JoinSessionStatus::ProcessingNormally
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalizeJoinSessionStatus {
    Success,
    SessionNotFound,
    SessionAlreadyActivated,
    AuthIsNotChecked,
    PrememberNotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeJoinSessionResult {
    pub status: FinalizeJoinSessionStatus,
    pub session: Option<CloudSessionResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSessionSettingsParameters {
    pub session_id: String,
    pub settings: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathItemParameters {
    pub session_id: String,
    pub code: String,
    pub encrypted_data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartSynchronizationStatus {
    Started,
    AlreadyStarted,
    SessionNotFound,
}

/// Outcome report for `LocalCopyIsDone`, `DateIsCopied`, `DirectoryIsCreated`
/// and `FileOrDirectoryIsDeleted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReportParameters {
    pub session_id: String,
    pub actions_group_ids: Vec<String>,
    pub node_id: Option<String>,
}

/// Error context for `SynchronizationError(s)`. A missing `node_id` reports
/// a failure on the source side of the actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynchronizationErrorParameters {
    pub session_id: String,
    pub actions_group_ids: Vec<String>,
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestAbortStatus {
    Requested,
    AlreadyRequested,
    NotRunning,
}
