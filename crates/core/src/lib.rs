#![forbid(unsafe_code)]

use serde::de::DeserializeOwned;
use serde::Serialize;

pub mod client;
pub mod events;
pub mod groups;
pub mod protocol;
pub mod session;
pub mod session_id;
pub mod synchronization;
pub mod tracking;
pub mod transfer;

pub use client::{Client, ClientStatus};
pub use events::PushEvent;
pub use groups::GroupName;
pub use session::{CloudSession, PathItem, SessionMember, SessionPathItems};
pub use synchronization::{
    AbortingSynchronization, ActionOperator, ActionsGroupDefinition, Synchronization,
    SynchronizationEndStatus, SynchronizationProgress, SynchronizationState,
};
pub use tracking::{TargetId, TrackingAction, TrackingActionState};
pub use transfer::{SharedFile, SharedFileDefinition, SharedFileType, TransferParameters};

/// A value persisted by the entity store under `(KIND, id)`.
///
/// Implementations are plain data: the store hands out working copies that are
/// only valid for the duration of one guarded update.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: &'static str;
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid session id")]
    InvalidSessionId,
    #[error("target {target} is not declared on actions group {actions_group_id}")]
    UnknownTarget {
        actions_group_id: String,
        target: String,
    },
}
