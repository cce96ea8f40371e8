//! Command handlers, one module per command family.
//!
//! A command is decoded from its method name and CBOR params, run against the
//! engine on behalf of an already authenticated [`Client`], and answered with
//! a [`Reply`]. Rejected preconditions are ordinary replies; only protocol
//! violations and infrastructure failures become a [`CommandError`].

use cloudsync_core::protocol::{
    ActionReportParameters, AskJoinParameters, AskPasswordExchangeKeyParameters,
    CloudSessionResult, CreateSessionParameters, FinalizeJoinParameters,
    FinalizeJoinSessionResult, GivePasswordExchangeKeyParameters,
    InformPasswordIsWrongParameters, JoinSessionResult, PathItemParameters, RequestAbortStatus,
    SessionMemberInfo, SetAuthCheckedParameters, StartSynchronizationStatus,
    SynchronizationErrorParameters, UpdateSessionSettingsParameters, ValidateJoinParameters,
};
use cloudsync_core::{
    ActionsGroupDefinition, Client, PathItem, Synchronization, TransferParameters,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{CommandError, Services};

mod join;
mod path_items;
mod sessions;
mod synchronization;
mod transfers;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdParameters {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSynchronizationParameters {
    pub session_id: String,
    pub actions_groups: Vec<ActionsGroupDefinition>,
}

/// Target-side outcome reports; they all record a successful target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionReport {
    LocalCopyIsDone,
    DateIsCopied,
    DirectoryIsCreated,
    FileOrDirectoryIsDeleted,
}

impl ActionReport {
    #[must_use]
    pub fn method(self) -> &'static str {
        match self {
            Self::LocalCopyIsDone => "local_copy_is_done",
            Self::DateIsCopied => "date_is_copied",
            Self::DirectoryIsCreated => "directory_is_created",
            Self::FileOrDirectoryIsDeleted => "file_or_directory_is_deleted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStep {
    FilePartUploaded,
    UploadFinished,
    FilePartDownloaded,
    DownloadFinished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CreateSession(CreateSessionParameters),
    GetSession(SessionIdParameters),
    GetMembers(SessionIdParameters),
    UpdateSessionSettings(UpdateSessionSettingsParameters),
    QuitSession(SessionIdParameters),
    ResetSession(SessionIdParameters),

    AskPasswordExchangeKey(AskPasswordExchangeKeyParameters),
    GivePasswordExchangeKey(GivePasswordExchangeKeyParameters),
    AskJoin(AskJoinParameters),
    ValidateJoin(ValidateJoinParameters),
    InformPasswordIsWrong(InformPasswordIsWrongParameters),
    SetAuthChecked(SetAuthCheckedParameters),
    FinalizeJoin(FinalizeJoinParameters),

    AddPathItem(PathItemParameters),
    RemovePathItem(PathItemParameters),
    GetPathItems(SessionIdParameters),

    StartSynchronization(StartSynchronizationParameters),
    GetSynchronization(SessionIdParameters),
    ReportActions(ActionReport, ActionReportParameters),
    SynchronizationError(SynchronizationErrorParameters),
    SynchronizationErrors(Vec<SynchronizationErrorParameters>),
    RequestSynchronizationAbort(SessionIdParameters),
    MemberHasFinished(SessionIdParameters),

    Transfer(TransferStep, TransferParameters),
}

impl Command {
    /// Builds a command from its wire method name and params.
    pub fn decode(method: &str, params: serde_cbor::Value) -> Result<Self, CommandError> {
        let command = match method {
            "create_session" => Self::CreateSession(params_for(method, params)?),
            "get_session" => Self::GetSession(params_for(method, params)?),
            "get_members" => Self::GetMembers(params_for(method, params)?),
            "update_session_settings" => Self::UpdateSessionSettings(params_for(method, params)?),
            "quit_session" => Self::QuitSession(params_for(method, params)?),
            "reset_session" => Self::ResetSession(params_for(method, params)?),

            "ask_password_exchange_key" => {
                Self::AskPasswordExchangeKey(params_for(method, params)?)
            }
            "give_password_exchange_key" => {
                Self::GivePasswordExchangeKey(params_for(method, params)?)
            }
            "ask_join" => Self::AskJoin(params_for(method, params)?),
            "validate_join" => Self::ValidateJoin(params_for(method, params)?),
            "inform_password_is_wrong" => Self::InformPasswordIsWrong(params_for(method, params)?),
            "set_auth_checked" => Self::SetAuthChecked(params_for(method, params)?),
            "finalize_join" => Self::FinalizeJoin(params_for(method, params)?),

            "add_path_item" => Self::AddPathItem(params_for(method, params)?),
            "remove_path_item" => Self::RemovePathItem(params_for(method, params)?),
            "get_path_items" => Self::GetPathItems(params_for(method, params)?),

            "start_synchronization" => Self::StartSynchronization(params_for(method, params)?),
            "get_synchronization" => Self::GetSynchronization(params_for(method, params)?),
            "local_copy_is_done" => {
                Self::ReportActions(ActionReport::LocalCopyIsDone, params_for(method, params)?)
            }
            "date_is_copied" => {
                Self::ReportActions(ActionReport::DateIsCopied, params_for(method, params)?)
            }
            "directory_is_created" => {
                Self::ReportActions(ActionReport::DirectoryIsCreated, params_for(method, params)?)
            }
            "file_or_directory_is_deleted" => Self::ReportActions(
                ActionReport::FileOrDirectoryIsDeleted,
                params_for(method, params)?,
            ),
            "synchronization_error" => Self::SynchronizationError(params_for(method, params)?),
            "synchronization_errors" => Self::SynchronizationErrors(params_for(method, params)?),
            "request_synchronization_abort" => {
                Self::RequestSynchronizationAbort(params_for(method, params)?)
            }
            "member_has_finished" => Self::MemberHasFinished(params_for(method, params)?),

            "assert_file_part_is_uploaded" => {
                Self::Transfer(TransferStep::FilePartUploaded, params_for(method, params)?)
            }
            "assert_upload_is_finished" => {
                Self::Transfer(TransferStep::UploadFinished, params_for(method, params)?)
            }
            "assert_file_part_is_downloaded" => {
                Self::Transfer(TransferStep::FilePartDownloaded, params_for(method, params)?)
            }
            "assert_download_is_finished" => {
                Self::Transfer(TransferStep::DownloadFinished, params_for(method, params)?)
            }
            _ => return Err(CommandError::MethodNotFound(method.to_owned())),
        };
        Ok(command)
    }
}

fn params_for<T>(method: &str, params: serde_cbor::Value) -> Result<T, CommandError>
where
    T: DeserializeOwned,
{
    serde_cbor::value::from_value(params).map_err(|error| CommandError::InvalidParams {
        method: method.to_owned(),
        message: error.to_string(),
    })
}

/// Result payload of a command. Reads that find nothing answer `NotFound`,
/// which encodes as null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Session(CloudSessionResult),
    Members(Vec<SessionMemberInfo>),
    Join(JoinSessionResult),
    FinalizeJoin(FinalizeJoinSessionResult),
    PathItems(Vec<PathItem>),
    Synchronization(Box<Synchronization>),
    Started(StartSynchronizationStatus),
    Abort(RequestAbortStatus),
    /// Actions groups whose ledger entry changed.
    Applied(Vec<String>),
    Accepted(bool),
    NotFound,
}

impl<T> From<Option<T>> for Reply
where
    Reply: From<T>,
{
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::NotFound, Self::from)
    }
}

impl From<CloudSessionResult> for Reply {
    fn from(value: CloudSessionResult) -> Self {
        Self::Session(value)
    }
}

impl From<Vec<SessionMemberInfo>> for Reply {
    fn from(value: Vec<SessionMemberInfo>) -> Self {
        Self::Members(value)
    }
}

impl From<Vec<PathItem>> for Reply {
    fn from(value: Vec<PathItem>) -> Self {
        Self::PathItems(value)
    }
}

impl From<Synchronization> for Reply {
    fn from(value: Synchronization) -> Self {
        Self::Synchronization(Box::new(value))
    }
}

/// Runs one command for `client`.
pub async fn handle(
    services: &Services,
    client: &Client,
    command: Command,
) -> Result<Reply, CommandError> {
    match command {
        Command::CreateSession(params) => sessions::create(services, client, params).await,
        Command::GetSession(params) => sessions::get(services, client, params).await,
        Command::GetMembers(params) => sessions::members(services, client, params).await,
        Command::UpdateSessionSettings(params) => {
            sessions::update_settings(services, client, params).await
        }
        Command::QuitSession(params) => sessions::quit(services, client, params).await,
        Command::ResetSession(params) => sessions::reset(services, client, params).await,

        Command::AskPasswordExchangeKey(params) => {
            join::ask_password_exchange_key(services, client, params).await
        }
        Command::GivePasswordExchangeKey(params) => {
            join::give_password_exchange_key(services, client, params).await
        }
        Command::AskJoin(params) => join::ask_join(services, client, params).await,
        Command::ValidateJoin(params) => join::validate_join(services, client, params).await,
        Command::InformPasswordIsWrong(params) => {
            join::inform_password_is_wrong(services, client, params).await
        }
        Command::SetAuthChecked(params) => join::set_auth_checked(services, client, params).await,
        Command::FinalizeJoin(params) => join::finalize_join(services, client, params).await,

        Command::AddPathItem(params) => path_items::add(services, client, params).await,
        Command::RemovePathItem(params) => path_items::remove(services, client, params).await,
        Command::GetPathItems(params) => path_items::list(services, client, params).await,

        Command::StartSynchronization(params) => {
            synchronization::start(services, client, params).await
        }
        Command::GetSynchronization(params) => {
            synchronization::get(services, client, params).await
        }
        Command::ReportActions(report, params) => {
            synchronization::report_actions(services, client, report, params).await
        }
        Command::SynchronizationError(params) => {
            synchronization::report_errors(services, client, vec![params]).await
        }
        Command::SynchronizationErrors(params) => {
            synchronization::report_errors(services, client, params).await
        }
        Command::RequestSynchronizationAbort(params) => {
            synchronization::request_abort(services, client, params).await
        }
        Command::MemberHasFinished(params) => {
            synchronization::member_has_finished(services, client, params).await
        }

        Command::Transfer(step, params) => transfers::handle(services, client, step, params).await,
    }
}
