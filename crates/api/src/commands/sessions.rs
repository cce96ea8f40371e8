use cloudsync_core::protocol::{CreateSessionParameters, UpdateSessionSettingsParameters};
use cloudsync_core::Client;

use super::{Reply, SessionIdParameters};
use crate::{CommandError, Services};

pub(super) async fn create(
    services: &Services,
    client: &Client,
    params: CreateSessionParameters,
) -> Result<Reply, CommandError> {
    let session = services.sessions.create_session(client, params).await?;
    Ok(Reply::Session(session))
}

/// Only members get to read a session; anyone else sees it as missing.
pub(super) async fn get(
    services: &Services,
    client: &Client,
    params: SessionIdParameters,
) -> Result<Reply, CommandError> {
    let session = services
        .sessions
        .get_session(&params.session_id)
        .await?
        .filter(|session| {
            session
                .members
                .iter()
                .any(|member| member.client_instance_id == client.client_instance_id)
        });
    Ok(session.into())
}

pub(super) async fn members(
    services: &Services,
    client: &Client,
    params: SessionIdParameters,
) -> Result<Reply, CommandError> {
    Ok(services
        .sessions
        .get_members(client, &params.session_id)
        .await?
        .into())
}

pub(super) async fn update_settings(
    services: &Services,
    client: &Client,
    params: UpdateSessionSettingsParameters,
) -> Result<Reply, CommandError> {
    let updated = services
        .sessions
        .update_session_settings(client, params)
        .await?;
    Ok(Reply::Accepted(updated))
}

pub(super) async fn quit(
    services: &Services,
    client: &Client,
    params: SessionIdParameters,
) -> Result<Reply, CommandError> {
    let quit = services
        .sessions
        .quit_session(client, &params.session_id)
        .await?;
    Ok(Reply::Accepted(quit))
}

pub(super) async fn reset(
    services: &Services,
    client: &Client,
    params: SessionIdParameters,
) -> Result<Reply, CommandError> {
    let reset = services
        .sessions
        .reset_session(client, &params.session_id)
        .await?;
    Ok(Reply::Accepted(reset))
}
