use cloudsync_core::protocol::PathItemParameters;
use cloudsync_core::Client;

use super::{Reply, SessionIdParameters};
use crate::{CommandError, Services};

pub(super) async fn add(
    services: &Services,
    client: &Client,
    params: PathItemParameters,
) -> Result<Reply, CommandError> {
    Ok(Reply::Accepted(
        services.sessions.add_path_item(client, params).await?,
    ))
}

pub(super) async fn remove(
    services: &Services,
    client: &Client,
    params: PathItemParameters,
) -> Result<Reply, CommandError> {
    Ok(Reply::Accepted(
        services.sessions.remove_path_item(client, params).await?,
    ))
}

pub(super) async fn list(
    services: &Services,
    client: &Client,
    params: SessionIdParameters,
) -> Result<Reply, CommandError> {
    Ok(services
        .sessions
        .get_path_items(client, &params.session_id)
        .await?
        .into())
}
