//! The five-step join handshake plus its side channels (auth checks and
//! password rejection).

use cloudsync_core::protocol::{
    AskJoinParameters, AskPasswordExchangeKeyParameters, FinalizeJoinParameters,
    GivePasswordExchangeKeyParameters, InformPasswordIsWrongParameters, SetAuthCheckedParameters,
    ValidateJoinParameters,
};
use cloudsync_core::Client;

use super::Reply;
use crate::{CommandError, Services};

pub(super) async fn ask_password_exchange_key(
    services: &Services,
    client: &Client,
    params: AskPasswordExchangeKeyParameters,
) -> Result<Reply, CommandError> {
    let result = services
        .sessions
        .ask_password_exchange_key(client, params)
        .await?;
    Ok(Reply::Join(result))
}

pub(super) async fn give_password_exchange_key(
    services: &Services,
    client: &Client,
    params: GivePasswordExchangeKeyParameters,
) -> Result<Reply, CommandError> {
    let result = services
        .sessions
        .give_password_exchange_key(client, params)
        .await?;
    Ok(Reply::Join(result))
}

pub(super) async fn ask_join(
    services: &Services,
    client: &Client,
    params: AskJoinParameters,
) -> Result<Reply, CommandError> {
    Ok(Reply::Join(services.sessions.ask_join(client, params).await?))
}

pub(super) async fn validate_join(
    services: &Services,
    client: &Client,
    params: ValidateJoinParameters,
) -> Result<Reply, CommandError> {
    Ok(Reply::Join(
        services.sessions.validate_join(client, params).await?,
    ))
}

pub(super) async fn inform_password_is_wrong(
    services: &Services,
    client: &Client,
    params: InformPasswordIsWrongParameters,
) -> Result<Reply, CommandError> {
    let result = services
        .sessions
        .inform_password_is_wrong(client, params)
        .await?;
    Ok(Reply::Join(result))
}

pub(super) async fn set_auth_checked(
    services: &Services,
    client: &Client,
    params: SetAuthCheckedParameters,
) -> Result<Reply, CommandError> {
    Ok(Reply::Join(
        services.sessions.set_auth_checked(client, params).await?,
    ))
}

pub(super) async fn finalize_join(
    services: &Services,
    client: &Client,
    params: FinalizeJoinParameters,
) -> Result<Reply, CommandError> {
    Ok(Reply::FinalizeJoin(
        services.sessions.finalize_join(client, params).await?,
    ))
}
