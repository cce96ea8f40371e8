use cloudsync_core::protocol::{ActionReportParameters, SynchronizationErrorParameters};
use cloudsync_core::Client;

use super::{ActionReport, Reply, SessionIdParameters, StartSynchronizationParameters};
use crate::{CommandError, Services};

pub(super) async fn start(
    services: &Services,
    client: &Client,
    params: StartSynchronizationParameters,
) -> Result<Reply, CommandError> {
    let status = services
        .synchronizations
        .start_synchronization(client, &params.session_id, params.actions_groups)
        .await?;
    Ok(Reply::Started(status))
}

/// The current or last run, readable by session members.
pub(super) async fn get(
    services: &Services,
    client: &Client,
    params: SessionIdParameters,
) -> Result<Reply, CommandError> {
    let is_member = services
        .sessions
        .get_members(client, &params.session_id)
        .await?
        .is_some();
    if !is_member {
        return Ok(Reply::NotFound);
    }
    Ok(services
        .synchronizations
        .get(&params.session_id)
        .await?
        .into())
}

pub(super) async fn report_actions(
    services: &Services,
    client: &Client,
    report: ActionReport,
    params: ActionReportParameters,
) -> Result<Reply, CommandError> {
    let update = services
        .synchronizations
        .on_targets_succeeded(client, &params)
        .await?;
    tracing::debug!(
        method = report.method(),
        session_id = %params.session_id,
        client_instance_id = %client.client_instance_id,
        applied = update.applied.len(),
        "action report"
    );
    Ok(Reply::Applied(update.applied))
}

/// Applies each error report in order. A protocol violation stops at the
/// offending report; the ones before it stay applied.
pub(super) async fn report_errors(
    services: &Services,
    client: &Client,
    reports: Vec<SynchronizationErrorParameters>,
) -> Result<Reply, CommandError> {
    let mut applied = Vec::new();
    for params in &reports {
        let update = services.synchronizations.on_errors(client, params).await?;
        applied.extend(update.applied);
    }
    Ok(Reply::Applied(applied))
}

pub(super) async fn request_abort(
    services: &Services,
    client: &Client,
    params: SessionIdParameters,
) -> Result<Reply, CommandError> {
    let status = services
        .synchronizations
        .request_abort(client, &params.session_id)
        .await?;
    Ok(Reply::Abort(status))
}

pub(super) async fn member_has_finished(
    services: &Services,
    client: &Client,
    params: SessionIdParameters,
) -> Result<Reply, CommandError> {
    let recorded = services
        .synchronizations
        .member_has_finished(client, &params.session_id)
        .await?;
    Ok(Reply::Accepted(recorded))
}
