use cloudsync_core::{Client, TransferParameters};

use super::{Reply, TransferStep};
use crate::{CommandError, Services};

/// File-transfer assertions. Each answers whether it changed anything, except
/// a downloaded part, which answers whether every recipient now has it.
pub(super) async fn handle(
    services: &Services,
    client: &Client,
    step: TransferStep,
    params: TransferParameters,
) -> Result<Reply, CommandError> {
    let transfers = &services.transfers;
    let accepted = match step {
        TransferStep::FilePartUploaded => transfers.file_part_uploaded(client, &params).await?,
        TransferStep::UploadFinished => transfers.upload_finished(client, &params).await?,
        TransferStep::FilePartDownloaded => {
            transfers.file_part_downloaded(client, &params).await?
        }
        TransferStep::DownloadFinished => transfers.download_finished(client, &params).await?,
    };
    Ok(Reply::Accepted(accepted))
}
