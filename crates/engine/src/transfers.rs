use std::collections::BTreeSet;

use cloudsync_core::{
    Client, CloudSession, PushEvent, SharedFile, SharedFileDefinition, TargetId,
    TransferParameters,
};
use cloudsync_storage::Entities;

use crate::ledger::LedgerUpdate;
use crate::presence::{ClientPresence, PushTarget};
use crate::synchronization::{record_outcome, SynchronizationEngine};
use crate::EngineError;

/// Upload/download progress of shared files, feeding synchronization files
/// into the tracking ledger.
#[derive(Clone)]
pub struct TransferTracker {
    entities: Entities,
    presence: ClientPresence,
    synchronizations: SynchronizationEngine,
}

impl TransferTracker {
    #[must_use]
    pub fn new(
        entities: Entities,
        presence: ClientPresence,
        synchronizations: SynchronizationEngine,
    ) -> Self {
        Self {
            entities,
            presence,
            synchronizations,
        }
    }

    pub async fn get(
        &self,
        session_id: &str,
        shared_file_id: &str,
    ) -> Result<Option<SharedFile>, EngineError> {
        Ok(self
            .entities
            .get(&SharedFile::key(session_id, shared_file_id))
            .await?)
    }

    pub async fn file_part_uploaded(
        &self,
        client: &Client,
        params: &TransferParameters,
    ) -> Result<bool, EngineError> {
        let part_number = params
            .part_number
            .ok_or(EngineError::MissingParameter("part_number"))?;
        ensure_source(client, &params.shared_file)?;
        let recipients = self.recipients_of(params).await?;

        let definition = &params.shared_file;
        let result = self
            .entities
            .add_or_update(&key(params), |current: Option<SharedFile>| {
                let mut file = current
                    .unwrap_or_else(|| SharedFile::new(definition.clone(), recipients.clone()));
                file.uploaded_parts.insert(part_number).then_some(file)
            })
            .await?;
        if !result.is_saved {
            return Ok(false);
        }
        let Some(file) = result.element else {
            return Ok(false);
        };

        self.presence
            .push(
                PushTarget::Clients(file.recipients.into_iter().collect()),
                PushEvent::FilePartUploaded {
                    transfer: params.clone(),
                },
            )
            .await;
        Ok(true)
    }

    /// Closes the upload. For synchronization files the source is recorded
    /// as successful on every carried action and the file length is counted
    /// once as exchanged volume.
    ///
    /// The ledger step also runs when the file is already closed, so a call
    /// repeated after a failed ledger write still records the outcome.
    pub async fn upload_finished(
        &self,
        client: &Client,
        params: &TransferParameters,
    ) -> Result<bool, EngineError> {
        let total_parts = params
            .total_parts
            .ok_or(EngineError::MissingParameter("total_parts"))?;
        ensure_source(client, &params.shared_file)?;
        let recipients = self.recipients_of(params).await?;

        let definition = &params.shared_file;
        let result = self
            .entities
            .add_or_update(&key(params), |current: Option<SharedFile>| {
                let mut file = current
                    .unwrap_or_else(|| SharedFile::new(definition.clone(), recipients.clone()));
                if file.is_upload_finished {
                    return None;
                }
                file.total_parts = Some(total_parts);
                file.is_upload_finished = true;
                Some(file)
            })
            .await?;

        if let (true, Some(file)) = (result.is_saved, result.element) {
            tracing::debug!(
                session_id = %params.session_id,
                shared_file_id = %definition.id,
                total_parts,
                "upload finished"
            );
            self.presence
                .push(
                    PushTarget::Clients(file.recipients.into_iter().collect()),
                    PushEvent::UploadFinished {
                        transfer: params.clone(),
                    },
                )
                .await;
        }

        let mut recorded = false;
        if definition.file_type.is_synchronization() {
            let update = self.record_upload(client, params).await?;
            self.synchronizations.publish(&update).await;
            recorded = update.is_changed();
        }
        Ok(result.is_saved || recorded)
    }

    /// Records a downloaded part. Returns whether every recipient now has it.
    pub async fn file_part_downloaded(
        &self,
        client: &Client,
        params: &TransferParameters,
    ) -> Result<bool, EngineError> {
        let part_number = params
            .part_number
            .ok_or(EngineError::MissingParameter("part_number"))?;
        let downloader = client.client_instance_id.as_str();
        let mut is_recipient = true;
        let mut downloaded_by_all = false;

        let result = self
            .entities
            .update(&key(params), |file: &mut SharedFile| {
                is_recipient = file.recipients.contains(downloader);
                if !is_recipient {
                    return false;
                }
                let inserted = file
                    .downloaded_parts
                    .entry(downloader.to_owned())
                    .or_default()
                    .insert(part_number);
                downloaded_by_all = file.is_part_downloaded_by_all(part_number);
                inserted
            })
            .await?;
        if !is_recipient {
            return Err(not_recipient(client, params));
        }
        if !result.is_saved {
            return Ok(result
                .element
                .is_some_and(|file| file.is_part_downloaded_by_all(part_number)));
        }
        Ok(downloaded_by_all)
    }

    /// Closes a download. For synchronization files the downloader's node is
    /// recorded as a successful target on every carried action it is a
    /// target of.
    pub async fn download_finished(
        &self,
        client: &Client,
        params: &TransferParameters,
    ) -> Result<bool, EngineError> {
        let definition = &params.shared_file;
        let target = if definition.file_type.is_synchronization() {
            let node_id = params.node_id.as_deref().ok_or(EngineError::MissingNodeId)?;
            Some(TargetId::new(&client.client_instance_id, node_id))
        } else {
            None
        };

        let downloader = client.client_instance_id.as_str();
        let mut is_recipient = true;
        let mut already_finished = false;
        let result = self
            .entities
            .update(&key(params), |file: &mut SharedFile| {
                is_recipient = file.recipients.contains(downloader);
                already_finished = file.finished_downloads.contains(downloader);
                is_recipient && file.finished_downloads.insert(downloader.to_owned())
            })
            .await?;
        if !is_recipient {
            return Err(not_recipient(client, params));
        }
        if !result.is_saved && !already_finished {
            return Ok(false);
        }

        // Also runs for an already closed download: the ledger write may
        // have failed after the file was saved.
        let mut recorded = false;
        if let Some(target) = target {
            let policy = *self.synchronizations.policy();
            let update = self
                .synchronizations
                .ledger()
                .add_or_update(
                    &params.session_id,
                    &definition.actions_group_ids,
                    |action, synchronization| {
                        if !action.targets.contains(&target) {
                            return Ok(false);
                        }
                        record_outcome(action, synchronization, &policy, |action| {
                            Ok(action.add_success_on_target(&target)?)
                        })
                    },
                )
                .await?;
            self.synchronizations.publish(&update).await;
            recorded = update.is_changed();
        }
        Ok(result.is_saved || recorded)
    }

    async fn record_upload(
        &self,
        client: &Client,
        params: &TransferParameters,
    ) -> Result<LedgerUpdate, EngineError> {
        let definition = &params.shared_file;
        let Some(volume_carrier) = definition.actions_group_ids.first().cloned() else {
            return Ok(LedgerUpdate::default());
        };
        let source = client.client_instance_id.as_str();
        let uploaded_length = definition.uploaded_file_length;
        let shared_file_id = definition.id.as_str();
        let policy = *self.synchronizations.policy();

        self.synchronizations
            .ledger()
            .add_or_update(
                &params.session_id,
                &definition.actions_group_ids,
                |action, synchronization| {
                    if action.targets.is_empty() {
                        return Ok(false);
                    }
                    let source_recorded = record_outcome(action, synchronization, &policy, |action| {
                        Ok(action.source_client_instance_id.as_deref() == Some(source)
                            && action.set_source_outcome(true))
                    })?;
                    let volume_counted = action.actions_group_id == volume_carrier
                        && action.count_shared_file(shared_file_id);
                    if volume_counted {
                        synchronization.progress.exchanged_volume += uploaded_length;
                    }
                    Ok(source_recorded || volume_counted)
                },
            )
            .await
    }

    /// Recipients already fixed on the stored file, or computed for a new one.
    async fn recipients_of(
        &self,
        params: &TransferParameters,
    ) -> Result<BTreeSet<String>, EngineError> {
        if let Some(file) = self.get(&params.session_id, &params.shared_file.id).await? {
            return Ok(file.recipients);
        }

        let definition = &params.shared_file;
        if definition.file_type.is_synchronization() {
            let ledger = self.synchronizations.ledger();
            let mut recipients = BTreeSet::new();
            for actions_group_id in &definition.actions_group_ids {
                if let Some(action) = ledger.get(&params.session_id, actions_group_id).await? {
                    recipients.extend(
                        action
                            .targets
                            .into_iter()
                            .map(|target| target.client_instance_id),
                    );
                }
            }
            return Ok(recipients);
        }

        Ok(self
            .entities
            .get::<CloudSession>(&params.session_id)
            .await?
            .map(|session| {
                session
                    .member_instance_ids()
                    .into_iter()
                    .filter(|member| *member != definition.source_client_instance_id)
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn key(params: &TransferParameters) -> String {
    SharedFile::key(&params.session_id, &params.shared_file.id)
}

fn ensure_source(client: &Client, definition: &SharedFileDefinition) -> Result<(), EngineError> {
    if definition.source_client_instance_id == client.client_instance_id {
        Ok(())
    } else {
        Err(EngineError::NotActionSource {
            client_instance_id: client.client_instance_id.clone(),
            subject: format!("shared file {}", definition.id),
        })
    }
}

fn not_recipient(client: &Client, params: &TransferParameters) -> EngineError {
    EngineError::NotFileRecipient {
        client_instance_id: client.client_instance_id.clone(),
        shared_file_id: params.shared_file.id.clone(),
    }
}
