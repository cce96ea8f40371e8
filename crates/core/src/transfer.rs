use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::Entity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharedFileType {
    Inventory,
    FullSynchronization,
    DeltaSynchronization,
}

impl SharedFileType {
    #[must_use]
    pub fn is_synchronization(self) -> bool {
        matches!(self, Self::FullSynchronization | Self::DeltaSynchronization)
    }
}

/// Client-declared description of a file moving through blob storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedFileDefinition {
    pub id: String,
    pub session_id: String,
    pub source_client_instance_id: String,
    pub file_type: SharedFileType,
    /// Synchronization actions served by this transfer. A zip bundle can
    /// serve several.
    pub actions_group_ids: Vec<String>,
    pub uploaded_file_length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferParameters {
    pub session_id: String,
    pub shared_file: SharedFileDefinition,
    pub part_number: Option<u32>,
    pub total_parts: Option<u32>,
    /// Node on the reporting client where a downloaded file was applied.
    pub node_id: Option<String>,
}

/// Server-side transfer bookkeeping, keyed by `(sessionId, sharedFileId)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedFile {
    pub definition: SharedFileDefinition,
    pub recipients: BTreeSet<String>,
    pub uploaded_parts: BTreeSet<u32>,
    pub total_parts: Option<u32>,
    pub is_upload_finished: bool,
    pub downloaded_parts: BTreeMap<String, BTreeSet<u32>>,
    pub finished_downloads: BTreeSet<String>,
}

impl SharedFile {
    #[must_use]
    pub fn key(session_id: &str, shared_file_id: &str) -> String {
        format!("{session_id}_{shared_file_id}")
    }

    #[must_use]
    pub fn new(definition: SharedFileDefinition, recipients: BTreeSet<String>) -> Self {
        Self {
            definition,
            recipients,
            uploaded_parts: BTreeSet::new(),
            total_parts: None,
            is_upload_finished: false,
            downloaded_parts: BTreeMap::new(),
            finished_downloads: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn is_part_downloaded_by_all(&self, part_number: u32) -> bool {
        self.recipients.iter().all(|recipient| {
            self.downloaded_parts
                .get(recipient)
                .is_some_and(|parts| parts.contains(&part_number))
        })
    }

    #[must_use]
    pub fn is_fully_downloaded(&self) -> bool {
        self.recipients
            .iter()
            .all(|recipient| self.finished_downloads.contains(recipient))
    }
}

impl Entity for SharedFile {
    const KIND: &'static str = "shared-file";
}
