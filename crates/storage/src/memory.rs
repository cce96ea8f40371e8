use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{EntityKey, EntityStore, StorageError, StoredEntry, VersionedWrite, WriteOp};

#[derive(Debug, Clone)]
struct MemoryEntry {
    kind: &'static str,
    id: String,
    version: i64,
    data: Vec<u8>,
}

/// Process-local entity store. Used when no database is configured and by tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn load_many(
        &self,
        keys: &[EntityKey],
    ) -> Result<Vec<Option<StoredEntry>>, StorageError> {
        let entries = self.entries.read().await;
        Ok(keys
            .iter()
            .map(|key| {
                entries.get(&key.storage_key()).map(|entry| StoredEntry {
                    version: entry.version,
                    data: entry.data.clone(),
                })
            })
            .collect())
    }

    async fn write_batch(&self, writes: &[VersionedWrite]) -> Result<bool, StorageError> {
        let mut entries = self.entries.write().await;

        let conflict = writes.iter().any(|write| {
            let current = entries
                .get(&write.key.storage_key())
                .map_or(0, |entry| entry.version);
            current != write.expected_version
        });
        if conflict {
            return Ok(false);
        }

        for write in writes {
            let storage_key = write.key.storage_key();
            match &write.op {
                WriteOp::Put(data) => {
                    entries.insert(
                        storage_key,
                        MemoryEntry {
                            kind: write.key.kind,
                            id: write.key.id.clone(),
                            version: write.expected_version + 1,
                            data: data.clone(),
                        },
                    );
                }
                WriteOp::Delete => {
                    entries.remove(&storage_key);
                }
                WriteOp::Check => {}
            }
        }
        Ok(true)
    }

    async fn list_ids(&self, kind: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        let entries = self.entries.read().await;
        let mut ids: Vec<String> = entries
            .values()
            .filter(|entry| entry.kind == kind && entry.id.starts_with(prefix))
            .map(|entry| entry.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
