use std::collections::HashMap;

use cloudsync_core::Entity;

use crate::entities::{decode, decode_entry, encode};
use crate::{Entities, EntityKey, StorageError, StoredEntry, UpdateResult, VersionedWrite, WriteOp};

enum Staged {
    /// The mutation no longer applies; the whole transaction aborts.
    Declined,
    Unchanged,
    Put(Vec<u8>),
    Delete,
}

type StagedMutation = Box<dyn FnMut(Option<&[u8]>) -> Result<Staged, StorageError> + Send>;

/// Mutations staged for an all-or-nothing commit.
///
/// Staging only previews a mutation. [`Entities::commit`] reloads every
/// touched entity and re-runs the staged closures in order; if any of them
/// declines against the fresh values nothing is written.
#[derive(Default)]
pub struct Transaction {
    staged: Vec<(EntityKey, StagedMutation)>,
}

impl Transaction {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    fn push(&mut self, key: EntityKey, mutation: StagedMutation) {
        self.staged.push((key, mutation));
    }

    fn keys(&self) -> Vec<EntityKey> {
        let mut keys: Vec<EntityKey> = Vec::with_capacity(self.staged.len());
        for (key, _) in &self.staged {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("keys", &self.keys())
            .finish()
    }
}

struct Working {
    version: i64,
    current: Option<Vec<u8>>,
    dirty: bool,
}

impl Working {
    fn new(entry: Option<StoredEntry>) -> Self {
        match entry {
            Some(entry) => Self {
                version: entry.version,
                current: Some(entry.data),
                dirty: false,
            },
            None => Self {
                version: 0,
                current: None,
                dirty: false,
            },
        }
    }

    fn into_write(self, key: EntityKey) -> VersionedWrite {
        let op = match (self.dirty, self.current) {
            (false, _) => WriteOp::Check,
            (true, Some(data)) => WriteOp::Put(data),
            (true, None) if self.version == 0 => WriteOp::Check,
            (true, None) => WriteOp::Delete,
        };
        VersionedWrite {
            key,
            expected_version: self.version,
            op,
        }
    }
}

impl Entities {
    /// Stages a create-or-replace. The returned element is a preview computed
    /// against the current value.
    pub async fn stage_add_or_update<E, F>(
        &self,
        tx: &mut Transaction,
        id: &str,
        mut mutate: F,
    ) -> Result<UpdateResult<E>, StorageError>
    where
        E: Entity,
        F: FnMut(Option<E>) -> Option<E> + Send + 'static,
    {
        let key = EntityKey::of::<E>(id);
        let (_, current) = decode_entry::<E>(self.store().load(&key).await?.as_ref())?;
        let Some(preview) = mutate(current.clone()) else {
            return Ok(UpdateResult::unchanged(current));
        };

        tx.push(
            key,
            Box::new(move |data: Option<&[u8]>| {
                let current = data.map(decode::<E>).transpose()?;
                match mutate(current) {
                    Some(updated) => Ok(Staged::Put(encode(&updated)?)),
                    None => Ok(Staged::Declined),
                }
            }),
        );
        Ok(UpdateResult::staged(preview))
    }

    pub async fn stage_update<E, F>(
        &self,
        tx: &mut Transaction,
        id: &str,
        mut mutate: F,
    ) -> Result<UpdateResult<E>, StorageError>
    where
        E: Entity,
        F: FnMut(&mut E) -> bool + Send + 'static,
    {
        self.stage_add_or_update(tx, id, move |current: Option<E>| {
            let mut element = current?;
            mutate(&mut element).then_some(element)
        })
        .await
    }

    /// Stages a removal. Removing an absent entity is a no-op, not a decline.
    pub fn stage_delete<E: Entity>(&self, tx: &mut Transaction, id: &str) {
        tx.push(
            EntityKey::of::<E>(id),
            Box::new(|data: Option<&[u8]>| {
                Ok(if data.is_some() {
                    Staged::Delete
                } else {
                    Staged::Unchanged
                })
            }),
        );
    }

    /// Applies every staged mutation atomically.
    ///
    /// Returns `Ok(false)` when a staged mutation declined on re-run, in which
    /// case nothing was written.
    pub async fn commit(&self, mut tx: Transaction) -> Result<bool, StorageError> {
        if tx.is_empty() {
            return Ok(true);
        }
        let keys = tx.keys();

        for attempt in 1..=self.max_attempts() {
            let loaded = self.store().load_many(&keys).await?;
            let mut working: HashMap<EntityKey, Working> = keys
                .iter()
                .cloned()
                .zip(loaded.into_iter().map(Working::new))
                .collect();

            for (key, mutation) in tx.staged.iter_mut() {
                let Some(state) = working.get_mut(&*key) else {
                    continue;
                };
                match mutation(state.current.as_deref())? {
                    Staged::Declined => {
                        tracing::debug!(%key, "staged mutation declined, transaction aborted");
                        return Ok(false);
                    }
                    Staged::Unchanged => {}
                    Staged::Put(data) => {
                        state.current = Some(data);
                        state.dirty = true;
                    }
                    Staged::Delete => {
                        state.current = None;
                        state.dirty = true;
                    }
                }
            }

            let writes: Vec<VersionedWrite> = keys
                .iter()
                .filter_map(|key| working.remove(key).map(|state| state.into_write(key.clone())))
                .collect();
            if self.store().write_batch(&writes).await? {
                return Ok(true);
            }
            tracing::debug!(attempt, entities = keys.len(), "transaction conflict, retrying");
        }

        tracing::warn!(entities = keys.len(), "transaction retries exhausted");
        Err(StorageError::RetriesExhausted)
    }
}
