use std::sync::Arc;

use cloudsync_core::Entity;

use crate::{EntityKey, EntityStore, StorageError, StoredEntry, VersionedWrite, WriteOp};

pub const DEFAULT_MAX_UPDATE_ATTEMPTS: u32 = 10;

/// Outcome of a single-entity update.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateResult<E> {
    /// The mutation was accepted and durably written.
    pub is_saved: bool,
    /// The mutation was accepted but only staged in a transaction.
    pub is_waiting_for_transaction: bool,
    /// Saved or staged value, or the current value when the mutation declined.
    pub element: Option<E>,
}

impl<E> UpdateResult<E> {
    pub(crate) fn saved(element: E) -> Self {
        Self {
            is_saved: true,
            is_waiting_for_transaction: false,
            element: Some(element),
        }
    }

    pub(crate) fn staged(element: E) -> Self {
        Self {
            is_saved: false,
            is_waiting_for_transaction: true,
            element: Some(element),
        }
    }

    pub(crate) fn unchanged(element: Option<E>) -> Self {
        Self {
            is_saved: false,
            is_waiting_for_transaction: false,
            element,
        }
    }

    /// Saved now or will be saved at commit.
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        self.is_saved || self.is_waiting_for_transaction
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairUpdate<A, B> {
    pub is_saved: bool,
    pub first: Option<A>,
    pub second: Option<B>,
}

/// Typed access to an [`EntityStore`] with optimistic retries.
///
/// Mutation closures receive the latest stored value and may run several
/// times when another writer wins the race, so they must only touch the value
/// they are given (and locals they fully reassign on every run).
#[derive(Clone)]
pub struct Entities {
    store: Arc<dyn EntityStore>,
    max_attempts: u32,
}

impl Entities {
    #[must_use]
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_UPDATE_ATTEMPTS,
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub async fn ping(&self) -> Result<(), StorageError> {
        self.store.ping().await
    }

    pub async fn get<E: Entity>(&self, id: &str) -> Result<Option<E>, StorageError> {
        let entry = self.store.load(&EntityKey::of::<E>(id)).await?;
        entry.map(|entry| decode(&entry.data)).transpose()
    }

    pub async fn list_ids<E: Entity>(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.store.list_ids(E::KIND, prefix).await
    }

    /// Mutates an existing entity. Returning `false` leaves it untouched.
    pub async fn update<E, F>(&self, id: &str, mut mutate: F) -> Result<UpdateResult<E>, StorageError>
    where
        E: Entity,
        F: FnMut(&mut E) -> bool + Send,
    {
        self.add_or_update(id, |current: Option<E>| {
            let mut element = current?;
            mutate(&mut element).then_some(element)
        })
        .await
    }

    /// Creates or replaces an entity. Returning `None` declines the write.
    pub async fn add_or_update<E, F>(
        &self,
        id: &str,
        mut mutate: F,
    ) -> Result<UpdateResult<E>, StorageError>
    where
        E: Entity,
        F: FnMut(Option<E>) -> Option<E> + Send,
    {
        let key = EntityKey::of::<E>(id);

        for attempt in 1..=self.max_attempts {
            let (version, current) = decode_entry::<E>(self.store.load(&key).await?.as_ref())?;
            let Some(updated) = mutate(current.clone()) else {
                return Ok(UpdateResult::unchanged(current));
            };

            let write = VersionedWrite {
                key: key.clone(),
                expected_version: version,
                op: WriteOp::Put(encode(&updated)?),
            };
            if self.store.write_batch(std::slice::from_ref(&write)).await? {
                return Ok(UpdateResult::saved(updated));
            }
            tracing::debug!(%key, attempt, "entity version conflict, retrying");
        }

        tracing::warn!(%key, attempts = self.max_attempts, "entity update retries exhausted");
        Err(StorageError::RetriesExhausted)
    }

    /// Atomically mutates two entities of possibly different kinds.
    ///
    /// Setting a slot to `None` deletes that entity. Returning `false` declines
    /// the whole update and reports the values as they were loaded.
    pub async fn update_pair<A, B, F>(
        &self,
        first_id: &str,
        second_id: &str,
        mut mutate: F,
    ) -> Result<PairUpdate<A, B>, StorageError>
    where
        A: Entity,
        B: Entity,
        F: FnMut(&mut Option<A>, &mut Option<B>) -> bool + Send,
    {
        let keys = [EntityKey::of::<A>(first_id), EntityKey::of::<B>(second_id)];

        for attempt in 1..=self.max_attempts {
            let mut loaded = self.store.load_many(&keys).await?.into_iter();
            let (first_version, first_loaded) = decode_entry::<A>(loaded.next().flatten().as_ref())?;
            let (second_version, second_loaded) =
                decode_entry::<B>(loaded.next().flatten().as_ref())?;

            let mut first = first_loaded.clone();
            let mut second = second_loaded.clone();
            if !mutate(&mut first, &mut second) {
                return Ok(PairUpdate {
                    is_saved: false,
                    first: first_loaded,
                    second: second_loaded,
                });
            }

            let writes = [
                write_for(&keys[0], first_version, first.as_ref())?,
                write_for(&keys[1], second_version, second.as_ref())?,
            ];
            if self.store.write_batch(&writes).await? {
                return Ok(PairUpdate {
                    is_saved: true,
                    first,
                    second,
                });
            }
            tracing::debug!(first = %keys[0], second = %keys[1], attempt, "entity pair conflict, retrying");
        }

        tracing::warn!(first = %keys[0], second = %keys[1], "entity pair update retries exhausted");
        Err(StorageError::RetriesExhausted)
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

pub(crate) fn encode<E: Entity>(element: &E) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(element).map_err(|error| StorageError::Codec(error.to_string()))
}

pub(crate) fn decode<E: Entity>(data: &[u8]) -> Result<E, StorageError> {
    serde_json::from_slice(data).map_err(|error| StorageError::Codec(error.to_string()))
}

pub(crate) fn decode_entry<E: Entity>(
    entry: Option<&StoredEntry>,
) -> Result<(i64, Option<E>), StorageError> {
    match entry {
        Some(entry) => Ok((entry.version, Some(decode(&entry.data)?))),
        None => Ok((0, None)),
    }
}

fn write_for<E: Entity>(
    key: &EntityKey,
    version: i64,
    element: Option<&E>,
) -> Result<VersionedWrite, StorageError> {
    let op = match element {
        Some(element) => WriteOp::Put(encode(element)?),
        None if version == 0 => WriteOp::Check,
        None => WriteOp::Delete,
    };
    Ok(VersionedWrite {
        key: key.clone(),
        expected_version: version,
        op,
    })
}
