#![forbid(unsafe_code)]

use std::fmt::{Display, Formatter};

use async_trait::async_trait;
use cloudsync_core::Entity;

mod entities;
mod memory;
pub mod postgres;
mod transaction;

pub use entities::{Entities, PairUpdate, UpdateResult, DEFAULT_MAX_UPDATE_ATTEMPTS};
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use transaction::Transaction;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("optimistic update retries exhausted")]
    RetriesExhausted,
    #[error("entity encoding error: {0}")]
    Codec(String),
    #[error("storage unavailable")]
    Unavailable,
    #[error("database error: {0}")]
    Database(String),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("DATABASE_URL is not set")]
    MissingDatabaseUrl,
}

// ---------------------------------------------------------------------------
// Backend types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub kind: &'static str,
    pub id: String,
}

impl EntityKey {
    #[must_use]
    pub fn of<E: Entity>(id: &str) -> Self {
        Self {
            kind: E::KIND,
            id: id.to_owned(),
        }
    }

    /// Single-column form used by backends as the primary key.
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!("{}/{}", self.kind, self.id)
    }
}

impl Display for EntityKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Raw stored value. Version 0 is reserved for "absent".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub version: i64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put(Vec<u8>),
    Delete,
    /// Writes nothing but still requires the expected version.
    Check,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedWrite {
    pub key: EntityKey,
    pub expected_version: i64,
    pub op: WriteOp,
}

/// Backend contract for the entity store.
///
/// `write_batch` is the only mutation: it applies every write atomically when
/// each key is still at its expected version and returns `Ok(false)` without
/// writing anything otherwise. Retrying is the caller's job (see [`Entities`]).
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn ping(&self) -> Result<(), StorageError>;

    async fn load_many(&self, keys: &[EntityKey])
        -> Result<Vec<Option<StoredEntry>>, StorageError>;

    async fn load(&self, key: &EntityKey) -> Result<Option<StoredEntry>, StorageError> {
        Ok(self
            .load_many(std::slice::from_ref(key))
            .await?
            .into_iter()
            .next()
            .flatten())
    }

    async fn write_batch(&self, writes: &[VersionedWrite]) -> Result<bool, StorageError>;

    /// Ids of every entity of `kind` whose id starts with `prefix`.
    async fn list_ids(&self, kind: &str, prefix: &str) -> Result<Vec<String>, StorageError>;
}

// ---------------------------------------------------------------------------
// Migration helpers
// ---------------------------------------------------------------------------

pub async fn migrate() -> Result<(), StorageError> {
    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| StorageError::MissingDatabaseUrl)?;
    let pool = sqlx::PgPool::connect(&database_url)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
    migrate_with_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn migrate_with_pool(pool: &sqlx::PgPool) -> Result<(), StorageError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|error| StorageError::Migration(error.to_string()))?;
    Ok(())
}
