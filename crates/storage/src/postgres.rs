#![forbid(unsafe_code)]

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::{EntityKey, EntityStore, StorageError, StoredEntry, VersionedWrite, WriteOp};

#[cfg(test)]
mod test_support;

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPool::connect(database_url).await.map_err(db_error)?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn db_error(error: sqlx::Error) -> StorageError {
    StorageError::Database(error.to_string())
}

#[async_trait]
impl EntityStore for PostgresStore {
    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn load_many(
        &self,
        keys: &[EntityKey],
    ) -> Result<Vec<Option<StoredEntry>>, StorageError> {
        let storage_keys: Vec<String> = keys.iter().map(EntityKey::storage_key).collect();
        let rows = sqlx::query("SELECT key, version, data FROM entities WHERE key = ANY($1)")
            .bind(&storage_keys)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        let mut found = std::collections::HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key").map_err(db_error)?;
            let entry = StoredEntry {
                version: row.try_get("version").map_err(db_error)?,
                data: row.try_get("data").map_err(db_error)?,
            };
            found.insert(key, entry);
        }

        Ok(storage_keys
            .iter()
            .map(|key| found.get(key).cloned())
            .collect())
    }

    async fn write_batch(&self, writes: &[VersionedWrite]) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        for write in writes {
            let key = write.key.storage_key();
            let applied = match &write.op {
                WriteOp::Put(data) if write.expected_version == 0 => {
                    sqlx::query(
                        "INSERT INTO entities (key, kind, id, version, data)
                         VALUES ($1, $2, $3, 1, $4)
                         ON CONFLICT (key) DO NOTHING",
                    )
                    .bind(&key)
                    .bind(write.key.kind)
                    .bind(&write.key.id)
                    .bind(data)
                    .execute(tx.as_mut())
                    .await
                    .map_err(db_error)?
                    .rows_affected()
                        == 1
                }
                WriteOp::Put(data) => {
                    sqlx::query(
                        "UPDATE entities SET version = version + 1, data = $3, updated_at = now()
                         WHERE key = $1 AND version = $2",
                    )
                    .bind(&key)
                    .bind(write.expected_version)
                    .bind(data)
                    .execute(tx.as_mut())
                    .await
                    .map_err(db_error)?
                    .rows_affected()
                        == 1
                }
                WriteOp::Delete => {
                    sqlx::query("DELETE FROM entities WHERE key = $1 AND version = $2")
                        .bind(&key)
                        .bind(write.expected_version)
                        .execute(tx.as_mut())
                        .await
                        .map_err(db_error)?
                        .rows_affected()
                        == 1
                }
                WriteOp::Check => {
                    let version: Option<i64> =
                        sqlx::query_scalar("SELECT version FROM entities WHERE key = $1 FOR UPDATE")
                            .bind(&key)
                            .fetch_optional(tx.as_mut())
                            .await
                            .map_err(db_error)?;
                    version.unwrap_or(0) == write.expected_version
                }
            };

            if !applied {
                tx.rollback().await.map_err(db_error)?;
                return Ok(false);
            }
        }

        tx.commit().await.map_err(db_error)?;
        Ok(true)
    }

    async fn list_ids(&self, kind: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        sqlx::query_scalar::<_, String>(
            "SELECT id FROM entities
             WHERE kind = $1 AND left(id, char_length($2)) = $2
             ORDER BY id",
        )
        .bind(kind)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::test_store;
    use crate::{EntityKey, EntityStore, VersionedWrite, WriteOp};

    fn key(id: &str) -> EntityKey {
        EntityKey {
            kind: "session",
            id: id.to_owned(),
        }
    }

    fn put(id: &str, expected_version: i64, data: &[u8]) -> VersionedWrite {
        VersionedWrite {
            key: key(id),
            expected_version,
            op: WriteOp::Put(data.to_vec()),
        }
    }

    #[tokio::test]
    async fn insert_then_update_bumps_version() {
        let Some(store) = test_store().await else {
            return;
        };

        assert!(store.write_batch(&[put("a", 0, b"one")]).await.unwrap());
        let entry = store.load(&key("a")).await.unwrap().unwrap();
        assert_eq!(entry.version, 1);
        assert_eq!(entry.data, b"one");

        assert!(store.write_batch(&[put("a", 1, b"two")]).await.unwrap());
        let entry = store.load(&key("a")).await.unwrap().unwrap();
        assert_eq!(entry.version, 2);
        assert_eq!(entry.data, b"two");
    }

    #[tokio::test]
    async fn stale_version_rejects_whole_batch() {
        let Some(store) = test_store().await else {
            return;
        };

        assert!(store.write_batch(&[put("a", 0, b"one")]).await.unwrap());
        let applied = store
            .write_batch(&[put("b", 0, b"new"), put("a", 0, b"stale")])
            .await
            .unwrap();
        assert!(!applied);
        assert!(store.load(&key("b")).await.unwrap().is_none());
        assert_eq!(store.load(&key("a")).await.unwrap().unwrap().data, b"one");
    }

    #[tokio::test]
    async fn check_and_delete_respect_versions() {
        let Some(store) = test_store().await else {
            return;
        };

        assert!(store.write_batch(&[put("a", 0, b"one")]).await.unwrap());
        let check_absent = VersionedWrite {
            key: key("a"),
            expected_version: 0,
            op: WriteOp::Check,
        };
        assert!(!store.write_batch(&[check_absent]).await.unwrap());

        let delete = VersionedWrite {
            key: key("a"),
            expected_version: 1,
            op: WriteOp::Delete,
        };
        assert!(store.write_batch(&[delete]).await.unwrap());
        assert!(store.load(&key("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_ids_filters_by_kind_and_prefix() {
        let Some(store) = test_store().await else {
            return;
        };

        assert!(store
            .write_batch(&[put("S1_a", 0, b"1"), put("S1_b", 0, b"2"), put("S2_a", 0, b"3")])
            .await
            .unwrap());
        let ids = store.list_ids("session", "S1_").await.unwrap();
        assert_eq!(ids, vec!["S1_a".to_owned(), "S1_b".to_owned()]);
        assert!(store.list_ids("client", "S1_").await.unwrap().is_empty());
    }
}
