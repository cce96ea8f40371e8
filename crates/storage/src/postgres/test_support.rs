use sqlx::postgres::PgPoolOptions;

use super::PostgresStore;

pub(super) async fn test_store() -> Option<PostgresStore> {
    let database_url = match std::env::var("DATABASE_URL") {
        Ok(value) => value,
        Err(_) => return None,
    };

    // One schema per test so tests can run in parallel against a shared database.
    let schema = format!("test_{}", uuid::Uuid::new_v4().simple());
    let mut opts: sqlx::postgres::PgConnectOptions =
        database_url.parse().expect("parse DATABASE_URL");
    opts = opts.options([("search_path", schema.as_str())]);
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect_with(opts)
        .await
        .expect("connect test database");
    sqlx::query(&format!("CREATE SCHEMA \"{schema}\""))
        .execute(&pool)
        .await
        .expect("create test schema");

    crate::migrate_with_pool(&pool)
        .await
        .expect("apply migrations");
    Some(PostgresStore::from_pool(pool))
}
