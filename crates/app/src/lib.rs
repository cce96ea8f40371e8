#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cloudsync_api::{ApiState, Services};
use cloudsync_engine::{spawn_housekeeping, SynchronizationPolicy, DEFAULT_ABORT_GRACE_PERIOD};
use cloudsync_realtime::broker::{BrokerConfig, GroupBroker};
use cloudsync_storage::{
    migrate_with_pool, Entities, EntityStore, MemoryStore, PostgresStore,
    DEFAULT_MAX_UPDATE_ATTEMPTS,
};
use tokio::sync::watch;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:5380";
const DEFAULT_MAX_CONNECTIONS_PER_CLIENT: usize = 3;
const DEFAULT_HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    /// Without a database the server keeps everything in memory.
    pub database_url: Option<String>,
    pub max_update_attempts: u32,
    pub max_connections_per_client: usize,
    pub abort_grace_period: Duration,
    pub housekeeping_interval: Duration,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_values(|name| std::env::var(name).ok())
    }

    fn from_values(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let listen_addr = lookup("LISTEN_ADDR").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_owned());
        let listen_addr = SocketAddr::from_str(&listen_addr)
            .with_context(|| format!("invalid LISTEN_ADDR {listen_addr:?}"))?;
        let database_url = lookup("DATABASE_URL").filter(|value| !value.trim().is_empty());

        let max_update_attempts = parse_var(
            &lookup,
            "STORE_MAX_UPDATE_ATTEMPTS",
            DEFAULT_MAX_UPDATE_ATTEMPTS,
        )?;
        if max_update_attempts == 0 {
            anyhow::bail!("STORE_MAX_UPDATE_ATTEMPTS must be at least 1");
        }
        let max_connections_per_client = parse_var(
            &lookup,
            "MAX_CONNECTIONS_PER_CLIENT",
            DEFAULT_MAX_CONNECTIONS_PER_CLIENT,
        )?;
        let abort_grace_period = Duration::from_secs(parse_var(
            &lookup,
            "ABORT_GRACE_PERIOD_SECS",
            DEFAULT_ABORT_GRACE_PERIOD.as_secs(),
        )?);
        let housekeeping_interval = Duration::from_secs(parse_var(
            &lookup,
            "HOUSEKEEPING_INTERVAL_SECS",
            DEFAULT_HOUSEKEEPING_INTERVAL.as_secs(),
        )?);
        if housekeeping_interval.is_zero() {
            anyhow::bail!("HOUSEKEEPING_INTERVAL_SECS must be at least 1");
        }

        Ok(Self {
            listen_addr,
            database_url,
            max_update_attempts,
            max_connections_per_client,
            abort_grace_period,
            housekeeping_interval,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {name} {raw:?}")),
    }
}

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let store: Arc<dyn EntityStore> = match &config.database_url {
        Some(database_url) => {
            let store = PostgresStore::connect(database_url).await?;
            migrate_with_pool(store.pool()).await?;
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, state is kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };
    let entities = Entities::new(store).with_max_attempts(config.max_update_attempts);
    let broker = Arc::new(GroupBroker::new(BrokerConfig {
        max_connections_per_client: config.max_connections_per_client,
    }));
    let services = Services::new(
        entities,
        broker,
        SynchronizationPolicy {
            abort_grace_period: config.abort_grace_period,
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let housekeeping = spawn_housekeeping(
        services.synchronizations.clone(),
        config.housekeeping_interval,
        shutdown_rx,
    );

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "server listening");
    let served = axum::serve(listener, cloudsync_api::router(ApiState::new(services))).await;

    let _ = shutdown_tx.send(true);
    let _ = housekeeping.await;
    served?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::AppConfig;

    fn config_from(values: &[(&str, &str)]) -> anyhow::Result<AppConfig> {
        let values: HashMap<String, String> = values
            .iter()
            .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
            .collect();
        AppConfig::from_values(|name| values.get(name).cloned())
    }

    #[test]
    fn from_values_uses_defaults() {
        let config = config_from(&[]).expect("parse config");

        assert_eq!(config.listen_addr.to_string(), "0.0.0.0:5380");
        assert_eq!(config.database_url, None);
        assert_eq!(config.max_update_attempts, 10);
        assert_eq!(config.max_connections_per_client, 3);
        assert_eq!(config.abort_grace_period, Duration::from_secs(300));
        assert_eq!(config.housekeeping_interval, Duration::from_secs(30));
    }

    #[test]
    fn from_values_reads_overrides() {
        let config = config_from(&[
            ("LISTEN_ADDR", "127.0.0.1:6000"),
            ("DATABASE_URL", "postgres://localhost/cloudsync"),
            ("STORE_MAX_UPDATE_ATTEMPTS", "4"),
            ("MAX_CONNECTIONS_PER_CLIENT", "1"),
            ("ABORT_GRACE_PERIOD_SECS", "60"),
            ("HOUSEKEEPING_INTERVAL_SECS", " 5 "),
        ])
        .expect("parse config");

        assert_eq!(config.listen_addr.to_string(), "127.0.0.1:6000");
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/cloudsync")
        );
        assert_eq!(config.max_update_attempts, 4);
        assert_eq!(config.max_connections_per_client, 1);
        assert_eq!(config.abort_grace_period, Duration::from_secs(60));
        assert_eq!(config.housekeeping_interval, Duration::from_secs(5));
    }

    #[test]
    fn blank_database_url_means_in_memory() {
        let config = config_from(&[("DATABASE_URL", "  ")]).expect("parse config");
        assert_eq!(config.database_url, None);
    }

    #[test]
    fn from_values_validates_listen_addr() {
        let error = config_from(&[("LISTEN_ADDR", "not-an-address")])
            .expect_err("invalid listen address should fail");
        assert!(error.to_string().contains("LISTEN_ADDR"));
    }

    #[test]
    fn from_values_rejects_bad_numbers() {
        let error = config_from(&[("ABORT_GRACE_PERIOD_SECS", "soon")])
            .expect_err("non-numeric grace period should fail");
        assert!(error.to_string().contains("ABORT_GRACE_PERIOD_SECS"));

        let error = config_from(&[("STORE_MAX_UPDATE_ATTEMPTS", "0")])
            .expect_err("zero attempts should fail");
        assert!(error.to_string().contains("at least 1"));
    }
}
