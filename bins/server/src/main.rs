#![forbid(unsafe_code)]

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = cloudsync_app::AppConfig::from_env()?;
    tracing::info!(
        in_memory = config.database_url.is_none(),
        max_connections_per_client = config.max_connections_per_client,
        "starting cloudsync server"
    );
    cloudsync_app::run(config).await
}
