#![forbid(unsafe_code)]

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    cloudsync_storage::migrate().await?;
    tracing::info!("entity store migrations complete");
    Ok(())
}
