use streamhost_infra::HostConfig;
use streamhost_server::CheckpointBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    streamhost_observability::init();

    let config = HostConfig::from_env()?;
    let backend = CheckpointBackend::from_env(&config);
    tracing::info!(checkpoint_store = backend.name(), "connecting checkpoint store");
    let store = backend.connect().await?;

    streamhost_server::run(config, store, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c; shutting down");
        }
    })
    .await?;

    Ok(())
}
