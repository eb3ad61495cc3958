use anyhow::Context;

use journalflow_infra::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    journalflow_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    tracing::info!(
        environment = ?config.environment,
        persistent_stores = config.use_persistent_stores,
        "starting journalflow-api"
    );

    let app = journalflow_api::app::build_app(&config)
        .await
        .context("failed to wire services")?;

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
