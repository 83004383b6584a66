use std::sync::Arc;

use anyhow::{Context, Result};
use facematch_core::{FaceComparator, MatchEngine};
use facematchd::{create_router, AppState, Config};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facematchd starting");

    let config = Config::load()?;
    let comparator = load_comparator(&config)?;
    let engine = MatchEngine::new(config.engine_settings(), comparator)
        .context("initialising match engine")?;

    let state = AppState::new(engine, config.verify_timeout());
    let app = create_router(state, config.max_upload_bytes());

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    tracing::info!(
        addr = %addr,
        storage = %config.storage_dir.display(),
        timeout_secs = config.verify_timeout_secs,
        "facematchd ready"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("facematchd shutting down");
    Ok(())
}

#[cfg(feature = "onnx")]
fn load_comparator(config: &Config) -> Result<Arc<dyn FaceComparator>> {
    let comparator = facematch_core::ArcFaceComparator::load(
        &config.model_dir,
        config.similarity_threshold,
        config.detection_policy(),
    )
    .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
    Ok(Arc::new(comparator))
}

#[cfg(not(feature = "onnx"))]
fn load_comparator(_config: &Config) -> Result<Arc<dyn FaceComparator>> {
    anyhow::bail!("facematchd was built without the `onnx` feature; rebuild with --features onnx")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
}
