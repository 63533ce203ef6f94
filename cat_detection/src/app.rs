use crate::{
    config::Config,
    detector::Detectors,
    dino::DinoDetector,
    fetcher::ImageFetcher,
    ort_service::init_runtime,
    server::{HttpServer, SharedState},
    telemetry::Metrics,
    yolo::YoloDetector,
};
use anyhow::Context;
use std::sync::Arc;
use tokio::signal;

/// Loads both models, then serves until SIGINT or SIGTERM.
pub async fn start_app(config: Config) -> anyhow::Result<()> {
    init_runtime(&config.runtime).context("failed to initialize ONNX runtime")?;

    let dino = DinoDetector::new(&config.dino).context("failed to load DINO detector")?;
    tracing::info!("DINO detector ready");
    let yolo = YoloDetector::new(&config.yolo, &config.target_label)
        .context("failed to load YOLO detector")?;
    tracing::info!("YOLO detector ready");

    let state = SharedState {
        detectors: Detectors::new(Arc::new(dino), Arc::new(yolo)),
        fetcher: ImageFetcher::new(&config.fetch).context("failed to build HTTP client")?,
        metrics: Arc::new(Metrics::new().context("failed to set up metrics")?),
        target_label: Arc::from(config.target_label.as_str()),
    };

    let server = HttpServer::new(state, &config.server).await?;
    server
        .run(async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown.");
        })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
