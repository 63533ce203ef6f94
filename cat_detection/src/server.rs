use crate::{
    config::ServerConfig, detector::Detectors, fetcher::ImageFetcher, routes::api_routes,
    telemetry::Metrics,
};
use axum::Router;
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::{future::Future, sync::Arc};
use tokio::net::TcpListener;

#[derive(Clone)]
pub struct SharedState {
    pub detectors: Detectors,
    pub fetcher: ImageFetcher,
    pub metrics: Arc<Metrics>,
    pub target_label: Arc<str>,
}

pub fn router(state: SharedState) -> Router {
    Router::new().merge(api_routes()).with_state(state)
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(state: SharedState, config: &ServerConfig) -> anyhow::Result<Self> {
        let addr = config.get_address();
        let metrics_layer = HttpMetricsLayerBuilder::new().build();

        let router = router(state).layer(metrics_layer);
        let listener = TcpListener::bind(&addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
