mod detect;
mod health;
mod metrics;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/detect", post(detect::detect))
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
}
