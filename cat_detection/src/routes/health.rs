use crate::{detector::ModelKind, server::SharedState};
use axum::{extract::State, response::IntoResponse, response::Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct Health {
    status: &'static str,
    target_label: String,
    models: Vec<&'static str>,
}

/// Detectors are loaded before the listener binds, so a reachable server
/// always serves every model.
pub async fn healthcheck(State(state): State<SharedState>) -> impl IntoResponse {
    Json(Health {
        status: "Available",
        target_label: state.target_label.to_string(),
        models: ModelKind::ALL.iter().map(ModelKind::as_str).collect(),
    })
}
