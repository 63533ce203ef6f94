use crate::{
    bounding_box::BoundingBox,
    detector::{DetectorError, InvalidModel, ModelKind},
    fetcher::FetchError,
    server::SharedState,
};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Instant};
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Deserialize)]
pub struct DetectionRequest {
    pub model: String,
    pub image_url: String,
}

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("{0}")]
    InvalidBody(String),
    #[error(transparent)]
    InvalidModel(#[from] InvalidModel),
    #[error("Failed to download image: {0}")]
    Fetch(#[from] FetchError),
    #[error("Detection failed: {0}")]
    Detection(#[from] DetectorError),
    #[error("Detection task failed: {0}")]
    Internal(String),
}

impl DetectError {
    fn status_code(&self) -> StatusCode {
        match self {
            DetectError::InvalidBody(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DetectError::InvalidModel(_) | DetectError::Fetch(_) => StatusCode::BAD_REQUEST,
            DetectError::Detection(_) | DetectError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            DetectError::InvalidBody(_) => "invalid_body",
            DetectError::InvalidModel(_) => "invalid_model",
            DetectError::Fetch(_) => "fetch_failed",
            DetectError::Detection(_) | DetectError::Internal(_) => "detection_failed",
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
}

impl IntoResponse for DetectError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let detail = match &self {
            DetectError::Detection(_) | DetectError::Internal(_) => {
                tracing::error!("{}", self);
                "Detection failed".to_string()
            }
            _ => self.to_string(),
        };

        (status, Json(ErrorResponse { detail })).into_response()
    }
}

/// `POST /detect`: validate, download, detect, clean up, respond with
/// `{"<target label>": [boxes]}`.
#[instrument(skip(state, payload))]
pub async fn detect(
    State(state): State<SharedState>,
    payload: Result<Json<DetectionRequest>, JsonRejection>,
) -> Result<Json<HashMap<String, Vec<BoundingBox>>>, DetectError> {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            let err = DetectError::InvalidBody(rejection.body_text());
            state.metrics.record_request("unknown", err.outcome());
            return Err(err);
        }
    };

    let model = request
        .model
        .parse::<ModelKind>()
        .map(|kind| kind.as_str())
        .unwrap_or("invalid");
    let result = run_detection(&state, request).await;
    let outcome = match &result {
        Ok(_) => "success",
        Err(err) => err.outcome(),
    };
    state.metrics.record_request(model, outcome);

    let boxes = result?;
    Ok(Json(HashMap::from([(state.target_label.to_string(), boxes)])))
}

async fn run_detection(
    state: &SharedState,
    request: DetectionRequest,
) -> Result<Vec<BoundingBox>, DetectError> {
    // Reject unknown models before any network or filesystem work.
    let kind: ModelKind = request.model.parse()?;
    let image = state.fetcher.fetch(&request.image_url).await?;

    let detector = state.detectors.get(kind);
    let started = Instant::now();
    // The temporary directory travels with the blocking task so it is removed
    // once inference is done, even when the client has gone away.
    let result = tokio::task::spawn_blocking(move || {
        let detections = detector.detect(image.path());
        let dir = image.dir().to_path_buf();
        if let Err(e) = image.close() {
            tracing::warn!("Failed to remove temporary directory {:?}: {}", dir, e);
        }
        detections
    })
    .await;
    state
        .metrics
        .record_detection_duration(started.elapsed().as_millis() as u64, kind.as_str());

    let detections = result.map_err(|e| DetectError::Internal(e.to_string()))??;

    tracing::debug!("{} returned {} detections", kind, detections.len());
    for (i, detection) in detections.iter().enumerate() {
        tracing::debug!(
            "Detection {}: label={}, confidence={:.3}, bbox=({:.1}, {:.1}, {:.1}, {:.1})",
            i,
            detection.label,
            detection.confidence,
            detection.bbox.x1,
            detection.bbox.y1,
            detection.bbox.x2,
            detection.bbox.y2
        );
    }

    Ok(detections.into_iter().map(|d| d.bbox).collect())
}
