use crate::bounding_box::Detection;
use std::{fmt, path::Path, str::FromStr, sync::Arc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Failed to load image: {0}")]
    ImageLoad(#[from] image::ImageError),
    #[error("Failed to read image: {0}")]
    Io(#[from] std::io::Error),
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
    #[error("ONNX runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("Unexpected model output: {0}")]
    Output(String),
    #[error("Failed to load model: {0}")]
    Load(String),
}

impl From<ndarray::ShapeError> for DetectorError {
    fn from(err: ndarray::ShapeError) -> Self {
        DetectorError::Output(err.to_string())
    }
}

/// A pretrained object-detection model behind a uniform contract.
///
/// Implementations are loaded once at startup and shared across requests;
/// `detect` blocks for the duration of inference.
pub trait Detector: Send + Sync + 'static {
    fn detect(&self, image_path: &Path) -> Result<Vec<Detection>, DetectorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Dino,
    Yolo,
}

impl ModelKind {
    pub const ALL: [ModelKind; 2] = [ModelKind::Dino, ModelKind::Yolo];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Dino => "DINO",
            ModelKind::Yolo => "YOLO",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Invalid model specified")]
pub struct InvalidModel;

impl FromStr for ModelKind {
    type Err = InvalidModel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "DINO" => Ok(Self::Dino),
            "YOLO" => Ok(Self::Yolo),
            _ => Err(InvalidModel),
        }
    }
}

/// The two loaded detectors, selected per request by `ModelKind`.
#[derive(Clone)]
pub struct Detectors {
    dino: Arc<dyn Detector>,
    yolo: Arc<dyn Detector>,
}

impl Detectors {
    pub fn new(dino: Arc<dyn Detector>, yolo: Arc<dyn Detector>) -> Self {
        Self { dino, yolo }
    }

    pub fn get(&self, kind: ModelKind) -> Arc<dyn Detector> {
        match kind {
            ModelKind::Dino => self.dino.clone(),
            ModelKind::Yolo => self.yolo.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_kind_is_case_insensitive() {
        assert_eq!("DINO".parse::<ModelKind>(), Ok(ModelKind::Dino));
        assert_eq!("dino".parse::<ModelKind>(), Ok(ModelKind::Dino));
        assert_eq!("YoLo".parse::<ModelKind>(), Ok(ModelKind::Yolo));
    }

    #[test]
    fn test_model_kind_rejects_unknown() {
        assert_eq!("detr".parse::<ModelKind>(), Err(InvalidModel));
        assert_eq!(" yolo".parse::<ModelKind>(), Err(InvalidModel));
        assert_eq!("".parse::<ModelKind>(), Err(InvalidModel));
    }
}
