mod bounding_box;
mod detector;
mod dino;
mod fetcher;
mod labels;
mod ort_service;
mod routes;
mod server;
mod telemetry;
mod yolo;

pub mod app;
pub mod config;

pub use app::start_app;
pub use bounding_box::{BoundingBox, Detection};
pub use detector::{Detector, DetectorError, ModelKind};
