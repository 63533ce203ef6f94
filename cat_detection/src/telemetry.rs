use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use prometheus::Registry;
use std::collections::HashSet;

pub struct Metrics {
    detect_requests: Counter<u64>,
    detection_duration: Histogram<u64>,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("cat_detection");
        global::set_meter_provider(provider);

        let detect_requests = meter
            .u64_counter("detect_requests_total")
            .with_description("Detection requests by model and outcome")
            .build();

        let boundaries = generate_boundaries((10, 100, 500, 2000, 10000));

        let detection_duration = meter
            .u64_histogram("detection_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Duration of model inference in milliseconds")
            .build();

        Ok(Metrics {
            detect_requests,
            detection_duration,
            registry,
        })
    }

    pub fn record_request(&self, model: &str, outcome: &str) {
        let attributes = [
            KeyValue::new("model", model.to_string()),
            KeyValue::new("outcome", outcome.to_string()),
        ];
        self.detect_requests.add(1, &attributes);
    }

    pub fn record_detection_duration(&self, duration_ms: u64, model: &str) {
        let attributes = [KeyValue::new("model", model.to_string())];
        self.detection_duration.record(duration_ms, &attributes);
    }
}

/// Histogram boundaries: steps of 10 up to `parts.1`, then 50 up to
/// `parts.2`, 250 up to `parts.3` and 1000 up to `parts.4`.
fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 10;
    let middle_step: usize = 50;
    let end_step: usize = 250;
    let tail_step: usize = 1000;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}
