use crate::{
    bounding_box::{non_maximum_suppression, BoundingBox, Detection},
    config::{Validatable, YoloConfig},
    detector::{Detector, DetectorError},
    labels::load_class_labels,
    ort_service::SessionPool,
};
use image::imageops::FilterType;
use ndarray::{Array, ArrayD, ArrayViewD, Axis, Ix3, Ix4};
use ort::{session::Session, value::TensorRef};
use std::path::Path;

const OUTPUT_NAME: &str = "output0";

const PAD_VALUE: f32 = 114. / 255.;

/// Geometry of fitting an image into a square model input without
/// distorting it: uniform `scale`, then centered padding.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
    resized_width: u32,
    resized_height: u32,
    img_width: u32,
    img_height: u32,
}

impl Letterbox {
    fn new(img_width: u32, img_height: u32, input_size: u32) -> Self {
        let size = input_size as f32;
        let scale = (size / img_width as f32).min(size / img_height as f32);
        let resized_width = ((img_width as f32 * scale).round() as u32).clamp(1, input_size);
        let resized_height = ((img_height as f32 * scale).round() as u32).clamp(1, input_size);

        Self {
            scale,
            pad_x: (input_size - resized_width) / 2,
            pad_y: (input_size - resized_height) / 2,
            resized_width,
            resized_height,
            img_width,
            img_height,
        }
    }

    /// Maps a center-format box in model input space back to clamped
    /// original image pixels.
    fn to_original(&self, cx: f32, cy: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox::from_center(
            (cx - self.pad_x as f32) / self.scale,
            (cy - self.pad_y as f32) / self.scale,
            w / self.scale,
            h / self.scale,
        )
        .clamp(self.img_width as f32, self.img_height as f32)
    }
}

/// Decodes the image at `image_path` and letterboxes it into a 1x3xSxS
/// tensor scaled to [0, 1], padded with gray.
fn transform_image(
    image_path: &Path,
    input_size: u32,
) -> Result<(Array<f32, Ix4>, Letterbox), DetectorError> {
    let original_img = image::ImageReader::open(image_path)?
        .with_guessed_format()?
        .decode()?;

    let letterbox = Letterbox::new(original_img.width(), original_img.height(), input_size);
    let img = original_img
        .resize_exact(
            letterbox.resized_width,
            letterbox.resized_height,
            FilterType::CatmullRom,
        )
        .to_rgb8();

    let size = input_size as usize;
    let mut input = Array::from_elem((1, 3, size, size), PAD_VALUE);
    for (x, y, pixel) in img.enumerate_pixels() {
        let x = (x + letterbox.pad_x) as usize;
        let y = (y + letterbox.pad_y) as usize;
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    Ok((input, letterbox))
}

fn run_inference(session: &mut Session, input: &Array<f32, Ix4>) -> Result<ArrayD<f32>, DetectorError> {
    let tensor_ref = TensorRef::from_array_view(input.view())?;
    let outputs = session.run(ort::inputs![tensor_ref])?;

    let output = outputs
        .get(OUTPUT_NAME)
        .ok_or_else(|| DetectorError::Output(format!("missing `{}` tensor", OUTPUT_NAME)))?;

    Ok(output.try_extract_array::<f32>()?.to_owned())
}

/// Parses a `1 x (4 + classes) x candidates` output into detections in
/// original image pixels. Candidates whose best class score is below
/// `min_probability` are dropped.
fn decode_output(
    output: ArrayViewD<f32>,
    labels: &[String],
    letterbox: &Letterbox,
    min_probability: f32,
) -> Result<Vec<Detection>, DetectorError> {
    let output = output.into_dimensionality::<Ix3>()?;
    let output = output.index_axis(Axis(0), 0);

    if output.shape()[0] <= 4 {
        return Err(DetectorError::Output(format!(
            "expected at least 5 rows per candidate, got {}",
            output.shape()[0]
        )));
    }

    let mut detections = Vec::new();
    for candidate in output.axis_iter(Axis(1)) {
        let Some((class_id, prob)) = candidate
            .iter()
            .skip(4)
            .copied()
            .enumerate()
            .reduce(|accum, item| if item.1 > accum.1 { item } else { accum })
        else {
            continue;
        };

        if prob < min_probability {
            continue;
        }

        let label = labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("Unknown class {}", class_id));

        let bbox = letterbox.to_original(candidate[0], candidate[1], candidate[2], candidate[3]);

        detections.push(Detection {
            bbox,
            confidence: prob,
            label,
        });
    }

    Ok(detections)
}

/// NMS, then at most `max_detections` of the strongest survivors across all
/// classes, then only those labeled `target_label`.
fn postprocess(
    detections: Vec<Detection>,
    iou_threshold: f32,
    max_detections: usize,
    target_label: &str,
) -> Vec<Detection> {
    let mut detections = non_maximum_suppression(detections, iou_threshold);
    detections.truncate(max_detections);

    tracing::debug!(
        "YOLO kept {} detections before filtering on `{}`",
        detections.len(),
        target_label
    );

    detections
        .into_iter()
        .filter(|detection| detection.label == target_label)
        .collect()
}

/// General-purpose detector whose output is narrowed to one class label.
pub struct YoloDetector {
    pool: SessionPool,
    labels: Vec<String>,
    target_label: String,
    input_size: u32,
    min_probability: f32,
    iou_threshold: f32,
    max_detections: usize,
}

impl YoloDetector {
    pub fn new(config: &YoloConfig, target_label: &str) -> Result<Self, DetectorError> {
        let labels = load_class_labels(&config.get_labels_path())
            .map_err(|e| DetectorError::Load(format!("failed to load labels: {}", e)))?;
        if !labels.iter().any(|label| label == target_label) {
            tracing::warn!(
                "Target label `{}` is not among the {} YOLO class labels",
                target_label,
                labels.len()
            );
        }

        let pool = SessionPool::new(&config.get_path(), config.num_instances)?;

        Ok(Self {
            pool,
            labels,
            target_label: target_label.to_string(),
            input_size: config.input_size,
            min_probability: config.min_probability,
            iou_threshold: config.iou_threshold,
            max_detections: config.max_detections,
        })
    }
}

impl Detector for YoloDetector {
    fn detect(&self, image_path: &Path) -> Result<Vec<Detection>, DetectorError> {
        let (input, letterbox) = transform_image(image_path, self.input_size)?;
        let output = self
            .pool
            .with_session(|session| run_inference(session, &input))?;

        let detections = decode_output(output.view(), &self.labels, &letterbox, self.min_probability)?;

        Ok(postprocess(
            detections,
            self.iou_threshold,
            self.max_detections,
            &self.target_label,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use ndarray::Array3;

    fn labels() -> Vec<String> {
        vec!["person".to_string(), "cat".to_string(), "dog".to_string()]
    }

    /// Builds a `1 x 7 x n` output from `(cx, cy, w, h, [scores; 3])` rows.
    fn output_from(candidates: &[(f32, f32, f32, f32, [f32; 3])]) -> ArrayD<f32> {
        let mut output = Array3::<f32>::zeros((1, 7, candidates.len()));
        for (i, (cx, cy, w, h, scores)) in candidates.iter().enumerate() {
            output[[0, 0, i]] = *cx;
            output[[0, 1, i]] = *cy;
            output[[0, 2, i]] = *w;
            output[[0, 3, i]] = *h;
            for (c, score) in scores.iter().enumerate() {
                output[[0, 4 + c, i]] = *score;
            }
        }
        output.into_dyn()
    }

    #[test]
    fn test_transform_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp_image.jpg");
        // Saved as PNG under a .jpg name: the decoder must sniff the format.
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(100, 50, Rgb([255, 0, 0]));
        img.save_with_format(&path, image::ImageFormat::Png).unwrap();

        let (input, letterbox) = transform_image(&path, 640).unwrap();

        assert_eq!(input.shape(), &[1, 3, 640, 640]);
        assert_eq!((letterbox.img_width, letterbox.img_height), (100, 50));
        assert_eq!((letterbox.resized_width, letterbox.resized_height), (640, 320));
        assert_eq!((letterbox.pad_x, letterbox.pad_y), (0, 160));
        // Padding band above the image.
        assert!((input[[0, 0, 10, 10]] - PAD_VALUE).abs() < 1e-6);
        assert!((input[[0, 1, 10, 10]] - PAD_VALUE).abs() < 1e-6);
        // Inside the image.
        assert!((input[[0, 0, 320, 10]] - 1.0).abs() < 1e-6);
        assert_eq!(input[[0, 1, 320, 10]], 0.0);
    }

    #[test]
    fn test_transform_image_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp_image.jpg");
        std::fs::write(&path, b"<html>not an image</html>").unwrap();

        assert!(matches!(
            transform_image(&path, 640),
            Err(DetectorError::ImageLoad(_))
        ));
    }

    #[test]
    fn test_letterbox_keeps_aspect_ratio() {
        let letterbox = Letterbox::new(480, 640, 640);
        assert_eq!(letterbox.scale, 1.0);
        assert_eq!((letterbox.resized_width, letterbox.resized_height), (480, 640));
        assert_eq!((letterbox.pad_x, letterbox.pad_y), (80, 0));

        let square = Letterbox::new(1280, 1280, 640);
        assert_eq!(square.scale, 0.5);
        assert_eq!((square.pad_x, square.pad_y), (0, 0));
    }

    #[test]
    fn test_decode_output_scales_to_image_pixels() {
        let output = output_from(&[
            (320., 320., 64., 128., [0.1, 0.9, 0.0]),
            (100., 100., 10., 10., [0.2, 0.1, 0.1]),
        ]);
        // 1280x320 fits as 640x160 with 240 rows of padding above it.
        let letterbox = Letterbox::new(1280, 320, 640);

        let detections = decode_output(output.view(), &labels(), &letterbox, 0.25).unwrap();

        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].label, "cat");
        assert_eq!(detections[0].confidence, 0.9);
        assert_eq!(detections[0].bbox, BoundingBox::new(576., 32., 704., 288.));
    }

    #[test]
    fn test_decode_output_rejects_bad_shape() {
        let letterbox = Letterbox::new(640, 640, 640);
        let output = Array3::<f32>::zeros((1, 4, 10)).into_dyn();
        assert!(decode_output(output.view(), &labels(), &letterbox, 0.25).is_err());

        let output = ndarray::Array2::<f32>::zeros((7, 10)).into_dyn();
        assert!(decode_output(output.view(), &labels(), &letterbox, 0.25).is_err());
    }

    #[test]
    fn test_unknown_class_index_gets_placeholder_label() {
        let output = output_from(&[(10., 10., 4., 4., [0.0, 0.0, 0.8])]);
        let short_labels = vec!["person".to_string()];

        let letterbox = Letterbox::new(640, 640, 640);
        let detections = decode_output(output.view(), &short_labels, &letterbox, 0.25).unwrap();
        assert_eq!(detections[0].label, "Unknown class 2");
    }

    #[test]
    fn test_only_target_label_survives() {
        let output = output_from(&[
            (100., 100., 50., 50., [0.95, 0.0, 0.0]),
            (300., 300., 50., 50., [0.0, 0.8, 0.0]),
            (500., 500., 50., 50., [0.0, 0.0, 0.7]),
            (302., 302., 50., 50., [0.0, 0.6, 0.0]),
        ]);

        let letterbox = Letterbox::new(640, 640, 640);
        let detections = decode_output(output.view(), &labels(), &letterbox, 0.25).unwrap();
        let cats = postprocess(detections, 0.7, 300, "cat");

        assert_eq!(cats.len(), 1);
        assert!(cats.iter().all(|d| d.label == "cat"));
        assert_eq!(cats[0].confidence, 0.8);
    }

    #[test]
    fn test_detection_cap_applies_before_label_filter() {
        let output = output_from(&[
            (100., 100., 20., 20., [0.9, 0.0, 0.0]),
            (200., 200., 20., 20., [0.0, 0.8, 0.0]),
            (300., 300., 20., 20., [0.0, 0.7, 0.0]),
        ]);
        let letterbox = Letterbox::new(640, 640, 640);
        let detections = decode_output(output.view(), &labels(), &letterbox, 0.25).unwrap();

        let cats = postprocess(detections, 0.7, 2, "cat");

        assert_eq!(cats.len(), 1);
        assert_eq!(cats[0].confidence, 0.8);
    }
}
