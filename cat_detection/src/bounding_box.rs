use serde::{Deserialize, Serialize};

/// Axis-aligned box in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Builds a corner box from a center point and a size.
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x1: cx - w / 2.,
            y1: cy - h / 2.,
            x2: cx + w / 2.,
            y2: cy + h / 2.,
        }
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.) * (self.y2 - self.y1).max(0.)
    }

    pub fn clamp(self, width: f32, height: f32) -> Self {
        Self {
            x1: self.x1.clamp(0., width),
            y1: self.y1.clamp(0., height),
            x2: self.x2.clamp(0., width),
            y2: self.y2.clamp(0., height),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub label: String,
}

fn intersection(box1: &BoundingBox, box2: &BoundingBox) -> f32 {
    let w = box1.x2.min(box2.x2) - box1.x1.max(box2.x1);
    let h = box1.y2.min(box2.y2) - box1.y1.max(box2.y1);
    w.max(0.) * h.max(0.)
}

fn union(box1: &BoundingBox, box2: &BoundingBox) -> f32 {
    box1.area() + box2.area() - intersection(box1, box2)
}

pub fn iou(box1: &BoundingBox, box2: &BoundingBox) -> f32 {
    let union = union(box1, box2);
    if union <= 0. {
        return 0.;
    }
    intersection(box1, box2) / union
}

/// Class-aware non-maximum suppression.
///
/// Detections are ordered by descending confidence; a detection is dropped
/// when it overlaps an already kept detection of the same label by more
/// than `iou_threshold`.
pub fn non_maximum_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|d1, d2| d2.confidence.total_cmp(&d1.confidence));

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for detection in detections {
        let suppressed = kept.iter().any(|k| {
            k.label == detection.label && iou(&k.bbox, &detection.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(detection);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(label: &str, confidence: f32, bbox: BoundingBox) -> Detection {
        Detection {
            bbox,
            confidence,
            label: label.to_string(),
        }
    }

    #[test]
    fn test_iou() {
        let a = BoundingBox::new(0., 0., 10., 10.);
        let b = BoundingBox::new(5., 0., 15., 10.);
        let c = BoundingBox::new(20., 20., 30., 30.);

        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert!((iou(&a, &b) - 50. / 150.).abs() < 1e-6);
        assert_eq!(iou(&a, &c), 0.);
    }

    #[test]
    fn test_from_center() {
        let bbox = BoundingBox::from_center(50., 40., 20., 10.);
        assert_eq!(bbox, BoundingBox::new(40., 35., 60., 45.));
    }

    #[test]
    fn test_nms_suppresses_same_label_overlap() {
        let detections = vec![
            detection("cat", 0.6, BoundingBox::new(1., 1., 11., 11.)),
            detection("cat", 0.9, BoundingBox::new(0., 0., 10., 10.)),
            detection("cat", 0.5, BoundingBox::new(50., 50., 60., 60.)),
        ];

        let kept = non_maximum_suppression(detections, 0.7);

        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.5);
    }

    #[test]
    fn test_nms_keeps_overlapping_boxes_of_different_labels() {
        let detections = vec![
            detection("cat", 0.9, BoundingBox::new(0., 0., 10., 10.)),
            detection("dog", 0.8, BoundingBox::new(0., 0., 10., 10.)),
        ];

        let kept = non_maximum_suppression(detections, 0.7);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_serializes_as_corner_fields() {
        let json = serde_json::to_value(BoundingBox::new(1., 2., 3., 4.)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"x1": 1.0, "y1": 2.0, "x2": 3.0, "y2": 4.0})
        );
    }
}
