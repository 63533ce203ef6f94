//! Open-vocabulary detection with a Grounding DINO ONNX export.
//!
//! The exported graph takes `img` (1x3xHxW, ImageNet-normalized),
//! `input_ids`, `attention_mask`, `position_ids`, `token_type_ids` (1xL,
//! i64) and `text_token_mask` (1xLxL, bool), and produces `logits`
//! (1xQx256, pre-sigmoid) and `boxes` (1xQx4, normalized cx, cy, w, h).
//! The text prompt is fixed, so it is tokenized once when the detector is
//! built.

use crate::{
    bounding_box::{BoundingBox, Detection},
    config::{DinoConfig, Validatable},
    detector::{Detector, DetectorError},
    ort_service::SessionPool,
};
use image::imageops::FilterType;
use ndarray::{Array, Array2, ArrayD, ArrayView2, Axis, Ix3, Ix4};
use ort::{session::Session, value::Value};
use std::path::Path;
use tokenizers::Tokenizer;

const MAX_TEXT_LEN: usize = 256;
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];
const SPECIAL_TOKENS: [&str; 4] = ["[CLS]", "[SEP]", ".", "?"];

/// Lowercases and trims the prompt and makes sure it ends with a period.
fn preprocess_caption(caption: &str) -> String {
    let caption = caption.trim().to_lowercase();
    if caption.ends_with('.') {
        caption
    } else {
        format!("{}.", caption)
    }
}

/// Output size `(width, height)` when the short side is scaled to
/// `min_size` without the long side exceeding `max_size`.
fn resized_dimensions(width: u32, height: u32, min_size: u32, max_size: u32) -> (u32, u32) {
    let (w, h) = (width as f64, height as f64);
    let (short, long) = (w.min(h), w.max(h));

    let mut size = min_size as f64;
    if long / short * size > max_size as f64 {
        size = (max_size as f64 * short / long).round();
    }

    if (width <= height && w == size) || (height <= width && h == size) {
        return (width, height);
    }

    if width < height {
        (size as u32, (size * h / w) as u32)
    } else {
        ((size * w / h) as u32, size as u32)
    }
}

fn transform_image(
    image_path: &Path,
    min_size: u32,
    max_size: u32,
) -> Result<(Array<f32, Ix4>, u32, u32), DetectorError> {
    let original_img = image::ImageReader::open(image_path)?
        .with_guessed_format()?
        .decode()?;

    let (img_width, img_height) = (original_img.width(), original_img.height());
    let (new_width, new_height) = resized_dimensions(img_width, img_height, min_size, max_size);
    let img = original_img
        .resize_exact(new_width, new_height, FilterType::Triangle)
        .to_rgb8();

    let mut input = Array::zeros((1, 3, new_height as usize, new_width as usize));
    for (x, y, pixel) in img.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for (c, value) in pixel.0.iter().enumerate() {
            input[[0, c, y, x]] = ((*value as f32) / 255. - MEAN[c]) / STD[c];
        }
    }

    Ok((input, img_width, img_height))
}

/// Self-attention mask and position ids that keep each phrase of the
/// prompt (delimited by special tokens) attending only to itself.
fn phrase_masks(input_ids: &[i64], special_ids: &[i64]) -> (Array2<bool>, Vec<i64>) {
    let len = input_ids.len();
    let mut attention_mask = Array2::from_elem((len, len), false);
    for i in 0..len {
        attention_mask[[i, i]] = true;
    }
    let mut position_ids = vec![0i64; len];

    let mut previous_col = 0;
    for (col, id) in input_ids.iter().enumerate() {
        if !special_ids.contains(id) {
            continue;
        }
        if col == 0 || col == len - 1 {
            attention_mask[[col, col]] = true;
            position_ids[col] = 0;
        } else {
            for row in previous_col + 1..=col {
                for inner in previous_col + 1..=col {
                    attention_mask[[row, inner]] = true;
                }
                position_ids[row] = (row - previous_col - 1) as i64;
            }
        }
        previous_col = col;
    }

    (attention_mask, position_ids)
}

/// The tokenized prompt and every text input the graph expects.
#[derive(Debug, Clone)]
struct PromptEncoding {
    input_ids: Vec<i64>,
    attention_mask: Vec<i64>,
    token_type_ids: Vec<i64>,
    position_ids: Vec<i64>,
    text_token_mask: Array2<bool>,
    special_positions: Vec<bool>,
}

impl PromptEncoding {
    fn from_ids(input_ids: Vec<i64>, attention_mask: Vec<i64>, special_ids: &[i64]) -> Self {
        let len = input_ids.len().min(MAX_TEXT_LEN);
        let input_ids = input_ids[..len].to_vec();
        let attention_mask = attention_mask[..len].to_vec();
        let (text_token_mask, position_ids) = phrase_masks(&input_ids, special_ids);
        let special_positions = input_ids.iter().map(|id| special_ids.contains(id)).collect();

        Self {
            token_type_ids: vec![0; len],
            input_ids,
            attention_mask,
            position_ids,
            text_token_mask,
            special_positions,
        }
    }

    fn encode(tokenizer: &Tokenizer, caption: &str) -> Result<Self, DetectorError> {
        let encoding = tokenizer
            .encode(caption, true)
            .map_err(|e| DetectorError::Tokenizer(e.to_string()))?;

        let input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        let attention_mask: Vec<i64> = encoding
            .get_attention_mask()
            .iter()
            .map(|&m| m as i64)
            .collect();
        let special_ids: Vec<i64> = SPECIAL_TOKENS
            .iter()
            .filter_map(|token| tokenizer.token_to_id(token))
            .map(|id| id as i64)
            .collect();

        Ok(Self::from_ids(input_ids, attention_mask, &special_ids))
    }

    fn len(&self) -> usize {
        self.input_ids.len()
    }

    fn row(values: &[i64]) -> Result<Array2<i64>, DetectorError> {
        Ok(Array2::from_shape_vec((1, values.len()), values.to_vec())?)
    }
}

/// A query that cleared the box threshold.
#[derive(Debug, Clone, PartialEq)]
struct QueryMatch {
    score: f32,
    raw_box: [f32; 4],
    token_positions: Vec<usize>,
}

fn sigmoid(x: f32) -> f32 {
    1. / (1. + (-x).exp())
}

/// Keeps queries whose best token score exceeds `box_threshold` and, for
/// each, the non-special prompt tokens whose score exceeds
/// `text_threshold`. Query order is preserved.
fn select_queries(
    logits: ArrayView2<f32>,
    boxes: ArrayView2<f32>,
    special_positions: &[bool],
    box_threshold: f32,
    text_threshold: f32,
) -> Vec<QueryMatch> {
    let mut matches = Vec::new();
    for (query_logits, query_box) in logits.axis_iter(Axis(0)).zip(boxes.axis_iter(Axis(0))) {
        let scores: Vec<f32> = query_logits.iter().map(|&l| sigmoid(l)).collect();
        let score = scores.iter().copied().fold(f32::MIN, f32::max);
        if score <= box_threshold {
            continue;
        }

        let token_positions = special_positions
            .iter()
            .enumerate()
            .filter(|(i, special)| !**special && scores.get(*i).is_some_and(|s| *s > text_threshold))
            .map(|(i, _)| i)
            .collect();

        matches.push(QueryMatch {
            score,
            raw_box: [query_box[0], query_box[1], query_box[2], query_box[3]],
            token_positions,
        });
    }
    matches
}

/// Places the four model outputs into the corner fields in order, unchanged.
/// With `pixels` the normalized `cx, cy, w, h` box is converted to clamped
/// pixel corners instead.
fn to_bounding_box(raw_box: [f32; 4], img_width: u32, img_height: u32, pixels: bool) -> BoundingBox {
    let [a, b, c, d] = raw_box;
    if !pixels {
        return BoundingBox::new(a, b, c, d);
    }
    let (width, height) = (img_width as f32, img_height as f32);
    BoundingBox::from_center(a * width, b * height, c * width, d * height).clamp(width, height)
}

pub struct DinoDetector {
    pool: SessionPool,
    tokenizer: Tokenizer,
    prompt: PromptEncoding,
    box_threshold: f32,
    text_threshold: f32,
    min_size: u32,
    max_size: u32,
    pixel_boxes: bool,
}

impl DinoDetector {
    pub fn new(config: &DinoConfig) -> Result<Self, DetectorError> {
        let tokenizer = Tokenizer::from_file(config.get_tokenizer_path())
            .map_err(|e| DetectorError::Load(format!("failed to load tokenizer: {}", e)))?;

        let caption = preprocess_caption(&config.text_prompt);
        let prompt = PromptEncoding::encode(&tokenizer, &caption)?;
        tracing::info!("DINO prompt `{}` encoded into {} tokens", caption, prompt.len());

        let pool = SessionPool::new(&config.get_path(), config.num_instances)?;

        Ok(Self {
            pool,
            tokenizer,
            prompt,
            box_threshold: config.box_threshold,
            text_threshold: config.text_threshold,
            min_size: config.min_size,
            max_size: config.max_size,
            pixel_boxes: config.pixel_boxes,
        })
    }

    fn run_inference(
        &self,
        session: &mut Session,
        image: Array<f32, Ix4>,
    ) -> Result<(ArrayD<f32>, ArrayD<f32>), DetectorError> {
        let prompt = &self.prompt;
        let text_token_mask = prompt.text_token_mask.clone().insert_axis(Axis(0));

        let outputs = session.run(ort::inputs![
            "img" => Value::from_array(image)?,
            "input_ids" => Value::from_array(PromptEncoding::row(&prompt.input_ids)?)?,
            "attention_mask" => Value::from_array(PromptEncoding::row(&prompt.attention_mask)?)?,
            "position_ids" => Value::from_array(PromptEncoding::row(&prompt.position_ids)?)?,
            "token_type_ids" => Value::from_array(PromptEncoding::row(&prompt.token_type_ids)?)?,
            "text_token_mask" => Value::from_array(text_token_mask)?
        ])?;

        let extract = |name: &str| -> Result<ArrayD<f32>, DetectorError> {
            let value = outputs
                .get(name)
                .ok_or_else(|| DetectorError::Output(format!("missing `{}` tensor", name)))?;
            Ok(value.try_extract_array::<f32>()?.to_owned())
        };

        Ok((extract("logits")?, extract("boxes")?))
    }

    fn phrase(&self, token_positions: &[usize]) -> String {
        let ids: Vec<u32> = token_positions
            .iter()
            .map(|&i| self.prompt.input_ids[i] as u32)
            .collect();
        self.tokenizer
            .decode(&ids, true)
            .map(|phrase| phrase.replace('.', "").trim().to_string())
            .unwrap_or_default()
    }
}

impl Detector for DinoDetector {
    fn detect(&self, image_path: &Path) -> Result<Vec<Detection>, DetectorError> {
        let (image, img_width, img_height) =
            transform_image(image_path, self.min_size, self.max_size)?;

        let (logits, boxes) = self
            .pool
            .with_session(|session| self.run_inference(session, image))?;

        let logits = logits.into_dimensionality::<Ix3>()?;
        let boxes = boxes.into_dimensionality::<Ix3>()?;
        let logits = logits.index_axis(Axis(0), 0);
        let boxes = boxes.index_axis(Axis(0), 0);

        if logits.shape()[0] != boxes.shape()[0] || boxes.shape()[1] != 4 {
            return Err(DetectorError::Output(format!(
                "logits {:?} and boxes {:?} disagree",
                logits.shape(),
                boxes.shape()
            )));
        }

        let matches = select_queries(
            logits,
            boxes,
            &self.prompt.special_positions,
            self.box_threshold,
            self.text_threshold,
        );

        let detections = matches
            .into_iter()
            .map(|m| Detection {
                bbox: to_bounding_box(m.raw_box, img_width, img_height, self.pixel_boxes),
                confidence: m.score,
                label: self.phrase(&m.token_positions),
            })
            .collect::<Vec<_>>();

        tracing::debug!("DINO kept {} detections", detections.len());
        Ok(detections)
    }
}
