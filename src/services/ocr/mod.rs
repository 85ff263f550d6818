// OCR Service Module - label text recognition
//
// A CTC text-line recognizer runs on each ink band of the label crop; the
// TextExtractor wraps it so that any failure becomes an empty string.

pub mod lines;

pub use lines::split_text_lines;

use crate::core::config::OcrConfig;
use crate::core::errors::{OcrError, OcrResult};
use crate::services::onnx_builder::build_session;
use image::DynamicImage;
use ndarray::Array4;
use ort::{session::Session, value::Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Recognizer input height
const TARGET_HEIGHT: u32 = 48;
const MIN_WIDTH: u32 = 10;

/// Recognizes the text lines in a label crop
pub trait TextRecognizer: Send + Sync {
    /// Lines in reading order, as the recognizer produced them
    fn recognize(&self, crop: &DynamicImage) -> OcrResult<Vec<String>>;
}

/// Character vocabulary for CTC decoding
#[derive(Debug, Clone)]
pub struct Vocabulary {
    chars: HashMap<usize, String>,
    blank_index: usize,
}

impl Vocabulary {
    /// Parse a vocabulary file.
    ///
    /// Two layouts are accepted: `index\tchar` lines (with `<space>` and
    /// `<blank>` tokens), or one character per line where line N maps to
    /// index N + 1 and index 0 is the CTC blank.
    pub fn parse(content: &str) -> Self {
        let mut chars = HashMap::new();
        let mut blank_index = 0;

        for (line_no, raw) in content.lines().enumerate() {
            let line = raw.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                continue;
            }

            let (idx, token) = match line.split_once('\t') {
                Some((idx_str, token)) => match idx_str.trim().parse::<usize>() {
                    Ok(idx) => (idx, token),
                    Err(_) => continue,
                },
                None => (line_no + 1, line),
            };

            match token {
                "<blank>" => blank_index = idx,
                "<space>" => {
                    chars.insert(idx, " ".to_string());
                }
                other => {
                    chars.insert(idx, other.to_string());
                }
            }
        }

        debug!("Loaded {} vocabulary entries (blank={})", chars.len(), blank_index);
        Self { chars, blank_index }
    }

    pub fn load(path: &Path) -> OcrResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| OcrError::VocabularyLoad {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::parse(&content))
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    /// CTC greedy decode
    /// - Collapse repeated characters
    /// - Remove blank tokens
    ///
    /// Returns (text, mean confidence of the kept steps)
    pub fn ctc_decode(&self, logits: &[f32], seq_len: usize, num_classes: usize) -> (String, f32) {
        let mut text = String::new();
        let mut confidences = Vec::new();
        let mut prev_idx: Option<usize> = None;

        for step in logits.chunks_exact(num_classes).take(seq_len) {
            let (best_idx, best_val) = step
                .iter()
                .copied()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, v)| if v > best.1 { (i, v) } else { best });

            if best_idx != self.blank_index && Some(best_idx) != prev_idx {
                text.push_str(self.chars.get(&best_idx).map(|s| s.as_str()).unwrap_or(""));
                confidences.push(best_val);
            }

            prev_idx = Some(best_idx);
        }

        let avg_confidence = if confidences.is_empty() {
            0.0
        } else {
            confidences.iter().sum::<f32>() / confidences.len() as f32
        };

        (text, avg_confidence)
    }
}

/// ONNX CTC recognizer applied line by line
pub struct OcrService {
    session: Mutex<Session>,
    vocab: Vocabulary,
    config: OcrConfig,
}

impl OcrService {
    pub fn new(config: OcrConfig) -> OcrResult<Self> {
        let model_path = Path::new(&config.model_path);
        let (device_type, session) = build_session(model_path, "ocr", None).map_err(|e| {
            OcrError::ModelLoad {
                path: config.model_path.clone(),
                reason: format!("{:#}", e),
            }
        })?;

        let vocab = Vocabulary::load(Path::new(&config.vocab_path))?;

        info!(
            "OCR service initialized on {}: vocab_size={}",
            device_type,
            vocab.len()
        );

        Ok(Self {
            session: Mutex::new(session),
            vocab,
            config,
        })
    }

    /// Resize a line to the recognizer height keeping aspect ratio, normalize
    /// to [-1, 1] and lay out as [1, 3, H, W]
    fn preprocess_line(&self, line: &DynamicImage) -> (Array4<f32>, i32) {
        let (w, h) = (line.width(), line.height());
        let scale = TARGET_HEIGHT as f32 / h as f32;
        let new_w = ((w as f32 * scale) as u32).max(MIN_WIDTH);

        let resized = line.resize_exact(
            new_w,
            TARGET_HEIGHT,
            image::imageops::FilterType::Lanczos3,
        );
        let rgb = resized.to_rgb8();

        let mut tensor = Array4::<f32>::zeros((1, 3, TARGET_HEIGHT as usize, new_w as usize));
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                tensor[[0, c, y, x]] = pixel[c] as f32 / 127.5 - 1.0;
            }
        }

        // seq_length = width / 4 (LSTM stride)
        let seq_length = (new_w / 4) as i32;
        (tensor, seq_length)
    }

    fn recognize_line(&self, line: &DynamicImage) -> OcrResult<String> {
        let (tensor, seq_length) = self.preprocess_line(line);
        let data_value = Value::from_array(tensor)?;

        let (dims, logits) = {
            let mut session = self.session.lock();
            let input_names: Vec<String> = session.inputs.iter().map(|i| i.name.clone()).collect();

            let outputs = if input_names.len() >= 2 {
                let seq_lengths_value = Value::from_array(([1usize], vec![seq_length]))?;
                session.run(ort::inputs![
                    input_names[0].as_str() => data_value,
                    input_names[1].as_str() => seq_lengths_value
                ])?
            } else {
                let name = input_names.first().map(|s| s.as_str()).unwrap_or("x");
                session.run(ort::inputs![name => data_value])?
            };

            let (shape, logits_data) = if let Some(output) = outputs.get("output") {
                output.try_extract_tensor::<f32>()?
            } else {
                let first_key = outputs.keys().next().ok_or(OcrError::NoOutput)?;
                outputs[first_key].try_extract_tensor::<f32>()?
            };
            let dims: Vec<usize> = shape.iter().map(|&x| x as usize).collect();
            (dims, logits_data.to_vec())
        };

        let (seq_len, num_classes) = match dims.as_slice() {
            [s, 1, v] => (*s, *v),
            [1, s, v] => (*s, *v),
            [s, v] => (*s, *v),
            _ => return Err(OcrError::UnexpectedShape(dims)),
        };

        let (text, confidence) = self.vocab.ctc_decode(&logits, seq_len, num_classes);
        debug!("OCR line: '{}' (confidence: {:.2})", text, confidence);
        Ok(text)
    }
}

impl TextRecognizer for OcrService {
    fn recognize(&self, crop: &DynamicImage) -> OcrResult<Vec<String>> {
        if crop.width() == 0 || crop.height() == 0 {
            return Err(OcrError::EmptyCrop {
                width: crop.width(),
                height: crop.height(),
            });
        }

        let gray = crop.to_luma8();
        let bands = split_text_lines(&gray, self.config.ink_threshold, self.config.min_line_height);
        debug!("OCR: {} line bands in {}x{} crop", bands.len(), crop.width(), crop.height());

        bands
            .into_iter()
            .map(|(top, bottom)| {
                let line = crop.crop_imm(0, top, crop.width(), bottom - top);
                self.recognize_line(&line)
            })
            .collect()
    }
}

/// Best-effort text extraction: never fails, returns "" instead
#[derive(Clone)]
pub struct TextExtractor {
    recognizer: Arc<dyn TextRecognizer>,
}

impl TextExtractor {
    pub fn new(recognizer: Arc<dyn TextRecognizer>) -> Self {
        Self { recognizer }
    }

    /// Space-joined text of all recognized lines, in recognizer order
    pub fn extract(&self, crop: &DynamicImage) -> String {
        if crop.width() == 0 || crop.height() == 0 {
            debug!("OCR skipped: empty crop {}x{}", crop.width(), crop.height());
            return String::new();
        }

        match self.recognizer.recognize(crop) {
            Ok(lines) => lines
                .iter()
                .map(|l| l.trim())
                .filter(|l| !l.is_empty())
                .collect::<Vec<_>>()
                .join(" "),
            Err(e) => {
                warn!("OCR failed on {}x{} crop: {}", crop.width(), crop.height(), e);
                String::new()
            }
        }
    }
}
