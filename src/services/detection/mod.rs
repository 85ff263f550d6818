pub mod region;

pub use region::{derive_label_region, LABEL_HEIGHT_FRACTION};

use crate::core::config::DetectionConfig;
use crate::core::errors::{DetectionError, DetectionResult};
use crate::core::types::{Detection, Rect};
use crate::services::onnx_builder::build_session;
use image::DynamicImage;
use ndarray::{Array2, Array4};
use ort::session::Session;
use ort::value::Value;
use parking_lot::Mutex;
use std::path::Path;
use tracing::{debug, info, trace};

/// Finds candidate objects in an image.
///
/// Implementations return every candidate the model produced; confidence
/// filtering is done by the caller with [`retain_confident`].
pub trait ObjectDetector: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> DetectionResult<Vec<Detection>>;

    /// Human-readable name for a class id
    fn class_name(&self, class_id: i64) -> String;
}

/// Keep detections scoring strictly above `threshold`, preserving order
pub fn retain_confident(detections: Vec<Detection>, threshold: f32) -> Vec<Detection> {
    let total = detections.len();
    let kept: Vec<Detection> = detections
        .into_iter()
        .filter(|d| d.confidence > threshold)
        .collect();
    debug!(
        "Kept {}/{} detections above confidence threshold {:.2}",
        kept.len(),
        total,
        threshold
    );
    kept
}

/// Look up a class name, falling back to `class_<id>` for unknown ids
pub fn lookup_class_name(class_names: &[String], class_id: i64) -> String {
    usize::try_from(class_id)
        .ok()
        .and_then(|idx| class_names.get(idx))
        .cloned()
        .unwrap_or_else(|| format!("class_{}", class_id))
}

/// ONNX bottle detector.
///
/// Expects an end-to-end model with inputs `images` [1,3,S,S] and
/// `orig_target_sizes` [1,2], and outputs `labels`, `boxes` (original image
/// pixels) and `scores`.
pub struct DetectionService {
    session: Mutex<Session>,
    config: DetectionConfig,
    device_type: String,
}

impl DetectionService {
    pub fn new(config: DetectionConfig) -> DetectionResult<Self> {
        let model_path = Path::new(&config.model_path);
        let (device_type, session) =
            build_session(model_path, "detection", config.inference_backend.as_deref()).map_err(
                |e| DetectionError::ModelLoad {
                    path: config.model_path.clone(),
                    reason: format!("{:#}", e),
                },
            )?;

        info!(
            "✓ Detection: {} ({} classes, threshold {:.2})",
            device_type,
            config.class_names.len(),
            config.confidence_threshold
        );

        Ok(Self {
            session: Mutex::new(session),
            config,
            device_type,
        })
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    fn preprocess_image(&self, img: &DynamicImage) -> DetectionResult<(Array4<f32>, Array2<i64>)> {
        let target_size = self.config.target_size;
        trace!(
            "Preprocessing image: {}x{} → {}x{}",
            img.width(),
            img.height(),
            target_size,
            target_size
        );

        let original_size =
            Array2::from_shape_vec((1, 2), vec![img.width() as i64, img.height() as i64])
                .map_err(|e| DetectionError::PreprocessingFailed(e.to_string()))?;

        let resized = img.resize_exact(
            target_size,
            target_size,
            image::imageops::FilterType::Triangle,
        );
        let rgb_img = resized.to_rgb8();

        let target = target_size as usize;
        let mut array = Array4::<f32>::zeros((1, 3, target, target));

        for (x, y, pixel) in rgb_img.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            array[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
            array[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
            array[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
        }

        Ok((array, original_size))
    }
}

impl ObjectDetector for DetectionService {
    fn detect(&self, img: &DynamicImage) -> DetectionResult<Vec<Detection>> {
        if img.width() == 0 || img.height() == 0 {
            return Err(DetectionError::InvalidImageSize {
                width: img.width(),
                height: img.height(),
            });
        }

        let detection_start = std::time::Instant::now();
        let (preprocessed, original_size) = self.preprocess_image(img)?;

        let images_value = Value::from_array(preprocessed)?;
        let sizes_value = Value::from_array(original_size)?;

        // Copy the outputs out while the session is held
        let (labels_data, boxes_data, scores_data) = {
            let mut session = self.session.lock();
            let outputs = session.run(ort::inputs![
                "images" => images_value,
                "orig_target_sizes" => sizes_value
            ])?;

            let (_labels_shape, labels) = outputs["labels"].try_extract_tensor::<i64>()?;
            let (_boxes_shape, boxes) = outputs["boxes"].try_extract_tensor::<f32>()?;
            let (_scores_shape, scores) = outputs["scores"].try_extract_tensor::<f32>()?;

            (labels.to_vec(), boxes.to_vec(), scores.to_vec())
        };

        let num_detections = labels_data.len();
        if scores_data.len() != num_detections || boxes_data.len() != num_detections * 4 {
            return Err(DetectionError::UnexpectedOutput(format!(
                "{} labels, {} scores, {} box values",
                num_detections,
                scores_data.len(),
                boxes_data.len()
            )));
        }

        let detections: Vec<Detection> = (0..num_detections)
            .map(|i| {
                let object_box = Rect::new(
                    boxes_data[i * 4],
                    boxes_data[i * 4 + 1],
                    boxes_data[i * 4 + 2],
                    boxes_data[i * 4 + 3],
                )
                .clamp_to(img.width(), img.height());

                trace!(
                    "Detection {}: bbox=[{:.1}, {:.1}, {:.1}, {:.1}], class={}, conf={:.3}",
                    i,
                    object_box.x1,
                    object_box.y1,
                    object_box.x2,
                    object_box.y2,
                    labels_data[i],
                    scores_data[i]
                );

                Detection {
                    object_box,
                    confidence: scores_data[i],
                    class_id: labels_data[i],
                }
            })
            .collect();

        debug!(
            "✓ Detection on {} produced {} candidates in {:.2}ms",
            self.device_type,
            detections.len(),
            detection_start.elapsed().as_secs_f64() * 1000.0
        );

        Ok(detections)
    }

    fn class_name(&self, class_id: i64) -> String {
        lookup_class_name(&self.config.class_names, class_id)
    }
}
