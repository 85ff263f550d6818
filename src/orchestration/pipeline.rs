// Label Pipeline: detect → crop label → OCR → instruction → model → record
//
// Only undecodable input and detector failure abort a run. Every retained
// detection yields exactly one result; per-detection failures degrade fields.

use futures::future::join_all;
use image::DynamicImage;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::core::config::Config;
use crate::core::errors::{ConfigError, PipelineError, RunResult};
use crate::core::types::{Detection, PipelineResult, Stage};
use crate::services::detection::{derive_label_region, retain_confident, DetectionService, ObjectDetector};
use crate::services::instruction::InstructionBuilder;
use crate::services::knowledge::{
    extract_chemical_record, KnowledgeClient, KnowledgeSource, ANALYSIS_UNAVAILABLE,
};
use crate::services::ocr::{OcrService, TextExtractor, TextRecognizer};
use crate::utils::image_ops::{crop_region, load_image_from_memory_async};

/// Per-image recognition pipeline
pub struct LabelPipeline<K: KnowledgeSource> {
    detector: Arc<dyn ObjectDetector>,
    extractor: TextExtractor,
    instructions: InstructionBuilder,
    knowledge: K,
    confidence_threshold: f32,
    detection_semaphore: Semaphore,
}

impl LabelPipeline<KnowledgeClient> {
    /// Build the ONNX detector and recognizer plus the HTTP knowledge client
    #[instrument(skip(config))]
    pub fn from_config(config: &Config) -> RunResult<Self> {
        info!("Initializing services...");

        let detector = Arc::new(DetectionService::new(config.detection.clone())?);
        let recognizer = Arc::new(
            OcrService::new(config.ocr.clone())
                .map_err(|e| PipelineError::ModelLoadError(e.to_string()))?,
        );
        let knowledge = KnowledgeClient::new(config.knowledge.clone())?;

        info!("✓ Ready (detector on {})", detector.device_type());
        Self::new(detector, recognizer, knowledge, config)
    }
}

impl<K: KnowledgeSource> LabelPipeline<K> {
    pub fn new(
        detector: Arc<dyn ObjectDetector>,
        recognizer: Arc<dyn TextRecognizer>,
        knowledge: K,
        config: &Config,
    ) -> RunResult<Self> {
        let instructions = InstructionBuilder::new(config.pipeline.instruction_templates.clone())
            .map_err(ConfigError::from)?;
        let permits = config.max_concurrent_detections();
        if permits == 0 {
            return Err(ConfigError::InvalidPoolSize(permits).into());
        }

        Ok(Self {
            detector,
            extractor: TextExtractor::new(recognizer),
            instructions,
            knowledge,
            confidence_threshold: config.confidence_threshold(),
            detection_semaphore: Semaphore::new(permits),
        })
    }

    /// Template registry, for adding class templates at runtime
    pub fn instructions(&self) -> &InstructionBuilder {
        &self.instructions
    }

    /// Decode encoded image bytes off the async runtime, then process them
    #[instrument(skip(self, bytes), fields(bytes = bytes.len()))]
    pub async fn process_bytes(&self, bytes: &[u8]) -> RunResult<Vec<PipelineResult>> {
        let image = load_image_from_memory_async(bytes).await.map_err(|e| {
            debug!(stage = ?Stage::Fatal, "Image decode failed");
            PipelineError::InputError(format!("{:#}", e))
        })?;
        self.process_image(Arc::new(image)).await
    }

    /// Run the whole pipeline on a decoded image.
    ///
    /// Results follow detection order regardless of how many detections run
    /// at once.
    #[instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    pub async fn process_image(&self, image: Arc<DynamicImage>) -> RunResult<Vec<PipelineResult>> {
        let start = Instant::now();

        debug!(stage = ?Stage::Detecting, "Running detector");
        let detector = Arc::clone(&self.detector);
        let detect_image = Arc::clone(&image);
        let candidates = tokio::task::spawn_blocking(move || detector.detect(&detect_image))
            .await
            .map_err(|e| PipelineError::TaskJoinFailed(e.to_string()))?
            .map_err(|e| {
                debug!(stage = ?Stage::Fatal, "Detector failed: {}", e);
                PipelineError::from(e)
            })?;

        let detections = retain_confident(candidates, self.confidence_threshold);

        let tasks = detections
            .into_iter()
            .enumerate()
            .map(|(index, detection)| {
                let image = Arc::clone(&image);
                async move {
                    // The semaphore is never closed
                    let _permit = self.detection_semaphore.acquire().await.ok();
                    self.process_detection(index, detection, image).await
                }
            });
        let results = join_all(tasks).await;

        debug!(stage = ?Stage::Aggregating, "Collected {} results", results.len());
        info!(
            "Processed {} detections in {:.2}ms",
            results.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        debug!(stage = ?Stage::Done, "Run complete");
        Ok(results)
    }

    async fn process_detection(
        &self,
        index: usize,
        detection: Detection,
        image: Arc<DynamicImage>,
    ) -> PipelineResult {
        let class_name = self.detector.class_name(detection.class_id);
        let label_box = derive_label_region(&detection.object_box);

        debug!(index, stage = ?Stage::Cropping, "{} ({:.2})", class_name, detection.confidence);
        let extractor = self.extractor.clone();
        let text = tokio::task::spawn_blocking(move || match crop_region(&image, &label_box) {
            Some(crop) => {
                debug!(index, stage = ?Stage::ExtractingText, "{}x{} crop", crop.width(), crop.height());
                extractor.extract(&crop)
            }
            None => {
                debug!(index, "Label region is empty, skipping OCR");
                String::new()
            }
        })
        .await
        .unwrap_or_else(|e| {
            warn!(index, "OCR task failed: {}", e);
            String::new()
        });

        debug!(index, stage = ?Stage::BuildingInstruction, "text: {:?}", text);
        let instruction = self.instructions.build(&class_name, &text);

        debug!(index, stage = ?Stage::QueryingModel, "Querying model");
        let analysis = self.knowledge.analyze(&instruction).await;

        debug!(index, stage = ?Stage::ExtractingStructured, "Parsing analysis");
        let chemical_record = if analysis == ANALYSIS_UNAVAILABLE {
            None
        } else {
            extract_chemical_record(&analysis)
        };

        PipelineResult {
            class_name,
            confidence: detection.confidence,
            object_box: detection.object_box.to_int(),
            label_box: label_box.to_int(),
            text,
            instruction,
            analysis,
            chemical_record,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{DetectionError, DetectionResult, OcrError, OcrResult};
    use crate::core::types::Rect;
    use crate::services::detection::lookup_class_name;
    use image::{Rgb, RgbImage};
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::future::Future;
    use std::io::Cursor;
    use std::time::Duration;

    struct FixedDetector {
        detections: Vec<Detection>,
        names: Vec<String>,
    }

    impl ObjectDetector for FixedDetector {
        fn detect(&self, _image: &DynamicImage) -> DetectionResult<Vec<Detection>> {
            Ok(self.detections.clone())
        }

        fn class_name(&self, class_id: i64) -> String {
            lookup_class_name(&self.names, class_id)
        }
    }

    struct BrokenDetector;

    impl ObjectDetector for BrokenDetector {
        fn detect(&self, _image: &DynamicImage) -> DetectionResult<Vec<Detection>> {
            Err(DetectionError::UnexpectedOutput("no boxes output".to_string()))
        }

        fn class_name(&self, class_id: i64) -> String {
            format!("class_{}", class_id)
        }
    }

    struct FixedRecognizer(&'static str);

    impl TextRecognizer for FixedRecognizer {
        fn recognize(&self, _crop: &DynamicImage) -> OcrResult<Vec<String>> {
            Ok(vec![self.0.to_string()])
        }
    }

    struct FailingRecognizer;

    impl TextRecognizer for FailingRecognizer {
        fn recognize(&self, _crop: &DynamicImage) -> OcrResult<Vec<String>> {
            Err(OcrError::UnexpectedShape(vec![]))
        }
    }

    /// Echoes the instruction, or a fixed answer; "slow" instructions lag
    #[derive(Default)]
    struct EchoKnowledge {
        answer: Option<String>,
        seen: Mutex<Vec<String>>,
    }

    impl KnowledgeSource for EchoKnowledge {
        fn analyze(&self, instruction: &str) -> impl Future<Output = String> + Send {
            self.seen.lock().push(instruction.to_string());
            let delay = if instruction.starts_with("slow") {
                Duration::from_millis(50)
            } else {
                Duration::ZERO
            };
            let answer = self.answer.clone().unwrap_or_else(|| instruction.to_string());
            async move {
                tokio::time::sleep(delay).await;
                answer
            }
        }
    }

    fn detection(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32, class_id: i64) -> Detection {
        Detection {
            object_box: Rect::new(x1, y1, x2, y2),
            confidence,
            class_id,
        }
    }

    fn test_config(max_concurrent: usize) -> Config {
        let mut templates = BTreeMap::new();
        templates.insert("default".to_string(), "{}".to_string());
        templates.insert("chemical".to_string(), "slow chemical: {}".to_string());
        templates.insert("liquid".to_string(), "liquid: {}".to_string());

        let mut config = Config::default();
        config.pipeline.instruction_templates = templates;
        config.pipeline.max_concurrent_detections = max_concurrent;
        config
    }

    fn detector(detections: Vec<Detection>) -> Arc<dyn ObjectDetector> {
        Arc::new(FixedDetector {
            detections,
            names: vec!["chemical_bottle".to_string(), "liquid_bottle".to_string()],
        })
    }

    fn image() -> Arc<DynamicImage> {
        Arc::new(DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 200, Rgb([255, 255, 255]))))
    }

    #[tokio::test]
    async fn test_one_result_per_confident_detection_in_order() {
        let pipeline = LabelPipeline::new(
            detector(vec![
                detection(10.0, 10.0, 90.0, 190.0, 0.9, 0),
                detection(100.0, 10.0, 190.0, 190.0, 0.2, 1),
                detection(100.0, 20.0, 190.0, 120.0, 0.6, 1),
                detection(0.0, 0.0, 50.0, 50.0, 0.3, 0),
            ]),
            Arc::new(FixedRecognizer("H2SO4")),
            EchoKnowledge::default(),
            &test_config(4),
        )
        .unwrap();

        let results = pipeline.process_image(image()).await.unwrap();
        assert_eq!(results.len(), 2);

        // The first detection answers last but stays first
        assert_eq!(results[0].class_name, "chemical_bottle");
        assert_eq!(results[0].instruction, "slow chemical: H2SO4");
        assert_eq!(results[0].analysis, "slow chemical: H2SO4");
        assert_eq!(results[1].class_name, "liquid_bottle");
        assert_eq!(results[1].instruction, "liquid: H2SO4");
        assert!((results[1].confidence - 0.6).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_label_box_reported_inside_object_box() {
        let pipeline = LabelPipeline::new(
            detector(vec![detection(10.0, 20.0, 110.0, 120.0, 0.8, 0)]),
            Arc::new(FixedRecognizer("x")),
            EchoKnowledge::default(),
            &test_config(1),
        )
        .unwrap();

        let results = pipeline.process_image(image()).await.unwrap();
        assert_eq!(results[0].object_box, [10, 20, 110, 120]);
        assert_eq!(results[0].label_box, [10, 20, 110, 50]);
    }

    #[tokio::test]
    async fn test_failures_degrade_fields() {
        let knowledge = EchoKnowledge {
            answer: Some(ANALYSIS_UNAVAILABLE.to_string()),
            ..Default::default()
        };
        let pipeline = LabelPipeline::new(
            detector(vec![
                detection(10.0, 10.0, 90.0, 190.0, 0.9, 1),
                // Entirely outside the image
                detection(300.0, 300.0, 400.0, 400.0, 0.9, 1),
            ]),
            Arc::new(FailingRecognizer),
            knowledge,
            &test_config(2),
        )
        .unwrap();

        let results = pipeline.process_image(image()).await.unwrap();
        assert_eq!(results.len(), 2);
        for result in &results {
            assert_eq!(result.text, "");
            assert_eq!(result.instruction, "liquid: ");
            assert_eq!(result.analysis, ANALYSIS_UNAVAILABLE);
            assert!(result.chemical_record.is_none());
        }
    }

    #[tokio::test]
    async fn test_record_extracted_from_analysis() {
        let knowledge = EchoKnowledge {
            answer: Some("Result:\n```json\n{\"formula\":\"HCl\",\"cas\":\"7647-01-0\"}\n```".to_string()),
            ..Default::default()
        };
        let pipeline = LabelPipeline::new(
            detector(vec![detection(10.0, 10.0, 90.0, 190.0, 0.9, 1)]),
            Arc::new(FixedRecognizer("hydrochloric acid")),
            knowledge,
            &test_config(4),
        )
        .unwrap();

        let results = pipeline.process_image(image()).await.unwrap();
        let record = results[0].chemical_record.as_ref().unwrap();
        assert_eq!(record.formula.as_deref(), Some("HCl"));
        assert_eq!(pipeline.knowledge.seen.lock().as_slice(), ["liquid: hydrochloric acid"]);
    }

    #[tokio::test]
    async fn test_templates_registered_at_runtime_are_used() {
        let pipeline = LabelPipeline::new(
            detector(vec![detection(10.0, 10.0, 90.0, 190.0, 0.9, 1)]),
            Arc::new(FixedRecognizer("ethanol")),
            EchoKnowledge::default(),
            &test_config(4),
        )
        .unwrap();
        pipeline.instructions().register("liquid_bottle", "flammable? {}").unwrap();

        let results = pipeline.process_image(image()).await.unwrap();
        assert_eq!(results[0].instruction, "flammable? ethanol");
    }

    #[tokio::test]
    async fn test_no_detections_is_empty() {
        let pipeline = LabelPipeline::new(
            detector(vec![detection(0.0, 0.0, 10.0, 10.0, 0.1, 0)]),
            Arc::new(FixedRecognizer("x")),
            EchoKnowledge::default(),
            &test_config(4),
        )
        .unwrap();

        assert!(pipeline.process_image(image()).await.unwrap().is_empty());
        assert!(pipeline.knowledge.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_detector_failure_is_fatal() {
        let pipeline = LabelPipeline::new(
            Arc::new(BrokenDetector),
            Arc::new(FixedRecognizer("x")),
            EchoKnowledge::default(),
            &test_config(4),
        )
        .unwrap();

        assert!(matches!(
            pipeline.process_image(image()).await,
            Err(PipelineError::DetectionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_undecodable_bytes_are_input_error() {
        let pipeline = LabelPipeline::new(
            detector(vec![]),
            Arc::new(FixedRecognizer("x")),
            EchoKnowledge::default(),
            &test_config(4),
        )
        .unwrap();

        assert!(matches!(
            pipeline.process_bytes(b"definitely not a png").await,
            Err(PipelineError::InputError(_))
        ));
    }

    #[tokio::test]
    async fn test_process_bytes_decodes_png() {
        let mut bytes = Vec::new();
        image()
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        let pipeline = LabelPipeline::new(
            detector(vec![detection(10.0, 10.0, 90.0, 190.0, 0.9, 0)]),
            Arc::new(FixedRecognizer("acetone")),
            EchoKnowledge::default(),
            &test_config(1),
        )
        .unwrap();

        let results = pipeline.process_bytes(&bytes).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "acetone");
    }

    #[test]
    fn test_zero_pool_rejected() {
        let result = LabelPipeline::new(
            detector(vec![]),
            Arc::new(FixedRecognizer("x")),
            EchoKnowledge::default(),
            &test_config(0),
        );
        assert!(matches!(
            result,
            Err(PipelineError::InvalidConfig(ConfigError::InvalidPoolSize(0)))
        ));
    }

    #[test]
    fn test_template_without_default_rejected() {
        let mut config = test_config(1);
        config.pipeline.instruction_templates.remove("default");
        let result = LabelPipeline::new(
            detector(vec![]),
            Arc::new(FixedRecognizer("x")),
            EchoKnowledge::default(),
            &config,
        );
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }
}
