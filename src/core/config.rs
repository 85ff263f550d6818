use crate::core::errors::{ConfigError, TemplateError};
use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// Detection model configuration
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub model_path: String,
    /// Detections must score strictly above this to be kept
    pub confidence_threshold: f32,
    pub target_size: u32,
    /// Class id -> class name, in model label order
    pub class_names: Vec<String>,
    pub inference_backend: Option<String>,
}

/// Text recognition configuration
#[derive(Debug, Clone)]
pub struct OcrConfig {
    pub model_path: String,
    pub vocab_path: String,
    /// Grayscale value below which a pixel counts as ink for line splitting
    pub ink_threshold: u8,
    /// Ink bands thinner than this (px) are treated as noise
    pub min_line_height: u32,
}

/// Language model endpoint configuration
#[derive(Debug, Clone)]
pub struct KnowledgeConfig {
    pub api_base: String,
    pub api_endpoint: String,
    pub model: String,
    pub api_key: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub stream: bool,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl KnowledgeConfig {
    pub fn url(&self) -> String {
        format!("{}{}", self.api_base.trim_end_matches('/'), self.api_endpoint)
    }
}

/// Pipeline orchestration configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Detections processed at once within one image (1 = sequential)
    pub max_concurrent_detections: usize,
    /// Class name -> instruction template with a single `{}` slot
    pub instruction_templates: BTreeMap<String, String>,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub detection: DetectionConfig,
    pub ocr: OcrConfig,
    pub knowledge: KnowledgeConfig,
    pub pipeline: PipelineConfig,
    pub log_level: Level,
}

pub fn default_instruction_templates() -> BTreeMap<String, String> {
    let mut templates = BTreeMap::new();
    templates.insert(
        "default".to_string(),
        "Please analyze the following text: {}".to_string(),
    );
    templates.insert(
        "chemical".to_string(),
        "Please analyze the following chemical label and provide the chemical name, formula, \
         hazards, safe handling guidance and storage requirements: {}"
            .to_string(),
    );
    templates.insert(
        "hazardous".to_string(),
        "Please analyze the following hazardous chemical label and describe its hazard \
         classification, protective measures, emergency response and disposal: {}"
            .to_string(),
    );
    templates.insert(
        "liquid".to_string(),
        "Please analyze the following liquid chemical label and provide its physical and \
         chemical properties, compatibility, spill handling and first aid measures: {}"
            .to_string(),
    );
    templates
}

impl Default for Config {
    fn default() -> Self {
        Self {
            detection: DetectionConfig {
                model_path: "models/detector.onnx".to_string(),
                confidence_threshold: 0.3,
                target_size: 640,
                class_names: vec!["chemical_bottle".to_string()],
                inference_backend: None,
            },
            ocr: OcrConfig {
                model_path: "models/ocr/ocr.onnx".to_string(),
                vocab_path: "models/ocr/vocab.txt".to_string(),
                ink_threshold: 120,
                min_line_height: 4,
            },
            knowledge: KnowledgeConfig {
                api_base: "https://api.siliconflow.com/v1".to_string(),
                api_endpoint: "/chat/completions".to_string(),
                model: "gpt-4".to_string(),
                api_key: String::new(),
                temperature: 0.7,
                max_tokens: 512,
                connect_timeout: Duration::from_secs(10),
                read_timeout: Duration::from_secs(30),
                stream: false,
                max_attempts: 3,
                backoff_base: Duration::from_secs(1),
            },
            pipeline: PipelineConfig {
                max_concurrent_detections: 4,
                instruction_templates: default_instruction_templates(),
            },
            log_level: Level::INFO,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(defaults.log_level);

        let class_names = env::var("CLASS_NAMES")
            .ok()
            .map(|names| {
                names
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|names| !names.is_empty())
            .unwrap_or(defaults.detection.class_names);

        // INSTRUCTION_TEMPLATES is a JSON object layered over the built-in set
        let mut instruction_templates = defaults.pipeline.instruction_templates;
        if let Ok(raw) = env::var("INSTRUCTION_TEMPLATES") {
            let overrides: BTreeMap<String, String> = serde_json::from_str(&raw).map_err(|e| {
                ConfigError::EnvVarError(format!(
                    "INSTRUCTION_TEMPLATES is not a JSON object of strings: {}",
                    e
                ))
            })?;
            instruction_templates.extend(overrides);
        }

        Ok(Self {
            detection: DetectionConfig {
                model_path: env::var("DETECTOR_MODEL_PATH")
                    .unwrap_or(defaults.detection.model_path),
                confidence_threshold: env_parse("CONFIDENCE_THRESHOLD")
                    .unwrap_or(defaults.detection.confidence_threshold),
                target_size: env_parse("TARGET_SIZE").unwrap_or(defaults.detection.target_size),
                class_names,
                inference_backend: env::var("INFERENCE_BACKEND")
                    .ok()
                    .map(|s| s.trim().to_uppercase())
                    .filter(|s| !s.is_empty()),
            },
            ocr: OcrConfig {
                model_path: env::var("OCR_MODEL_PATH").unwrap_or(defaults.ocr.model_path),
                vocab_path: env::var("OCR_VOCAB_PATH").unwrap_or(defaults.ocr.vocab_path),
                ink_threshold: env_parse("OCR_INK_THRESHOLD").unwrap_or(defaults.ocr.ink_threshold),
                min_line_height: env_parse("OCR_MIN_LINE_HEIGHT")
                    .unwrap_or(defaults.ocr.min_line_height),
            },
            knowledge: KnowledgeConfig {
                api_base: env::var("LM_API_BASE").unwrap_or(defaults.knowledge.api_base),
                api_endpoint: env::var("LM_API_ENDPOINT")
                    .unwrap_or(defaults.knowledge.api_endpoint),
                model: env::var("LM_MODEL").unwrap_or(defaults.knowledge.model),
                api_key: env::var("LM_API_KEY").unwrap_or_default(),
                temperature: env_parse("LM_TEMPERATURE").unwrap_or(defaults.knowledge.temperature),
                max_tokens: env_parse("LM_MAX_TOKENS").unwrap_or(defaults.knowledge.max_tokens),
                connect_timeout: env_parse::<f64>("LM_CONNECT_TIMEOUT_SECONDS")
                    .filter(|s| s.is_finite() && *s > 0.0)
                    .map(Duration::from_secs_f64)
                    .unwrap_or(defaults.knowledge.connect_timeout),
                read_timeout: env_parse::<f64>("LM_TIMEOUT_SECONDS")
                    .filter(|s| s.is_finite() && *s > 0.0)
                    .map(Duration::from_secs_f64)
                    .unwrap_or(defaults.knowledge.read_timeout),
                stream: env_parse("LM_STREAM").unwrap_or(defaults.knowledge.stream),
                max_attempts: env_parse("LM_MAX_ATTEMPTS")
                    .unwrap_or(defaults.knowledge.max_attempts),
                backoff_base: env_parse("LM_BACKOFF_BASE_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.knowledge.backoff_base),
            },
            pipeline: PipelineConfig {
                max_concurrent_detections: env_parse("MAX_CONCURRENT_DETECTIONS")
                    .unwrap_or(defaults.pipeline.max_concurrent_detections),
                instruction_templates,
            },
            log_level,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(ConfigError::InvalidConfidenceThreshold(
                self.detection.confidence_threshold,
            ));
        }

        if !(32..=2048).contains(&self.detection.target_size) {
            return Err(ConfigError::InvalidDetectionConfig(format!(
                "target_size must be between 32 and 2048, got {}",
                self.detection.target_size
            )));
        }

        if self.detection.class_names.is_empty() {
            return Err(ConfigError::InvalidDetectionConfig(
                "at least one class name is required".to_string(),
            ));
        }

        if self.ocr.min_line_height == 0 {
            return Err(ConfigError::InvalidOcrConfig(
                "min_line_height must be > 0".to_string(),
            ));
        }

        let knowledge = &self.knowledge;
        if !knowledge.api_base.starts_with("http://") && !knowledge.api_base.starts_with("https://")
        {
            return Err(ConfigError::InvalidKnowledgeConfig(format!(
                "api_base must be an http(s) URL, got '{}'",
                knowledge.api_base
            )));
        }
        if !knowledge.api_endpoint.starts_with('/') {
            return Err(ConfigError::InvalidKnowledgeConfig(format!(
                "api_endpoint must start with '/', got '{}'",
                knowledge.api_endpoint
            )));
        }
        if knowledge.max_attempts == 0 {
            return Err(ConfigError::InvalidKnowledgeConfig(
                "max_attempts must be > 0".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&knowledge.temperature) {
            return Err(ConfigError::InvalidKnowledgeConfig(format!(
                "temperature must be between 0.0 and 2.0, got {}",
                knowledge.temperature
            )));
        }

        if self.pipeline.max_concurrent_detections == 0 {
            return Err(ConfigError::InvalidPoolSize(
                self.pipeline.max_concurrent_detections,
            ));
        }

        if !self.pipeline.instruction_templates.contains_key("default") {
            return Err(TemplateError::MissingDefault.into());
        }
        for (class_name, template) in &self.pipeline.instruction_templates {
            let slots = template.matches("{}").count();
            if slots != 1 {
                return Err(TemplateError::InvalidSlotCount {
                    class_name: class_name.clone(),
                    slots,
                }
                .into());
            }
        }

        Ok(())
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.detection.confidence_threshold
    }

    pub fn log_level(&self) -> Level {
        self.log_level
    }

    pub fn max_concurrent_detections(&self) -> usize {
        self.pipeline.max_concurrent_detections
    }
}
