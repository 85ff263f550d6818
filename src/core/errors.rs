// Error types for the label recognition pipeline
//
// Only InputError and ModelLoadError stop a run. Everything else degrades the
// single affected detection result and is logged where it happens.

use thiserror::Error;

/// Object detection errors
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Failed to load detection model from {path}: {reason}")]
    ModelLoad { path: String, reason: String },

    #[error("ONNX inference failed: {0}")]
    InferenceFailed(#[from] ort::Error),

    #[error("Image preprocessing failed: {0}")]
    PreprocessingFailed(String),

    #[error("Unexpected model output: {0}")]
    UnexpectedOutput(String),

    #[error("Invalid image dimensions: {width}x{height}")]
    InvalidImageSize { width: u32, height: u32 },
}

/// Text recognition errors (never escape the text extractor)
#[derive(Debug, Error)]
pub enum OcrError {
    #[error("Failed to load OCR model from {path}: {reason}")]
    ModelLoad { path: String, reason: String },

    #[error("Failed to read OCR vocabulary {path}: {source}")]
    VocabularyLoad {
        path: String,
        source: std::io::Error,
    },

    #[error("ONNX inference failed: {0}")]
    InferenceFailed(#[from] ort::Error),

    #[error("Empty crop ({width}x{height})")]
    EmptyCrop { width: u32, height: u32 },

    #[error("Unexpected logits shape: {0:?}")]
    UnexpectedShape(Vec<usize>),

    #[error("OCR model produced no outputs")]
    NoOutput,
}

/// Knowledge endpoint errors
#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(reqwest::Error),

    #[error("Request failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Endpoint rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl KnowledgeError {
    /// Status codes worth another attempt
    pub fn is_retryable_status(status: u16) -> bool {
        matches!(status, 429 | 500 | 502 | 503 | 504)
    }

    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Rejected { status, .. } => Self::is_retryable_status(*status),
            _ => false,
        }
    }
}

/// Instruction template errors
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Template for '{class_name}' must contain exactly one '{{}}' slot, found {slots}")]
    InvalidSlotCount { class_name: String, slots: usize },

    #[error("Template set is missing the mandatory 'default' entry")]
    MissingDefault,
}

/// Fatal pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid image: {0}")]
    InputError(String),

    #[error("Model load failed: {0}")]
    ModelLoadError(String),

    #[error("Detection failed: {0}")]
    DetectionFailed(#[source] DetectionError),

    #[error("Task join failed: {0}")]
    TaskJoinFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Knowledge client setup failed: {0}")]
    KnowledgeSetup(#[from] KnowledgeError),
}

impl From<DetectionError> for PipelineError {
    fn from(err: DetectionError) -> Self {
        match err {
            DetectionError::ModelLoad { path, reason } => {
                PipelineError::ModelLoadError(format!("{}: {}", path, reason))
            }
            DetectionError::InvalidImageSize { width, height } => {
                PipelineError::InputError(format!("image is {}x{}", width, height))
            }
            other => PipelineError::DetectionFailed(other),
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Confidence threshold must be in [0.0, 1.0], got {0}")]
    InvalidConfidenceThreshold(f32),

    #[error("Invalid detection config: {0}")]
    InvalidDetectionConfig(String),

    #[error("Invalid OCR config: {0}")]
    InvalidOcrConfig(String),

    #[error("Invalid knowledge endpoint config: {0}")]
    InvalidKnowledgeConfig(String),

    #[error("Invalid instruction templates: {0}")]
    InvalidTemplates(#[from] TemplateError),

    #[error("Worker pool size must be > 0, got {0}")]
    InvalidPoolSize(usize),

    #[error("Environment variable parsing failed: {0}")]
    EnvVarError(String),
}

pub type DetectionResult<T> = Result<T, DetectionError>;
pub type OcrResult<T> = Result<T, OcrError>;
pub type KnowledgeResult<T> = Result<T, KnowledgeError>;
pub type RunResult<T> = Result<T, PipelineError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
