pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::{
    ConfigError, DetectionError, KnowledgeError, OcrError, PipelineError, TemplateError,
};
pub use types::{ChemicalName, ChemicalRecord, Detection, PipelineResult, Rect, Stage};
