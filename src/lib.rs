// Library exports for the chemical label recognition workflow
//
// detect bottles → crop label → OCR → instruction → language model → safety record

// Core modules
pub mod core;
pub mod orchestration;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use core::{
    config::Config,
    errors::{ConfigError, DetectionError, KnowledgeError, OcrError, PipelineError, TemplateError},
    types::{ChemicalName, ChemicalRecord, Detection, PipelineResult, Rect, Stage},
};

pub use orchestration::LabelPipeline;

pub use services::knowledge::{
    extract_chemical_record, format_record, format_record_or_placeholder, ANALYSIS_UNAVAILABLE,
};
pub use services::{
    DetectionService, InstructionBuilder, KnowledgeClient, KnowledgeSource, ObjectDetector,
    OcrService, TextExtractor, TextRecognizer,
};

pub use utils::load_image_from_memory_async;
