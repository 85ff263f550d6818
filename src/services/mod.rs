pub mod detection;
pub mod instruction;
pub mod knowledge;
pub mod ocr;
pub mod onnx_builder; // Shared ONNX session builder for the detector and recognizer

// Re-export commonly used services
pub use detection::{DetectionService, ObjectDetector};
pub use instruction::InstructionBuilder;
pub use knowledge::{KnowledgeClient, KnowledgeSource};
pub use ocr::{OcrService, TextExtractor, TextRecognizer};
