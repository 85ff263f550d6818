// Knowledge Service Module - remote language model access
//
// client:  chat-completions transport with retry/backoff and streaming
// extract: ChemicalRecord recovery from free-form model output
// format:  safety card rendering

pub mod client;
pub mod extract;
pub mod format;

pub use client::{KnowledgeClient, KnowledgeSource, ANALYSIS_UNAVAILABLE};
pub use extract::extract_chemical_record;
pub use format::{format_record, format_record_or_placeholder};
