pub mod pipeline;

pub use pipeline::LabelPipeline;
