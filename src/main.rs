// Main entry point: chemlabel <image>

use chemlabel::{format_record_or_placeholder, Config, LabelPipeline};

use anyhow::{Context, Result};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::new().context("Failed to load configuration")?;

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(format!(
        "chemlabel={},ort=off",
        match config.log_level() {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        }
    ));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let image_path = match std::env::args().nth(1) {
        Some(path) => path,
        None => {
            eprintln!("Usage: chemlabel <image>");
            std::process::exit(2);
        }
    };

    info!("=== CHEMICAL LABEL RECOGNITION ===");
    info!(
        "Config: threshold={:.2} concurrency={} model={} endpoint={}",
        config.confidence_threshold(),
        config.max_concurrent_detections(),
        config.knowledge.model,
        config.knowledge.url()
    );

    let pipeline = LabelPipeline::from_config(&config).context("Failed to initialize pipeline")?;

    let bytes = tokio::fs::read(&image_path)
        .await
        .with_context(|| format!("Failed to read {}", image_path))?;

    let results = match pipeline.process_bytes(&bytes).await {
        Ok(results) => results,
        Err(e) => {
            error!("Processing {} failed: {}", image_path, e);
            return Err(e).with_context(|| format!("Failed to process {}", image_path));
        }
    };

    info!("{} labelled objects in {}", results.len(), image_path);

    for (i, result) in results.iter().enumerate() {
        println!("=== Object {} ===", i + 1);
        println!("Class: {} ({:.2})", result.class_name, result.confidence);
        println!("Object box: {:?}", result.object_box);
        println!("Label box: {:?}", result.label_box);
        println!("Text: {}", result.text);
        println!("Instruction: {}", result.instruction);
        println!("Analysis:\n{}", result.analysis);
        println!();
        println!("{}", format_record_or_placeholder(result.chemical_record.as_ref()));
        println!();
    }

    let json = serde_json::to_string_pretty(&results).context("Failed to serialize results")?;
    println!("{}", json);

    Ok(())
}
