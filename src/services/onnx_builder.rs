// Shared ONNX Runtime session builder used by the detector and the recognizer

use anyhow::{Context, Result};
use ort::execution_providers::CPUExecutionProvider;
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::path::Path;
use tracing::{debug, info, warn};

#[cfg(feature = "cuda")]
use ort::execution_providers::CUDAExecutionProvider;

#[cfg(feature = "tensorrt")]
use ort::execution_providers::TensorRTExecutionProvider;

#[cfg(feature = "openvino")]
use ort::execution_providers::OpenVINOExecutionProvider;

/// Intra-op thread count for CPU inference.
///
/// Windows loses throughput past ~6 threads to synchronization overhead.
fn optimal_intra_op_threads() -> usize {
    let total_cores = num_cpus::get();

    #[cfg(target_os = "windows")]
    let optimal = std::cmp::min(6, total_cores).max(1);

    #[cfg(not(target_os = "windows"))]
    let optimal = total_cores.max(1);

    debug!("CPU threads: {} total cores, using {} for inference", total_cores, optimal);
    optimal
}

fn cpu_session(model_path: &Path, model_name: &str) -> Result<Session> {
    let session = Session::builder()
        .context(format!("Failed to create ONNX session builder for {}", model_name))?
        .with_execution_providers([CPUExecutionProvider::default().build()])
        .context(format!("Failed to configure CPU execution provider for {}", model_name))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context(format!("Failed to set graph optimization level for {}", model_name))?
        .with_intra_threads(optimal_intra_op_threads())
        .context(format!("Failed to configure intra-op threads for {}", model_name))?
        .with_inter_threads(1)
        .context(format!("Failed to configure inter-op threads for {}", model_name))?
        .commit_from_file(model_path)
        .context(format!(
            "Failed to load {} ONNX model from {}",
            model_name,
            model_path.display()
        ))?;
    Ok(session)
}

/// Build an ONNX Runtime session, preferring compiled-in accelerators.
///
/// `backend` forces a provider (`CPU`, `CUDA`, `TENSORRT`, `OPENVINO`);
/// `None` or `AUTO` tries accelerators in order and falls back to CPU.
///
/// Returns (backend_name, Session)
pub fn build_session(
    model_path: &Path,
    model_name: &str,
    backend: Option<&str>,
) -> Result<(String, Session)> {
    if !model_path.exists() {
        anyhow::bail!(
            "{} model not found at {}",
            model_name,
            model_path.display()
        );
    }

    match backend.map(|b| b.to_uppercase()) {
        None => {}
        Some(b) if b == "AUTO" => {}
        Some(b) if b == "CPU" => {
            let session = cpu_session(model_path, model_name)?;
            info!("✓ Forced CPU backend for {}", model_name);
            return Ok(("CPU".to_string(), session));
        }
        #[cfg(feature = "cuda")]
        Some(b) if b == "CUDA" => {
            let session = Session::builder()?
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(optimal_intra_op_threads())?
                .commit_from_file(model_path)
                .context("Failed to load model with CUDA")?;
            info!("✓ Forced CUDA backend for {}", model_name);
            return Ok(("CUDA".to_string(), session));
        }
        #[cfg(feature = "tensorrt")]
        Some(b) if b == "TENSORRT" => {
            let session = Session::builder()?
                .with_execution_providers([TensorRTExecutionProvider::default().build()])?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(optimal_intra_op_threads())?
                .commit_from_file(model_path)
                .context("Failed to load model with TensorRT")?;
            info!("✓ Forced TensorRT backend for {}", model_name);
            return Ok(("TensorRT".to_string(), session));
        }
        #[cfg(feature = "openvino")]
        Some(b) if b == "OPENVINO" => {
            let session = Session::builder()?
                .with_execution_providers([OpenVINOExecutionProvider::default()
                    .with_device_type("CPU")
                    .build()])?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(optimal_intra_op_threads())?
                .commit_from_file(model_path)
                .context("Failed to load model with OpenVINO")?;
            info!("✓ Forced OpenVINO backend for {}", model_name);
            return Ok(("OpenVINO-CPU".to_string(), session));
        }
        Some(other) => {
            anyhow::bail!(
                "Inference backend '{}' is unknown or not compiled in. \
                 Valid options: CPU, AUTO, CUDA, TENSORRT, OPENVINO (with matching cargo feature)",
                other
            );
        }
    }

    #[cfg(feature = "tensorrt")]
    {
        if let Ok(session) = Session::builder()
            .and_then(|b| b.with_execution_providers([TensorRTExecutionProvider::default().build()]))
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(optimal_intra_op_threads()))
            .and_then(|b| b.commit_from_file(model_path))
        {
            info!("✓ Using TensorRT acceleration for {}", model_name);
            return Ok(("TensorRT".to_string(), session));
        }
    }

    #[cfg(feature = "cuda")]
    {
        if let Ok(session) = Session::builder()
            .and_then(|b| b.with_execution_providers([CUDAExecutionProvider::default().build()]))
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(optimal_intra_op_threads()))
            .and_then(|b| b.commit_from_file(model_path))
        {
            info!("✓ Using CUDA acceleration for {}", model_name);
            return Ok(("CUDA".to_string(), session));
        }
    }

    #[cfg(feature = "openvino")]
    {
        if let Ok(session) = Session::builder()
            .and_then(|b| {
                b.with_execution_providers([OpenVINOExecutionProvider::default()
                    .with_device_type("CPU")
                    .build()])
            })
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(optimal_intra_op_threads()))
            .and_then(|b| b.commit_from_file(model_path))
        {
            info!("✓ Using OpenVINO acceleration for {}", model_name);
            return Ok(("OpenVINO-CPU".to_string(), session));
        }
    }

    let session = cpu_session(model_path, model_name)?;
    warn!("Using CPU-only inference for {} (no accelerator available)", model_name);
    Ok(("CPU".to_string(), session))
}
