//! Retinotopic analysis: the Fourier pipeline, area segmentation, layer
//! rendering, and the worker orchestrator.

pub mod orchestrator;
pub mod pipeline;
pub mod render;
pub mod segmentation;

pub use orchestrator::AnalysisOrchestrator;
pub use pipeline::{AnalysisPipeline, AnalysisResults};
