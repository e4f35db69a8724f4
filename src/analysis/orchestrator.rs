//! Analysis orchestrator: runs the pipeline on a daemon worker.
//!
//! One analysis at a time. The worker publishes `analysis_started`, a
//! progress event at each stage boundary, an `analysis_layer_ready` event
//! (rendered PNG, base64) as each primary layer materializes, and finally
//! `analysis_complete` or `analysis_error`. Raw float32 layers are served
//! on request through the analysis shared-memory plane, never over the
//! control or sync channels.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{error, info, warn};

use crate::analysis::pipeline::{save_results, AnalysisPipeline, AnalysisResults};
use crate::analysis::render;
use crate::config::ParameterStore;
use crate::error::{AppResult, IsiError};
use crate::ipc::message::SyncEvent;
use crate::ipc::{EventBus, FramePlanes};

pub struct AnalysisOrchestrator {
    params: Arc<ParameterStore>,
    bus: Arc<EventBus>,
    planes: Arc<FramePlanes>,
    running: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    current_session: Mutex<Option<PathBuf>>,
    results: Arc<Mutex<Option<Arc<AnalysisResults>>>>,
}

impl AnalysisOrchestrator {
    pub fn new(params: Arc<ParameterStore>, bus: Arc<EventBus>, planes: Arc<FramePlanes>) -> Self {
        Self {
            params,
            bus,
            planes,
            running: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
            current_session: Mutex::new(None),
            results: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn current_session(&self) -> Option<PathBuf> {
        self.current_session
            .lock()
            .expect("analysis session lock poisoned")
            .clone()
    }

    /// Launch the analysis worker for one session. Rejected while another
    /// analysis is running.
    pub fn start(&self, session_path: &Path) -> AppResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(IsiError::validation("analysis already running"));
        }
        if !session_path.join(crate::session::METADATA_FILE).exists() {
            self.running.store(false, Ordering::SeqCst);
            return Err(IsiError::validation(format!(
                "not a session directory: {}",
                session_path.display()
            )));
        }

        self.stop.store(false, Ordering::SeqCst);
        *self
            .current_session
            .lock()
            .expect("analysis session lock poisoned") = Some(session_path.to_path_buf());

        let pipeline = AnalysisPipeline::new(self.params.analysis());
        let bus = Arc::clone(&self.bus);
        let running = Arc::clone(&self.running);
        let stop = Arc::clone(&self.stop);
        let results_slot = Arc::clone(&self.results);
        let session = session_path.to_path_buf();

        let spawned = std::thread::Builder::new()
            .name("analysis".into())
            .spawn(move || {
                run_worker(pipeline, session, bus, stop, results_slot);
                running.store(false, Ordering::SeqCst);
            });
        match spawned {
            Ok(handle) => {
                *self.handle.lock().expect("analysis handle lock poisoned") = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Cooperative stop; takes effect at stage or row-batch boundaries.
    pub fn request_stop(&self) {
        if self.is_running() {
            info!("analysis stop requested");
            self.stop.store(true, Ordering::SeqCst);
        }
    }

    /// Block until the worker exits (shutdown and tests).
    pub fn join(&self) {
        if let Some(handle) = self
            .handle
            .lock()
            .expect("analysis handle lock poisoned")
            .take()
        {
            if handle.join().is_err() {
                error!("analysis worker panicked");
            }
        }
    }

    /// Summary of the last completed analysis: names and counts only, no
    /// numeric arrays.
    pub fn results_summary(&self) -> AppResult<Value> {
        let guard = self.results.lock().expect("analysis results lock poisoned");
        let results = guard
            .as_ref()
            .ok_or_else(|| IsiError::validation("no analysis results available"))?;
        Ok(serde_json::json!({
            "session_path": results.session_path.display().to_string(),
            "shape": [results.shape.0, results.shape.1],
            "num_areas": results.num_areas,
            "primary_layers": results.primary_layer_names(),
            "advanced_layers": results.advanced_layer_names(),
            "has_anatomical": results.anatomical.is_some(),
        }))
    }

    /// Publish one float32 layer through the analysis plane and return the
    /// record describing where it landed.
    pub fn publish_layer(&self, name: &str) -> AppResult<Value> {
        let guard = self.results.lock().expect("analysis results lock poisoned");
        let results = guard
            .as_ref()
            .ok_or_else(|| IsiError::validation("no analysis results available"))?;

        let owned_anatomical;
        let layer = if name == "anatomical" {
            let anatomical = results
                .anatomical
                .as_ref()
                .ok_or_else(|| IsiError::validation("session has no anatomical image"))?;
            owned_anatomical = anatomical.mapv(|v| v as f32);
            &owned_anatomical
        } else {
            results
                .layer(name)
                .ok_or_else(|| IsiError::validation(format!("unknown layer: {name}")))?
        };

        let (height, width) = layer.dim();
        let data: Vec<f32> = layer.iter().copied().collect();
        let size = self.planes.analysis.write_layer(&data)?;
        let record = SyncEvent::AnalysisLayer {
            layer_name: name.to_string(),
            width_px: width as u32,
            height_px: height as u32,
            data_size_bytes: size,
            offset_bytes: 0,
            shm_path: self.planes.analysis.path().display().to_string(),
        };
        self.bus.publish(&record);
        Ok(serde_json::json!({
            "layer_name": name,
            "width_px": width,
            "height_px": height,
            "data_size_bytes": size,
            "offset_bytes": 0,
            "dtype": "float32",
            "shm_path": self.planes.analysis.path().display().to_string(),
        }))
    }
}

fn run_worker(
    pipeline: AnalysisPipeline,
    session: PathBuf,
    bus: Arc<EventBus>,
    stop: Arc<AtomicBool>,
    results_slot: Arc<Mutex<Option<Arc<AnalysisResults>>>>,
) {
    bus.publish(&SyncEvent::AnalysisStarted {
        session_path: session.display().to_string(),
    });

    let progress_bus = Arc::clone(&bus);
    let progress = move |fraction: f64, stage: &str| {
        progress_bus.publish(&SyncEvent::AnalysisProgress {
            fraction,
            stage: stage.to_string(),
        });
    };
    let layer_bus = Arc::clone(&bus);
    let layer_ready = move |name: &str, layer: &ndarray::Array2<f32>| {
        let image = render::render_layer(name, layer);
        match render::png_base64(&image) {
            Ok((image_base64, width, height)) => {
                layer_bus.publish(&SyncEvent::AnalysisLayerReady {
                    layer_name: name.to_string(),
                    image_base64,
                    width,
                    height,
                });
            }
            Err(e) => warn!(layer = name, error = %e, "layer render failed"),
        }
    };

    match pipeline.run(&session, &stop, &progress, &layer_ready) {
        Ok(results) => match persist(&results) {
            Ok(output_path) => {
                bus.publish(&SyncEvent::AnalysisComplete {
                    session_path: session.display().to_string(),
                    num_areas: results.num_areas,
                    output_path: output_path.display().to_string(),
                });
                info!(session = %session.display(), "analysis complete");
                *results_slot.lock().expect("analysis results lock poisoned") =
                    Some(Arc::new(results));
            }
            Err(e) => {
                error!(error = %e, "failed to persist analysis results");
                bus.publish(&SyncEvent::AnalysisError {
                    error: e.to_string(),
                });
            }
        },
        Err(IsiError::Cancelled) => {
            info!("analysis stopped by operator");
            bus.publish(&SyncEvent::AnalysisError {
                error: "analysis stopped by operator".to_string(),
            });
        }
        Err(e) => {
            error!(error = %e, "analysis failed");
            bus.publish(&SyncEvent::AnalysisError {
                error: e.to_string(),
            });
        }
    }
}

/// Write the HDF5 results file plus one PNG per primary layer.
fn persist(results: &AnalysisResults) -> AppResult<PathBuf> {
    let output_path = save_results(results)?;
    let out_dir = output_path
        .parent()
        .ok_or_else(|| IsiError::Analysis("analysis output has no parent".into()))?;

    for name in results.primary_layer_names() {
        let image = if name == "anatomical" {
            match &results.anatomical {
                Some(anatomical) => render::render_anatomical(anatomical),
                None => continue,
            }
        } else {
            match results.layer(&name) {
                Some(layer) => render::render_layer(&name, layer),
                None => continue,
            }
        };
        render::save_png(&image, &out_dir.join(format!("{name}.png")))?;
    }
    Ok(output_path)
}
