//! Composition root.
//!
//! Every component is constructed exactly once here and receives its
//! dependencies by construction; nothing else in the crate knows concrete
//! wiring. Construction order follows the dependency graph bottom-up, so
//! a cycle cannot form. The only lazily-built component is the stimulus
//! generator, whose provider is invalidated by the parameter-change
//! callback registered here.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::info;

use crate::acquisition::{
    AcquisitionOrchestrator, OrchestratorDeps, PlaybackController, PreviewController,
    RecordController, StateCoordinator,
};
use crate::analysis::AnalysisOrchestrator;
use crate::camera::{AcquisitionDeps, CameraManager, RecorderSlot};
use crate::config::{ParameterGroupId, ParameterStore};
use crate::core::monotonic_now_us;
use crate::error::AppResult;
use crate::ipc::message::HealthPulse;
use crate::ipc::{EventBus, FramePlanes, LinePublisher};
use crate::stimulus::{CameraTriggeredStimulus, StimulusProvider};
use crate::sync_tracker::SyncTracker;

/// Process-level settings, normally supplied by the CLI.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub sync_port: u16,
    pub health_port: u16,
    pub session_root: PathBuf,
    pub shm_dir: PathBuf,
    pub parameter_file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sync_port: 5557,
            health_port: 5559,
            session_root: PathBuf::from("sessions"),
            shm_dir: std::env::temp_dir(),
            parameter_file: None,
        }
    }
}

impl AppConfig {
    /// Ephemeral ports and a private scratch directory, for tests.
    pub fn for_tests(dir: &std::path::Path) -> Self {
        Self {
            sync_port: 0,
            health_port: 0,
            session_root: dir.join("sessions"),
            shm_dir: dir.join("shm"),
            parameter_file: None,
        }
    }
}

/// The container holding every long-lived component.
pub struct AppContext {
    pub config: AppConfig,
    pub params: Arc<ParameterStore>,
    pub state: Arc<StateCoordinator>,
    pub sync_tracker: Arc<SyncTracker>,
    pub planes: Arc<FramePlanes>,
    pub bus: Arc<EventBus>,
    pub health: Arc<LinePublisher>,
    pub stimulus: Arc<StimulusProvider>,
    pub ctstim: Arc<CameraTriggeredStimulus>,
    pub recorder_slot: Arc<RecorderSlot>,
    pub camera: Arc<CameraManager>,
    pub acquisition: Arc<AcquisitionOrchestrator>,
    pub preview: Arc<PreviewController>,
    pub record: Arc<RecordController>,
    pub playback: Arc<PlaybackController>,
    pub analysis: Arc<AnalysisOrchestrator>,
    health_stop: Arc<AtomicBool>,
}

impl AppContext {
    pub fn build(config: AppConfig) -> AppResult<Arc<Self>> {
        let params = match &config.parameter_file {
            Some(path) if path.exists() => Arc::new(ParameterStore::load(path)?),
            _ => Arc::new(ParameterStore::default()),
        };

        let planes = Arc::new(FramePlanes::create(&config.shm_dir)?);
        let bus = Arc::new(EventBus::bind(config.sync_port)?);
        let health = Arc::new(LinePublisher::bind("health", config.health_port)?);

        let state = Arc::new(StateCoordinator::new());
        let sync_tracker = Arc::new(SyncTracker::new());

        let stimulus = Arc::new(StimulusProvider::new(Arc::clone(&params)));
        {
            let provider = Arc::clone(&stimulus);
            params.on_change(move |group| {
                if matches!(
                    group,
                    ParameterGroupId::Stimulus | ParameterGroupId::Monitor | ParameterGroupId::Camera
                ) {
                    provider.invalidate();
                }
            });
        }

        let ctstim = Arc::new(CameraTriggeredStimulus::new(Arc::clone(&stimulus)));
        let recorder_slot = Arc::new(RecorderSlot::new());
        let fatal = Arc::new(AtomicBool::new(false));

        let camera = Arc::new(CameraManager::new(AcquisitionDeps {
            ctstim: Arc::clone(&ctstim),
            recorder: Arc::clone(&recorder_slot),
            planes: Arc::clone(&planes),
            bus: Arc::clone(&bus),
            sync: Arc::clone(&sync_tracker),
            state: Arc::clone(&state),
            fatal: Arc::clone(&fatal),
        }));

        let acquisition = Arc::new(AcquisitionOrchestrator::new(OrchestratorDeps {
            params: Arc::clone(&params),
            state: Arc::clone(&state),
            ctstim: Arc::clone(&ctstim),
            stimulus: Arc::clone(&stimulus),
            recorder_slot: Arc::clone(&recorder_slot),
            camera: Arc::clone(&camera),
            planes: Arc::clone(&planes),
            bus: Arc::clone(&bus),
            fatal,
        }));

        let preview = Arc::new(PreviewController::new(
            Arc::clone(&state),
            Arc::clone(&stimulus),
            Arc::clone(&planes),
            Arc::clone(&bus),
        ));
        let record = Arc::new(RecordController::new(
            Arc::clone(&state),
            Arc::clone(&params),
            Arc::clone(&acquisition),
            Arc::clone(&bus),
            config.session_root.clone(),
        ));
        let playback = Arc::new(PlaybackController::new(
            Arc::clone(&state),
            Arc::clone(&bus),
        ));

        let analysis = Arc::new(AnalysisOrchestrator::new(
            Arc::clone(&params),
            Arc::clone(&bus),
            Arc::clone(&planes),
        ));

        std::fs::create_dir_all(&config.session_root)?;
        info!(
            session_root = %config.session_root.display(),
            sync_port = bus.port(),
            health_port = health.port(),
            "backend container built"
        );

        Ok(Arc::new(Self {
            config,
            params,
            state,
            sync_tracker,
            planes,
            bus,
            health,
            stimulus,
            ctstim,
            recorder_slot,
            camera,
            acquisition,
            preview,
            record,
            playback,
            analysis,
            health_stop: Arc::new(AtomicBool::new(false)),
        }))
    }

    /// Current composite status, shared by the health pulse and the
    /// `get_system_status` command.
    pub fn health_pulse(&self) -> HealthPulse {
        HealthPulse {
            kind: HealthPulse::TYPE,
            timestamp_us: monotonic_now_us(),
            mode: self.state.mode().as_str().to_string(),
            camera_active: self.camera.is_active(),
            camera_fps_actual: self.camera.fps_actual(),
            acquisition_running: self.acquisition.is_running(),
            analysis_running: self.analysis.is_running(),
            sync_entries: self.sync_tracker.len(),
        }
    }

    /// Stop workers and release the camera. Idempotent.
    pub fn shutdown(&self) {
        info!("backend shutting down");
        self.health_stop.store(true, Ordering::SeqCst);
        self.acquisition.request_stop();
        self.analysis.request_stop();
        self.acquisition.join();
        self.analysis.join();
        self.camera.stop();
    }
}

/// Start the periodic health publisher thread (one pulse per second).
pub fn start_health_publisher(ctx: &Arc<AppContext>) -> AppResult<JoinHandle<()>> {
    let ctx = Arc::clone(ctx);
    let handle = std::thread::Builder::new()
        .name("health".into())
        .spawn(move || {
            while !ctx.health_stop.load(Ordering::SeqCst) {
                ctx.health.publish(&ctx.health_pulse());
                std::thread::sleep(std::time::Duration::from_secs(1));
            }
        })?;
    Ok(handle)
}
