//! Acquisition orchestrator: sequences the sweep protocol.
//!
//! Runs on its own worker thread. The protocol is: opening baseline
//! (black screen), then for each configured direction `repeats` cycle
//! blocks of camera-triggered sweeping with between-trial baselines, then
//! a closing baseline, then the session flush. Progress events are
//! published at every phase boundary and periodically inside sweeps.
//!
//! Cancellation is cooperative: `request_stop` raises a flag checked
//! between waits; the camera frame in flight completes, the current
//! direction is finalized as a partial recording, the remaining protocol
//! is skipped, and the session is still saved. A fatal flag raised by the
//! camera loop aborts without a second save (the loop already asked the
//! recorder for a best-effort flush).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info};

use crate::acquisition::recorder::SessionRecorder;
use crate::acquisition::state::{AcquisitionMode, StateCoordinator};
use crate::camera::{open_device, CameraManager, RecorderSlot};
use crate::config::ParameterStore;
use crate::core::{monotonic_now_us, Direction, FrameDescriptor};
use crate::error::{AppResult, IsiError};
use crate::ipc::message::SyncEvent;
use crate::ipc::{EventBus, FramePlanes};
use crate::session::{SessionMetadata, TimestampInfo};
use crate::stimulus::{CameraTriggeredStimulus, StimulusProvider};

/// Poll interval for cooperative waits.
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Interval between in-sweep progress events.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Shared collaborators of the orchestrator.
pub struct OrchestratorDeps {
    pub params: Arc<ParameterStore>,
    pub state: Arc<StateCoordinator>,
    pub ctstim: Arc<CameraTriggeredStimulus>,
    pub stimulus: Arc<StimulusProvider>,
    pub recorder_slot: Arc<RecorderSlot>,
    pub camera: Arc<CameraManager>,
    pub planes: Arc<FramePlanes>,
    pub bus: Arc<EventBus>,
    /// Shared with the camera loop; raised there on fatal recording errors.
    pub fatal: Arc<AtomicBool>,
}

#[derive(Clone, Debug)]
struct ProgressState {
    fraction: f64,
    stage: String,
}

/// Sequences one `start_acquisition` -> completion/stop lifecycle at a time.
pub struct AcquisitionOrchestrator {
    deps: OrchestratorDeps,
    running: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    progress: Arc<Mutex<ProgressState>>,
}

impl AcquisitionOrchestrator {
    pub fn new(deps: OrchestratorDeps) -> Self {
        Self {
            deps,
            running: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
            progress: Arc::new(Mutex::new(ProgressState {
                fraction: 0.0,
                stage: "idle".into(),
            })),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// `(fraction, stage)` of the running protocol.
    pub fn progress(&self) -> (f64, String) {
        let p = self.progress.lock().expect("progress lock poisoned");
        (p.fraction, p.stage.clone())
    }

    /// Validate inputs, create the session recorder, make sure the camera
    /// loop is running, and launch the protocol worker.
    pub fn start(&self, session_dir: &std::path::Path, session_name: &str) -> AppResult<()> {
        if self.is_running() {
            return Err(IsiError::validation("acquisition already running"));
        }

        let camera_params = self.deps.params.camera();
        camera_params.require_fps()?;
        let acquisition = self.deps.params.acquisition();
        acquisition.validate()?;
        let stimulus_params = self.deps.params.stimulus();
        stimulus_params.validate()?;

        let mut camera_started_here = false;
        if !self.deps.camera.is_active() {
            let device = open_device(&camera_params.selected_camera)?;
            self.deps.camera.start(device, &camera_params)?;
            camera_started_here = true;
        }
        let source = self
            .deps
            .camera
            .timestamp_source()
            .ok_or_else(|| IsiError::Camera("camera timestamp source not probed".into()))?;

        let bundle = self.deps.params.snapshot();
        let metadata = SessionMetadata::new(
            session_name,
            bundle.stimulus,
            bundle.monitor,
            bundle.camera,
            bundle.acquisition,
            TimestampInfo::camera_triggered(source.as_str()),
        );
        let recorder = Arc::new(SessionRecorder::new(session_dir, metadata)?);

        self.stop.store(false, Ordering::SeqCst);
        self.deps.fatal.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        self.deps.recorder_slot.set(Some(Arc::clone(&recorder)));
        self.deps.state.set_acquisition_running(true);
        self.deps
            .state
            .set_current_session(Some(session_dir.display().to_string()));

        let worker = ProtocolWorker {
            deps: OrchestratorDeps {
                params: Arc::clone(&self.deps.params),
                state: Arc::clone(&self.deps.state),
                ctstim: Arc::clone(&self.deps.ctstim),
                stimulus: Arc::clone(&self.deps.stimulus),
                recorder_slot: Arc::clone(&self.deps.recorder_slot),
                camera: Arc::clone(&self.deps.camera),
                planes: Arc::clone(&self.deps.planes),
                bus: Arc::clone(&self.deps.bus),
                fatal: Arc::clone(&self.deps.fatal),
            },
            recorder,
            stop: Arc::clone(&self.stop),
            progress: Arc::clone(&self.progress),
            session_path: session_dir.display().to_string(),
            camera_started_here,
        };
        let running = Arc::clone(&self.running);
        let spawned = std::thread::Builder::new()
            .name("sweep-protocol".into())
            .spawn(move || {
                worker.run();
                running.store(false, Ordering::SeqCst);
            });
        match spawned {
            Ok(handle) => {
                *self.handle.lock().expect("orchestrator handle lock poisoned") = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                self.deps.recorder_slot.set(None);
                self.deps.state.set_acquisition_running(false);
                self.deps.state.set_current_session(None);
                Err(e.into())
            }
        }
    }

    /// Cooperative stop; the in-flight frame completes.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Block until the worker exits (used on shutdown and under test).
    pub fn join(&self) {
        if let Some(handle) = self
            .handle
            .lock()
            .expect("orchestrator handle lock poisoned")
            .take()
        {
            if handle.join().is_err() {
                error!("sweep protocol worker panicked");
            }
        }
    }
}

struct ProtocolWorker {
    deps: OrchestratorDeps,
    recorder: Arc<SessionRecorder>,
    stop: Arc<AtomicBool>,
    progress: Arc<Mutex<ProgressState>>,
    session_path: String,
    camera_started_here: bool,
}

impl ProtocolWorker {
    fn run(&self) {
        self.deps.bus.publish(&SyncEvent::AcquisitionStarted {
            session_path: self.session_path.clone(),
        });

        let outcome = self.run_protocol();
        let stopped_early = self.stop.load(Ordering::SeqCst);
        let fatal = self.deps.fatal.load(Ordering::SeqCst);

        // Teardown order: detach the recorder from the camera loop first.
        self.deps.recorder_slot.set(None);
        self.deps.ctstim.stop_direction();
        self.deps.state.set_stimulus_active(false);
        self.deps.state.set_acquisition_running(false);
        if self.camera_started_here {
            self.deps.camera.stop();
        }

        match outcome {
            Ok(()) if !fatal => {
                self.deps.bus.publish(&SyncEvent::AcquisitionComplete {
                    session_path: self.session_path.clone(),
                    stopped_early,
                });
                info!(session = %self.session_path, stopped_early, "acquisition complete");
            }
            Ok(()) => {
                // The camera loop already published acquisition_error and
                // flushed what it could.
            }
            Err(e) => {
                error!(error = %e, "acquisition failed");
                self.deps.bus.publish(&SyncEvent::AcquisitionError {
                    error: e.to_string(),
                });
            }
        }

        let _ = self.deps.state.transition(AcquisitionMode::Idle);
        self.deps.state.set_current_session(None);
        self.deps.bus.publish(&SyncEvent::ModeChanged {
            mode: AcquisitionMode::Idle.as_str().to_string(),
        });
        self.set_progress(1.0, "done");
    }

    fn run_protocol(&self) -> AppResult<()> {
        let acquisition = self.deps.params.acquisition();
        let stimulus_params = self.deps.params.stimulus();
        let directions = stimulus_params.directions.clone();
        let repeats = acquisition.repeats;

        let generator = self.deps.stimulus.get()?;
        let plan: Vec<(Direction, f64)> = directions
            .iter()
            .map(|&d| (d, generator.dataset_info(d).sweep_duration_sec))
            .collect();
        let total_sec = self.planned_duration_sec(&acquisition, &plan, repeats);
        let mut done_sec = 0.0;

        self.display_black("baseline")?;
        self.wait_black(acquisition.baseline_sec, done_sec, total_sec, "baseline");
        done_sec += acquisition.baseline_sec;

        'directions: for (dir_idx, &(direction, sweep_sec)) in plan.iter().enumerate() {
            for cycle in 0..repeats {
                if self.should_stop() {
                    break 'directions;
                }
                let stage = format!("{direction} cycle {}/{repeats}", cycle + 1);
                self.set_progress(done_sec / total_sec, &stage);

                // Recorder opens before the sweep starts so the very first
                // stimulus frame is captured; the camera loop records only
                // capture steps that produced a stimulus frame.
                self.recorder.start(direction)?;
                self.deps.ctstim.start_direction(direction)?;
                self.deps.state.set_stimulus_active(true);

                self.wait_sweep(sweep_sec, done_sec, total_sec, &stage);

                self.deps.ctstim.stop_direction();
                self.deps.state.set_stimulus_active(false);
                self.recorder.stop();
                done_sec += sweep_sec;

                if self.should_stop() {
                    break 'directions;
                }
                if cycle + 1 < repeats {
                    self.display_black("between trials")?;
                    self.wait_black(
                        acquisition.between_trials_sec,
                        done_sec,
                        total_sec,
                        "between trials",
                    );
                    done_sec += acquisition.between_trials_sec;
                }
            }
            if dir_idx + 1 < plan.len() && !self.should_stop() {
                self.display_black("between trials")?;
                self.wait_black(
                    acquisition.between_trials_sec,
                    done_sec,
                    total_sec,
                    "between trials",
                );
                done_sec += acquisition.between_trials_sec;
            }
        }

        if self.deps.fatal.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.display_black("baseline")?;
        self.wait_black(acquisition.baseline_sec, done_sec, total_sec, "baseline");

        self.set_progress(0.99, "saving session");
        self.recorder.save()?;
        Ok(())
    }

    fn planned_duration_sec(
        &self,
        acquisition: &crate::config::AcquisitionParams,
        plan: &[(Direction, f64)],
        repeats: u32,
    ) -> f64 {
        let sweeps: f64 = plan.iter().map(|(_, s)| s * repeats as f64).sum();
        let gaps = plan.len().saturating_sub(1) as f64
            + plan.len() as f64 * (repeats.saturating_sub(1)) as f64;
        (2.0 * acquisition.baseline_sec + sweeps + gaps * acquisition.between_trials_sec).max(1e-6)
    }

    /// Publish one black stimulus frame at the configured dimensions.
    fn display_black(&self, stage: &str) -> AppResult<()> {
        let generator = self.deps.stimulus.get()?;
        let frame = generator.black_frame();
        let (height, width) = frame.dim();
        let pixels: Vec<u8> = frame.iter().copied().collect();
        let meta = self.deps.planes.stimulus.write_frame(
            &pixels,
            &FrameDescriptor {
                timestamp_us: monotonic_now_us(),
                width_px: width as u32,
                height_px: height as u32,
                frame_index: Some(0),
                total_frames: Some(1),
                ..Default::default()
            },
        )?;
        self.deps
            .bus
            .publish(&SyncEvent::StimulusFrame { metadata: meta });
        info!(stage, "black screen displayed");
        Ok(())
    }

    fn wait_black(&self, duration_sec: f64, done_sec: f64, total_sec: f64, stage: &str) {
        let deadline = Instant::now() + Duration::from_secs_f64(duration_sec.max(0.0));
        let mut last_progress = Instant::now();
        while Instant::now() < deadline && !self.should_stop() {
            std::thread::sleep(WAIT_SLICE);
            if last_progress.elapsed() >= PROGRESS_INTERVAL {
                last_progress = Instant::now();
                let remaining = deadline.saturating_duration_since(Instant::now());
                let elapsed = duration_sec - remaining.as_secs_f64();
                self.set_progress((done_sec + elapsed) / total_sec, stage);
            }
        }
    }

    /// Wait until the camera-triggered sweep has produced every frame, a
    /// stop was requested, or the camera loop went fatal.
    fn wait_sweep(&self, sweep_sec: f64, done_sec: f64, total_sec: f64, stage: &str) {
        let mut last_progress = Instant::now();
        while !self.should_stop() && !self.deps.ctstim.is_complete() {
            std::thread::sleep(WAIT_SLICE);
            if last_progress.elapsed() >= PROGRESS_INTERVAL {
                last_progress = Instant::now();
                let within = self
                    .deps
                    .ctstim
                    .progress()
                    .map(|(i, n)| i as f64 / n.max(1) as f64)
                    .unwrap_or(0.0);
                self.set_progress((done_sec + within * sweep_sec) / total_sec, stage);
            }
        }
    }

    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.deps.fatal.load(Ordering::SeqCst)
    }

    fn set_progress(&self, fraction: f64, stage: &str) {
        let fraction = fraction.clamp(0.0, 1.0);
        {
            let mut p = self.progress.lock().expect("progress lock poisoned");
            p.fraction = fraction;
            p.stage = stage.to_string();
        }
        self.deps.bus.publish(&SyncEvent::AcquisitionProgress {
            fraction,
            stage: stage.to_string(),
        });
    }
}
