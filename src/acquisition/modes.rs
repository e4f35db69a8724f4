//! Mode controllers: preview, record, playback.
//!
//! All three share the stimulus generator through its provider; none of
//! them share state with each other. Preview renders one frame per
//! request; record is a thin validation wrapper over the orchestrator;
//! playback serves recorded sessions with a lazily opened, one-at-a-time
//! per-direction HDF5 handle.

use ndarray::Array2;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::acquisition::orchestrator::AcquisitionOrchestrator;
use crate::acquisition::state::{AcquisitionMode, StateCoordinator};
use crate::config::ParameterStore;
use crate::core::{luminance_u8, monotonic_now_us, Direction, FrameDescriptor, FrameMetadata};
use crate::error::{AppResult, IsiError};
use crate::ipc::message::SyncEvent;
use crate::ipc::{EventBus, FramePlanes};
use crate::session::{self, SessionMetadata};
use crate::stimulus::StimulusProvider;

// =============================================================================
// Preview
// =============================================================================

/// Renders single stimulus frames on demand and publishes them.
///
/// Never touches the recorder or the camera-triggered controller.
pub struct PreviewController {
    state: Arc<StateCoordinator>,
    stimulus: Arc<StimulusProvider>,
    planes: Arc<FramePlanes>,
    bus: Arc<EventBus>,
}

impl PreviewController {
    pub fn new(
        state: Arc<StateCoordinator>,
        stimulus: Arc<StimulusProvider>,
        planes: Arc<FramePlanes>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            state,
            stimulus,
            planes,
            bus,
        }
    }

    /// Validate the transition, render one frame, publish it.
    pub fn activate(
        &self,
        direction: Direction,
        frame_index: u32,
        show_bar_mask: bool,
    ) -> AppResult<FrameMetadata> {
        self.state.transition(AcquisitionMode::Preview)?;
        self.bus.publish(&SyncEvent::ModeChanged {
            mode: AcquisitionMode::Preview.as_str().to_string(),
        });
        self.render(direction, frame_index, show_bar_mask)
    }

    /// Render and publish without touching the mode (used by
    /// `get_stimulus_frame` while already previewing).
    pub fn render(
        &self,
        direction: Direction,
        frame_index: u32,
        show_bar_mask: bool,
    ) -> AppResult<FrameMetadata> {
        let generator = self.stimulus.get()?;
        let info = generator.dataset_info(direction);
        let (frame, angle) = generator.generate_frame(direction, frame_index, show_bar_mask)?;
        let (height, width) = frame.dim();
        let pixels: Vec<u8> = frame.iter().copied().collect();
        let metadata = self.planes.stimulus.write_frame(
            &pixels,
            &FrameDescriptor {
                timestamp_us: monotonic_now_us(),
                width_px: width as u32,
                height_px: height as u32,
                frame_index: Some(frame_index),
                total_frames: Some(info.total_frames),
                direction: Some(direction),
                angle_degrees: Some(angle),
                start_angle: Some(info.start_angle),
                end_angle: Some(info.end_angle),
            },
        )?;
        self.bus.publish(&SyncEvent::StimulusFrame {
            metadata: metadata.clone(),
        });
        debug!(%direction, frame_index, angle, "preview frame published");
        Ok(metadata)
    }

    /// Publish a single black frame at the configured dimensions.
    pub fn display_black(&self) -> AppResult<FrameMetadata> {
        let generator = self.stimulus.get()?;
        let frame = generator.black_frame();
        let (height, width) = frame.dim();
        let pixels: Vec<u8> = frame.iter().copied().collect();
        let metadata = self.planes.stimulus.write_frame(
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
        self.bus.publish(&SyncEvent::StimulusFrame {
            metadata: metadata.clone(),
        });
        Ok(metadata)
    }

    pub fn deactivate(&self) -> AppResult<()> {
        self.state.transition(AcquisitionMode::Idle)?;
        self.bus.publish(&SyncEvent::ModeChanged {
            mode: AcquisitionMode::Idle.as_str().to_string(),
        });
        Ok(())
    }
}

// =============================================================================
// Record
// =============================================================================

/// Thin wrapper: validate, transition, delegate to the orchestrator.
pub struct RecordController {
    state: Arc<StateCoordinator>,
    params: Arc<ParameterStore>,
    orchestrator: Arc<AcquisitionOrchestrator>,
    bus: Arc<EventBus>,
    session_root: PathBuf,
}

impl RecordController {
    pub fn new(
        state: Arc<StateCoordinator>,
        params: Arc<ParameterStore>,
        orchestrator: Arc<AcquisitionOrchestrator>,
        bus: Arc<EventBus>,
        session_root: PathBuf,
    ) -> Self {
        Self {
            state,
            params,
            orchestrator,
            bus,
            session_root,
        }
    }

    /// Start a recording session named by the operator.
    pub fn activate(&self, session_name: &str) -> AppResult<PathBuf> {
        self.params.camera().require_fps()?;
        if session_name.is_empty() || session_name.contains(std::path::is_separator) {
            return Err(IsiError::validation(format!(
                "invalid session name: '{session_name}'"
            )));
        }
        self.state.transition(AcquisitionMode::Recording)?;
        self.bus.publish(&SyncEvent::ModeChanged {
            mode: AcquisitionMode::Recording.as_str().to_string(),
        });

        let session_dir = self.session_root.join(session_name);
        if let Err(e) = self.orchestrator.start(&session_dir, session_name) {
            // Roll the mode back so a failed start leaves the system idle.
            let _ = self.state.transition(AcquisitionMode::Idle);
            self.bus.publish(&SyncEvent::ModeChanged {
                mode: AcquisitionMode::Idle.as_str().to_string(),
            });
            return Err(e);
        }
        Ok(session_dir)
    }

    /// Signal the orchestrator to stop; teardown happens on its worker.
    pub fn deactivate(&self) {
        info!("stop requested for running acquisition");
        self.orchestrator.request_stop();
    }
}

// =============================================================================
// Playback
// =============================================================================

struct OpenDirection {
    direction: Direction,
    file: hdf5::File,
    frame_count: usize,
    frame_shape: Vec<usize>,
}

struct LoadedSession {
    path: PathBuf,
    metadata: SessionMetadata,
    open: Option<OpenDirection>,
}

/// Holds the currently opened session and serves frames from it.
pub struct PlaybackController {
    state: Arc<StateCoordinator>,
    bus: Arc<EventBus>,
    session: Mutex<Option<LoadedSession>>,
}

impl PlaybackController {
    pub fn new(state: Arc<StateCoordinator>, bus: Arc<EventBus>) -> Self {
        Self {
            state,
            bus,
            session: Mutex::new(None),
        }
    }

    /// Load a session's metadata and enter playback mode. Frame data is
    /// not read here.
    pub fn activate(&self, session_path: &Path) -> AppResult<SessionMetadata> {
        let metadata = SessionMetadata::load(session_path)?;
        self.state.transition(AcquisitionMode::Playback)?;
        self.bus.publish(&SyncEvent::ModeChanged {
            mode: AcquisitionMode::Playback.as_str().to_string(),
        });
        self.state
            .set_current_session(Some(session_path.display().to_string()));
        *self.lock() = Some(LoadedSession {
            path: session_path.to_path_buf(),
            metadata: metadata.clone(),
            open: None,
        });
        info!(session = %session_path.display(), "session loaded for playback");
        Ok(metadata)
    }

    pub fn current_session(&self) -> Option<PathBuf> {
        self.lock().as_ref().map(|s| s.path.clone())
    }

    pub fn metadata(&self) -> Option<SessionMetadata> {
        self.lock().as_ref().map(|s| s.metadata.clone())
    }

    /// Lightweight per-direction info: frame count and shape, no frame
    /// bytes. Opens (or reuses) the direction's HDF5 handle.
    pub fn get_session_data(&self, direction: Direction) -> AppResult<(usize, Vec<usize>)> {
        let mut guard = self.lock();
        let session = guard
            .as_mut()
            .ok_or_else(|| IsiError::validation("no session loaded"))?;
        let open = Self::ensure_open(session, direction)?;
        Ok((open.frame_count, open.frame_shape.clone()))
    }

    /// Read exactly one frame, returned as grayscale `u8` rows.
    pub fn get_playback_frame(
        &self,
        direction: Direction,
        frame_index: usize,
    ) -> AppResult<Array2<u8>> {
        let mut guard = self.lock();
        let session = guard
            .as_mut()
            .ok_or_else(|| IsiError::validation("no session loaded"))?;
        let open = Self::ensure_open(session, direction)?;
        if frame_index >= open.frame_count {
            return Err(IsiError::validation(format!(
                "frame_index {frame_index} out of range (frames: {})",
                open.frame_count
            )));
        }

        let dataset = open.file.dataset("frames")?;
        match open.frame_shape.len() {
            2 => {
                let frame: Array2<u8> =
                    dataset.read_slice(ndarray::s![frame_index, .., ..])?;
                Ok(frame)
            }
            3 => {
                let frame: ndarray::Array3<u8> =
                    dataset.read_slice(ndarray::s![frame_index, .., .., ..])?;
                let (height, width, channels) = frame.dim();
                if channels != 3 {
                    return Err(IsiError::Storage(format!(
                        "unsupported channel count: {channels}"
                    )));
                }
                Ok(Array2::from_shape_fn((height, width), |(r, c)| {
                    luminance_u8(frame[[r, c, 0]], frame[[r, c, 1]], frame[[r, c, 2]])
                }))
            }
            n => Err(IsiError::Storage(format!(
                "unsupported frame rank: {}",
                n + 1
            ))),
        }
    }

    /// Close any open handle and drop the session.
    pub fn deactivate(&self) -> AppResult<()> {
        *self.lock() = None;
        self.state.set_current_session(None);
        self.state.transition(AcquisitionMode::Idle)?;
        self.bus.publish(&SyncEvent::ModeChanged {
            mode: AcquisitionMode::Idle.as_str().to_string(),
        });
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<LoadedSession>> {
        self.session.lock().expect("playback session lock poisoned")
    }

    /// One handle at a time: opening direction D closes D'.
    fn ensure_open(
        session: &mut LoadedSession,
        direction: Direction,
    ) -> AppResult<&OpenDirection> {
        let reuse = session
            .open
            .as_ref()
            .is_some_and(|open| open.direction == direction);
        if !reuse {
            if !session.metadata.directions.contains(&direction) {
                return Err(IsiError::validation(format!(
                    "direction {direction} was not recorded in this session"
                )));
            }
            let path = session.path.join(session::camera_file(direction));
            let file = hdf5::File::open(&path)?;
            let shape = file.dataset("frames")?.shape();
            if shape.is_empty() {
                return Err(IsiError::Storage("frames dataset has no shape".into()));
            }
            debug!(%direction, ?shape, "opened playback direction");
            session.open = Some(OpenDirection {
                direction,
                frame_count: shape[0],
                frame_shape: shape[1..].to_vec(),
                file,
            });
        }
        Ok(session.open.as_ref().expect("direction opened above"))
    }
}
