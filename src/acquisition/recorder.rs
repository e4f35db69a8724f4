//! Session recorder.
//!
//! Created per recording session with a target directory and a metadata
//! skeleton; destroyed after the final flush. During a sweep the recorder
//! appends camera frames, timestamps, and stimulus events to in-memory
//! per-direction buffers; `save` writes the session directory layout of
//! [`crate::session`]. Frame bytes are copied on append so buffers never
//! alias the capture driver's internal buffer.
//!
//! Save-time invariants: frame and timestamp counts match per direction,
//! a non-empty session has at least one direction with data, and
//! `metadata.directions` lists exactly the directions that have data.

use ndarray::{Array1, Array3, Array4};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::core::{CapturedFrame, Direction};
use crate::error::{AppResult, IsiError};
use crate::session::{self, SessionMetadata, StimulusEvent};

/// Gzip level for camera frame stacks.
const DEFLATE_LEVEL: u8 = 4;

#[derive(Default)]
struct DirectionBuffers {
    frames: Vec<CapturedFrame>,
    timestamps: Vec<u64>,
    events: Vec<StimulusEvent>,
}

struct RecorderInner {
    open: Option<(Direction, DirectionBuffers)>,
    completed: BTreeMap<Direction, DirectionBuffers>,
    anatomical: Option<ndarray::Array2<u8>>,
    frame_shape: Option<(u32, u32, u8)>,
    saved: bool,
}

/// Buffered writer for one recording session.
pub struct SessionRecorder {
    session_dir: PathBuf,
    metadata: Mutex<SessionMetadata>,
    inner: Mutex<RecorderInner>,
}

impl SessionRecorder {
    /// Create the session directory and an empty recorder.
    pub fn new(session_dir: &Path, metadata: SessionMetadata) -> AppResult<Self> {
        std::fs::create_dir_all(session_dir)?;
        Ok(Self {
            session_dir: session_dir.to_path_buf(),
            metadata: Mutex::new(metadata),
            inner: Mutex::new(RecorderInner {
                open: None,
                completed: BTreeMap::new(),
                anatomical: None,
                frame_shape: None,
                saved: false,
            }),
        })
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Open buffers for a direction. Re-opening a direction recorded in an
    /// earlier cycle appends to its existing buffers.
    pub fn start(&self, direction: Direction) -> AppResult<()> {
        let mut inner = self.lock();
        if inner.saved {
            return Err(IsiError::Storage("recorder already flushed".into()));
        }
        if let Some((open, _)) = &inner.open {
            return Err(IsiError::Storage(format!(
                "direction {open} is still recording"
            )));
        }
        let buffers = inner.completed.remove(&direction).unwrap_or_default();
        inner.open = Some((direction, buffers));
        Ok(())
    }

    /// True while a direction is open for appends.
    pub fn is_recording(&self) -> bool {
        self.lock().open.is_some()
    }

    /// Append one camera frame. The pixel bytes are copied here.
    pub fn record_camera_frame(&self, timestamp_us: u64, frame: &CapturedFrame) -> AppResult<()> {
        let mut inner = self.lock();
        let shape = (frame.width, frame.height, frame.channels);
        match inner.frame_shape {
            None => inner.frame_shape = Some(shape),
            Some(expected) if expected != shape => {
                return Err(IsiError::Storage(format!(
                    "frame shape changed mid-session: {expected:?} -> {shape:?}"
                )));
            }
            Some(_) => {}
        }
        let Some((_, buffers)) = inner.open.as_mut() else {
            return Err(IsiError::Storage("no direction open for recording".into()));
        };
        buffers.frames.push(frame.clone());
        buffers.timestamps.push(timestamp_us);
        Ok(())
    }

    /// Append the stimulus event paired with the camera frame recorded in
    /// the same acquisition-loop step.
    pub fn record_stimulus_event(&self, event: StimulusEvent) -> AppResult<()> {
        let mut inner = self.lock();
        let Some((direction, buffers)) = inner.open.as_mut() else {
            return Err(IsiError::Storage("no direction open for recording".into()));
        };
        if event.direction != *direction {
            return Err(IsiError::Storage(format!(
                "stimulus event for {} while recording {direction}",
                event.direction
            )));
        }
        buffers.events.push(event);
        Ok(())
    }

    /// Keep a copy of the anatomical reference image; written on save.
    pub fn set_anatomical(&self, image: ndarray::Array2<u8>) {
        self.lock().anatomical = Some(image);
    }

    pub fn has_anatomical(&self) -> bool {
        self.lock().anatomical.is_some()
    }

    /// Finalize the open direction; no further appends are accepted for it.
    pub fn stop(&self) {
        let mut inner = self.lock();
        if let Some((direction, buffers)) = inner.open.take() {
            info!(
                %direction,
                frames = buffers.frames.len(),
                events = buffers.events.len(),
                "direction finalized"
            );
            inner.completed.insert(direction, buffers);
        }
    }

    /// Flush the session to disk as the layout described in the session
    /// module. Consumes nothing; callable once.
    pub fn save(&self) -> AppResult<PathBuf> {
        self.stop();
        let mut inner = self.lock();
        if inner.saved {
            return Err(IsiError::Storage("recorder already flushed".into()));
        }

        let recorded: Vec<Direction> = inner
            .completed
            .iter()
            .filter(|(_, b)| !b.frames.is_empty())
            .map(|(d, _)| *d)
            .collect();
        if recorded.is_empty() {
            return Err(IsiError::Storage(
                "session has no recorded frames in any direction".into(),
            ));
        }

        for (direction, buffers) in &inner.completed {
            if buffers.frames.len() != buffers.timestamps.len() {
                return Err(IsiError::Storage(format!(
                    "direction {direction}: {} frames but {} timestamps",
                    buffers.frames.len(),
                    buffers.timestamps.len()
                )));
            }
        }

        for direction in &recorded {
            let buffers = &inner.completed[direction];
            self.write_direction(*direction, buffers)?;
        }

        if let Some(anatomical) = &inner.anatomical {
            session::write_npy_u8(&self.session_dir.join(session::ANATOMICAL_FILE), anatomical)?;
        }

        {
            let mut metadata = self.metadata.lock().expect("metadata lock poisoned");
            metadata.directions = recorded;
            metadata.save(&self.session_dir)?;
        }

        inner.saved = true;
        info!(session = %self.session_dir.display(), "session flushed");
        Ok(self.session_dir.clone())
    }

    /// Best-effort flush used by the fatal-error path: the session is left
    /// on disk as-is for forensic inspection; failures are logged, not
    /// propagated.
    pub fn abort_flush(&self) {
        warn!(session = %self.session_dir.display(), "best-effort flush after fatal error");
        if let Err(e) = self.save() {
            error!(error = %e, "best-effort flush failed");
        }
    }

    fn write_direction(&self, direction: Direction, buffers: &DirectionBuffers) -> AppResult<()> {
        let first = &buffers.frames[0];
        let (width, height, channels) =
            (first.width as usize, first.height as usize, first.channels as usize);
        let n = buffers.frames.len();

        let mut pixels = Vec::with_capacity(n * height * width * channels);
        for frame in &buffers.frames {
            pixels.extend_from_slice(&frame.pixels);
        }

        let camera_path = self.session_dir.join(session::camera_file(direction));
        let file = hdf5::File::create(&camera_path)?;
        if channels == 1 {
            let stack = Array3::from_shape_vec((n, height, width), pixels)
                .map_err(|e| IsiError::Storage(format!("frame stack shape: {e}")))?;
            file.new_dataset_builder()
                .deflate(DEFLATE_LEVEL)
                .chunk((1, height, width))
                .with_data(&stack)
                .create("frames")?;
        } else {
            let stack = Array4::from_shape_vec((n, height, width, channels), pixels)
                .map_err(|e| IsiError::Storage(format!("frame stack shape: {e}")))?;
            file.new_dataset_builder()
                .deflate(DEFLATE_LEVEL)
                .chunk((1, height, width, channels))
                .with_data(&stack)
                .create("frames")?;
        }
        file.new_dataset_builder()
            .with_data(&Array1::from(buffers.timestamps.clone()))
            .create("timestamps")?;

        let stimulus_path = self.session_dir.join(session::stimulus_file(direction));
        let angles: Array1<f64> = buffers.events.iter().map(|e| e.angle_degrees).collect();
        let stim_file = hdf5::File::create(&stimulus_path)?;
        stim_file
            .new_dataset_builder()
            .with_data(&angles)
            .create("angles")?;

        let events_path = self.session_dir.join(session::events_file(direction));
        std::fs::write(&events_path, serde_json::to_string_pretty(&buffers.events)?)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecorderInner> {
        self.inner.lock().expect("recorder lock poisoned")
    }
}
