//! Memory-mapped frame planes shared with the UI process.
//!
//! Three planes exist for the process lifetime, one file each in the OS
//! temp directory: stimulus (100 MiB), camera (100 MiB), analysis (50 MiB).
//! A writer takes the plane lock, copies the frame bytes at the next ring
//! offset (wrapping to zero when the frame would not fit before the end),
//! and returns a metadata record describing where the bytes live. The
//! reader is an external process that maps the same file and reads at the
//! offsets published on the sync channel.
//!
//! Stimulus and camera planes keep a registry of the most recent frames so
//! late-attaching readers can resynchronize. Analysis layers are written at
//! offset zero and overwrite the previous layer; the reader fetches
//! sequentially.

use memmap2::MmapMut;
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::core::{FrameDescriptor, FrameMetadata};
use crate::error::{AppResult, IsiError};

/// Most recent frame records retained per plane.
const REGISTRY_DEPTH: usize = 10;

const MIB: usize = 1024 * 1024;

/// Which of the three fixed planes this is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaneKind {
    Stimulus,
    Camera,
    Analysis,
}

impl PlaneKind {
    pub fn file_name(self) -> &'static str {
        match self {
            PlaneKind::Stimulus => "isi_macroscope_stimulus_shm",
            PlaneKind::Camera => "isi_macroscope_camera_shm",
            PlaneKind::Analysis => "isi_macroscope_analysis_shm",
        }
    }

    pub fn capacity_bytes(self) -> usize {
        match self {
            PlaneKind::Stimulus | PlaneKind::Camera => 100 * MIB,
            PlaneKind::Analysis => 50 * MIB,
        }
    }
}

struct PlaneState {
    mmap: MmapMut,
    next_offset: usize,
    frame_counter: u64,
    registry: VecDeque<FrameMetadata>,
}

/// One shared-memory frame plane.
pub struct FramePlane {
    kind: PlaneKind,
    path: PathBuf,
    capacity: usize,
    state: Mutex<PlaneState>,
}

impl FramePlane {
    /// Create (or truncate) the backing file in `dir` and map it.
    pub fn create(kind: PlaneKind, dir: &Path) -> AppResult<Self> {
        let capacity = kind.capacity_bytes();
        let path = dir.join(kind.file_name());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| {
                IsiError::SharedMemory(format!("failed to create {}: {e}", path.display()))
            })?;
        file.set_len(capacity as u64).map_err(|e| {
            IsiError::SharedMemory(format!("failed to size {}: {e}", path.display()))
        })?;

        // SAFETY: the file was just created with the mapped length and stays
        // open through the mapping; no other in-process writer exists yet.
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| {
            IsiError::SharedMemory(format!("failed to map {}: {e}", path.display()))
        })?;

        info!(
            plane = kind.file_name(),
            capacity_mib = capacity / MIB,
            path = %path.display(),
            "shared-memory plane ready"
        );

        Ok(Self {
            kind,
            path,
            capacity,
            state: Mutex::new(PlaneState {
                mmap,
                next_offset: 0,
                frame_counter: 0,
                registry: VecDeque::with_capacity(REGISTRY_DEPTH),
            }),
        })
    }

    pub fn kind(&self) -> PlaneKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one presentation frame and return its metadata record.
    ///
    /// Stimulus writes must carry positive `frame_index` and `total_frames`;
    /// a missing or zero value fails the write before any bytes move.
    pub fn write_frame(&self, data: &[u8], desc: &FrameDescriptor) -> AppResult<FrameMetadata> {
        if self.kind == PlaneKind::Stimulus {
            match (desc.frame_index, desc.total_frames) {
                (Some(_), Some(total)) if total > 0 => {}
                _ => {
                    return Err(IsiError::SharedMemory(
                        "stimulus frame metadata requires frame_index and positive total_frames"
                            .into(),
                    ));
                }
            }
        }
        let expected = desc.width_px as usize * desc.height_px as usize;
        if expected == 0 || data.len() < expected {
            return Err(IsiError::SharedMemory(format!(
                "frame buffer of {} bytes does not cover {}x{} px",
                data.len(),
                desc.width_px,
                desc.height_px
            )));
        }

        if data.len() > self.capacity {
            return Err(IsiError::SharedMemory(format!(
                "frame of {} bytes exceeds plane capacity {}",
                data.len(),
                self.capacity
            )));
        }

        let mut state = self.lock();
        // Frames never straddle the end of the plane; wrap instead.
        let offset = if state.next_offset + data.len() > self.capacity {
            0
        } else {
            state.next_offset
        };
        state.mmap[offset..offset + data.len()].copy_from_slice(data);
        state.next_offset = offset + data.len();
        state.frame_counter += 1;
        let metadata = FrameMetadata {
            frame_id: state.frame_counter,
            timestamp_us: desc.timestamp_us,
            frame_index: desc.frame_index,
            total_frames: desc.total_frames,
            direction: desc.direction,
            angle_degrees: desc.angle_degrees,
            start_angle: desc.start_angle,
            end_angle: desc.end_angle,
            width_px: desc.width_px,
            height_px: desc.height_px,
            data_size_bytes: data.len(),
            offset_bytes: offset,
            shm_path: self.path.display().to_string(),
        };
        if state.registry.len() >= REGISTRY_DEPTH {
            state.registry.pop_front();
        }
        state.registry.push_back(metadata.clone());
        Ok(metadata)
    }

    /// Write a float32 analysis layer at offset zero, overwriting the
    /// previous layer.
    pub fn write_layer(&self, data: &[f32]) -> AppResult<usize> {
        let size = std::mem::size_of_val(data);
        if size > self.capacity {
            return Err(IsiError::SharedMemory(format!(
                "analysis layer of {size} bytes exceeds plane capacity {}",
                self.capacity
            )));
        }
        let mut state = self.lock();
        let dst = &mut state.mmap[0..size];
        for (chunk, value) in dst.chunks_exact_mut(4).zip(data) {
            chunk.copy_from_slice(&value.to_ne_bytes());
        }
        Ok(size)
    }

    /// Metadata records of the most recent frames, oldest first.
    pub fn recent_frames(&self) -> Vec<FrameMetadata> {
        self.lock().registry.iter().cloned().collect()
    }

    /// Read back bytes at an offset. Test and diagnostic use; the real
    /// reader is the UI process mapping the file directly.
    pub fn read_at(&self, offset: usize, len: usize) -> AppResult<Vec<u8>> {
        if offset + len > self.capacity {
            return Err(IsiError::SharedMemory("read beyond plane capacity".into()));
        }
        Ok(self.lock().mmap[offset..offset + len].to_vec())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PlaneState> {
        self.state.lock().expect("frame plane lock poisoned")
    }
}

impl Drop for FramePlane {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "could not remove plane file");
        }
    }
}

/// The three fixed planes, created once at startup.
pub struct FramePlanes {
    pub stimulus: FramePlane,
    pub camera: FramePlane,
    pub analysis: FramePlane,
}

impl FramePlanes {
    pub fn create(dir: &Path) -> AppResult<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            stimulus: FramePlane::create(PlaneKind::Stimulus, dir)?,
            camera: FramePlane::create(PlaneKind::Camera, dir)?,
            analysis: FramePlane::create(PlaneKind::Analysis, dir)?,
        })
    }
}
