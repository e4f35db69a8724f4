//! Recorded-session directory layout.
//!
//! A session is a filesystem directory named by the operator:
//!
//! ```text
//! <session>/
//!   metadata.json                # parameters, directions, timestamp_info
//!   anatomical.npy               # optional reference image
//!   {LR,RL,TB,BT}_camera.h5      # datasets: frames, timestamps
//!   {LR,RL,TB,BT}_stimulus.h5    # dataset:  angles
//!   {LR,RL,TB,BT}_events.json    # ordered stimulus event records
//!   analysis_results/            # written by the analysis stage
//! ```
//!
//! This module owns the metadata document, the per-direction file naming,
//! session discovery, and the anatomical image file. The anatomical image
//! is NPY v1.0; no crate in our stack speaks that format, so the fixed
//! 10-byte magic + padded header dict is written directly.

use chrono::Utc;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::Path;

use crate::config::{AcquisitionParams, CameraParams, MonitorParams, StimulusParams};
use crate::core::Direction;
use crate::error::{AppResult, IsiError};

pub const METADATA_FILE: &str = "metadata.json";
pub const ANATOMICAL_FILE: &str = "anatomical.npy";
pub const ANALYSIS_DIR: &str = "analysis_results";
pub const ANALYSIS_RESULTS_FILE: &str = "analysis_results.h5";

pub fn camera_file(direction: Direction) -> String {
    format!("{direction}_camera.h5")
}

pub fn stimulus_file(direction: Direction) -> String {
    format!("{direction}_stimulus.h5")
}

pub fn events_file(direction: Direction) -> String {
    format!("{direction}_events.json")
}

// =============================================================================
// Metadata
// =============================================================================

/// How timestamps were produced for this session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimestampInfo {
    pub camera_timestamp_source: String,
    pub stimulus_timestamp_source: String,
    pub synchronization_method: String,
}

impl TimestampInfo {
    /// The camera-triggered model: the stimulus inherits the camera clock.
    pub fn camera_triggered(camera_source: &str) -> Self {
        Self {
            camera_timestamp_source: camera_source.to_string(),
            stimulus_timestamp_source: camera_source.to_string(),
            synchronization_method: "camera_triggered".to_string(),
        }
    }
}

/// The `metadata.json` document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_name: String,
    /// Epoch seconds at session creation.
    pub timestamp: i64,
    /// Exactly the directions with recorded data.
    pub directions: Vec<Direction>,
    pub stimulus_params: StimulusParams,
    pub monitor: MonitorParams,
    pub camera: CameraParams,
    pub acquisition: AcquisitionParams,
    pub timestamp_info: TimestampInfo,
}

impl SessionMetadata {
    pub fn new(
        session_name: &str,
        stimulus_params: StimulusParams,
        monitor: MonitorParams,
        camera: CameraParams,
        acquisition: AcquisitionParams,
        timestamp_info: TimestampInfo,
    ) -> Self {
        Self {
            session_name: session_name.to_string(),
            timestamp: Utc::now().timestamp(),
            directions: Vec::new(),
            stimulus_params,
            monitor,
            camera,
            acquisition,
            timestamp_info,
        }
    }

    pub fn load(session_dir: &Path) -> AppResult<Self> {
        let path = session_dir.join(METADATA_FILE);
        let text = std::fs::read_to_string(&path).map_err(|e| {
            IsiError::Storage(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, session_dir: &Path) -> AppResult<()> {
        let path = session_dir.join(METADATA_FILE);
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, text)?;
        Ok(())
    }
}

/// One stimulus event, paired 1:1 with a recorded camera frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StimulusEvent {
    pub timestamp_us: u64,
    pub frame_id: u64,
    pub frame_index: u32,
    pub direction: Direction,
    pub angle_degrees: f64,
}

pub fn load_events(session_dir: &Path, direction: Direction) -> AppResult<Vec<StimulusEvent>> {
    let path = session_dir.join(events_file(direction));
    let text = std::fs::read_to_string(&path)
        .map_err(|e| IsiError::Storage(format!("cannot read {}: {e}", path.display())))?;
    Ok(serde_json::from_str(&text)?)
}

// =============================================================================
// Session discovery
// =============================================================================

/// Lightweight entry for `list_sessions`.
#[derive(Clone, Debug, Serialize)]
pub struct SessionSummary {
    pub session_name: String,
    pub session_path: String,
    pub timestamp: i64,
    pub directions: Vec<Direction>,
    pub has_anatomical: bool,
    pub has_analysis: bool,
}

/// Enumerate session directories under `root`, newest first. Directories
/// without a readable metadata document are skipped.
pub fn list_sessions(root: &Path) -> AppResult<Vec<SessionSummary>> {
    let mut sessions = Vec::new();
    if !root.exists() {
        return Ok(sessions);
    }
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Ok(metadata) = SessionMetadata::load(&path) else {
            continue;
        };
        sessions.push(SessionSummary {
            session_name: metadata.session_name,
            session_path: path.display().to_string(),
            timestamp: metadata.timestamp,
            directions: metadata.directions,
            has_anatomical: path.join(ANATOMICAL_FILE).exists(),
            has_analysis: path.join(ANALYSIS_DIR).join(ANALYSIS_RESULTS_FILE).exists(),
        });
    }
    sessions.sort_by_key(|s| std::cmp::Reverse(s.timestamp));
    Ok(sessions)
}

// =============================================================================
// NPY (anatomical image)
// =============================================================================

const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";

/// Write a 2-D `u8` array as NPY v1.0.
pub fn write_npy_u8(path: &Path, image: &Array2<u8>) -> AppResult<()> {
    let (rows, cols) = image.dim();
    let header_dict = format!(
        "{{'descr': '|u1', 'fortran_order': False, 'shape': ({rows}, {cols}), }}"
    );
    // Magic(6) + version(2) + len(2) + header, padded so the data section
    // starts on a 64-byte boundary, header terminated by newline.
    let unpadded = NPY_MAGIC.len() + 2 + 2 + header_dict.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    let header_len = header_dict.len() + padding + 1;

    let mut file = std::fs::File::create(path)?;
    file.write_all(NPY_MAGIC)?;
    file.write_all(&[1, 0])?;
    file.write_all(&(header_len as u16).to_le_bytes())?;
    file.write_all(header_dict.as_bytes())?;
    file.write_all(&vec![b' '; padding])?;
    file.write_all(b"\n")?;
    let data = image
        .as_slice()
        .map(|s| s.to_vec())
        .unwrap_or_else(|| image.iter().copied().collect());
    file.write_all(&data)?;
    Ok(())
}

/// Read a 2-D `u8` NPY file written by `write_npy_u8`.
pub fn read_npy_u8(path: &Path) -> AppResult<Array2<u8>> {
    let mut file = std::fs::File::open(path)?;
    let mut magic = [0u8; 6];
    file.read_exact(&mut magic)?;
    if &magic != NPY_MAGIC {
        return Err(IsiError::Storage(format!(
            "{} is not an NPY file",
            path.display()
        )));
    }
    let mut version = [0u8; 2];
    file.read_exact(&mut version)?;
    let mut len_bytes = [0u8; 2];
    file.read_exact(&mut len_bytes)?;
    let header_len = u16::from_le_bytes(len_bytes) as usize;
    let mut header = vec![0u8; header_len];
    file.read_exact(&mut header)?;
    let header = String::from_utf8_lossy(&header);

    if !header.contains("'|u1'") {
        return Err(IsiError::Storage(format!(
            "unsupported NPY dtype in {}",
            path.display()
        )));
    }
    let shape = parse_npy_shape(&header).ok_or_else(|| {
        IsiError::Storage(format!("cannot parse NPY shape in {}", path.display()))
    })?;

    let mut data = Vec::with_capacity(shape.0 * shape.1);
    file.read_to_end(&mut data)?;
    if data.len() < shape.0 * shape.1 {
        return Err(IsiError::Storage(format!(
            "truncated NPY data in {}",
            path.display()
        )));
    }
    data.truncate(shape.0 * shape.1);
    Array2::from_shape_vec(shape, data)
        .map_err(|e| IsiError::Storage(format!("bad NPY shape: {e}")))
}

fn parse_npy_shape(header: &str) -> Option<(usize, usize)> {
    let start = header.find("'shape':")? + "'shape':".len();
    let open = header[start..].find('(')? + start + 1;
    let close = header[open..].find(')')? + open;
    let mut dims = header[open..close]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().ok());
    match (dims.next(), dims.next(), dims.next()) {
        (Some(Some(rows)), Some(Some(cols)), None) => Some((rows, cols)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParameterBundle;

    fn metadata() -> SessionMetadata {
        let bundle = ParameterBundle::default();
        SessionMetadata::new(
            "test_session",
            bundle.stimulus,
            bundle.monitor,
            bundle.camera,
            bundle.acquisition,
            TimestampInfo::camera_triggered("software"),
        )
    }

    #[test]
    fn test_metadata_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut meta = metadata();
        meta.directions = vec![Direction::LR, Direction::RL];
        meta.save(dir.path()).unwrap();

        let loaded = SessionMetadata::load(dir.path()).unwrap();
        assert_eq!(loaded.session_name, "test_session");
        assert_eq!(loaded.directions, vec![Direction::LR, Direction::RL]);
        assert_eq!(loaded.timestamp_info.synchronization_method, "camera_triggered");
    }

    #[test]
    fn test_file_naming() {
        assert_eq!(camera_file(Direction::LR), "LR_camera.h5");
        assert_eq!(stimulus_file(Direction::BT), "BT_stimulus.h5");
        assert_eq!(events_file(Direction::TB), "TB_events.json");
    }

    #[test]
    fn test_npy_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anatomical.npy");
        let image =
            Array2::from_shape_fn((13, 17), |(r, c)| ((r * 17 + c) % 251) as u8);
        write_npy_u8(&path, &image).unwrap();
        let restored = read_npy_u8(&path).unwrap();
        assert_eq!(restored, image);
    }

    #[test]
    fn test_npy_header_is_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.npy");
        write_npy_u8(&path, &Array2::zeros((2, 3))).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!((10 + header_len) % 64, 0);
        assert_eq!(bytes.len(), 10 + header_len + 6);
    }

    #[test]
    fn test_list_sessions_skips_foreign_dirs(){
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("session_a");
        std::fs::create_dir(&good).unwrap();
        metadata().save(&good).unwrap();
        std::fs::create_dir(dir.path().join("not_a_session")).unwrap();

        let sessions = list_sessions(dir.path()).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_name, "test_session");
        assert!(!sessions[0].has_analysis);
    }
}
