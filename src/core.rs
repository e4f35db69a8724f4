//! Core data types shared across the acquisition and analysis subsystems.
//!
//! Everything here is deliberately small and serializable: these are the
//! types that cross thread boundaries, get written into session metadata,
//! and ride the sync channel as frame-ready notifications.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use std::time::Instant;

use crate::error::{AppResult, IsiError};

// =============================================================================
// Direction
// =============================================================================

/// Drift direction of the stimulus bar across the monitor.
///
/// `LR`/`RL` sweep along azimuth, `TB`/`BT` along altitude. Opposite pairs
/// form a bidirectional sweep used to cancel the hemodynamic delay bias.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    LR,
    RL,
    TB,
    BT,
}

impl Direction {
    /// All four directions in canonical protocol order.
    pub const ALL: [Direction; 4] = [Direction::LR, Direction::RL, Direction::TB, Direction::BT];

    /// The opposite-direction partner of a bidirectional pair.
    pub fn opposite(self) -> Direction {
        match self {
            Direction::LR => Direction::RL,
            Direction::RL => Direction::LR,
            Direction::TB => Direction::BT,
            Direction::BT => Direction::TB,
        }
    }

    /// True for the horizontal (azimuth) axis, false for vertical (altitude).
    pub fn is_horizontal(self) -> bool {
        matches!(self, Direction::LR | Direction::RL)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::LR => "LR",
            Direction::RL => "RL",
            Direction::TB => "TB",
            Direction::BT => "BT",
        }
    }

    pub fn parse(s: &str) -> AppResult<Direction> {
        match s {
            "LR" => Ok(Direction::LR),
            "RL" => Ok(Direction::RL),
            "TB" => Ok(Direction::TB),
            "BT" => Ok(Direction::BT),
            other => Err(IsiError::validation(format!("Unknown direction: {other}"))),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Timestamps
// =============================================================================

/// Where a frame timestamp came from.
///
/// The source is probed once when the camera starts and recorded in session
/// metadata; it is the default for every subsequent frame in that session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampSource {
    Hardware,
    Software,
}

impl TimestampSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TimestampSource::Hardware => "hardware",
            TimestampSource::Software => "software",
        }
    }
}

static PROCESS_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Microseconds elapsed on the monotonic clock since process start.
///
/// Used as the software timestamp source; hardware sources supply their own
/// device clock. Camera and stimulus timestamps for one session always come
/// from the same clock domain.
pub fn monotonic_now_us() -> u64 {
    let epoch = PROCESS_EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as u64
}

// =============================================================================
// Frames
// =============================================================================

/// A raw frame as delivered by a capture device.
///
/// Pixels are row-major, `channels` is 1 (mono) or 3 (RGB). Frames are
/// recorded in this native layout; presentation paths convert to grayscale.
#[derive(Clone, Debug)]
pub struct CapturedFrame {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    /// Device-reported timestamp, if the hardware provides one.
    pub device_timestamp_us: Option<u64>,
}

impl CapturedFrame {
    pub fn len_bytes(&self) -> usize {
        self.pixels.len()
    }

    /// Collapse to the canonical 2-D grayscale presentation layout.
    ///
    /// RGB is reduced with the ITU-R BT.601 luminance weights
    /// `0.299 R + 0.587 G + 0.114 B`; mono frames are returned as-is.
    pub fn to_grayscale(&self) -> Vec<u8> {
        match self.channels {
            1 => self.pixels.clone(),
            3 => self
                .pixels
                .chunks_exact(3)
                .map(|px| luminance_u8(px[0], px[1], px[2]))
                .collect(),
            n => {
                // Unknown layouts degrade to the first channel.
                self.pixels.iter().step_by(n as usize).copied().collect()
            }
        }
    }
}

/// BT.601 luminance of one RGB pixel, rounded to `u8`.
pub fn luminance_u8(r: u8, g: u8, b: u8) -> u8 {
    let y = 0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64;
    y.round().clamp(0.0, 255.0) as u8
}

// =============================================================================
// Frame metadata (shared-memory plane records)
// =============================================================================

/// Descriptor supplied by a writer when publishing a frame to a plane.
#[derive(Clone, Debug, Default)]
pub struct FrameDescriptor {
    pub timestamp_us: u64,
    pub width_px: u32,
    pub height_px: u32,
    pub frame_index: Option<u32>,
    pub total_frames: Option<u32>,
    pub direction: Option<Direction>,
    pub angle_degrees: Option<f64>,
    pub start_angle: Option<f64>,
    pub end_angle: Option<f64>,
}

/// Metadata record published on the sync channel after a plane write.
///
/// `offset_bytes`/`data_size_bytes`/`shm_path` tell the reader where the
/// pixel bytes live; the rest describes what the frame is. For stimulus
/// frames `frame_index` and `total_frames` are required and positive.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub frame_id: u64,
    pub timestamp_us: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_frames: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub angle_degrees: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_angle: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_angle: Option<f64>,
    pub width_px: u32,
    pub height_px: u32,
    pub data_size_bytes: usize,
    pub offset_bytes: usize,
    pub shm_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_roundtrip() {
        for dir in Direction::ALL {
            assert_eq!(Direction::parse(dir.as_str()).unwrap(), dir);
        }
        assert!(Direction::parse("XY").is_err());
    }

    #[test]
    fn test_opposite_pairs() {
        assert_eq!(Direction::LR.opposite(), Direction::RL);
        assert_eq!(Direction::BT.opposite(), Direction::TB);
        for dir in Direction::ALL {
            assert_eq!(dir.opposite().opposite(), dir);
            assert_eq!(dir.is_horizontal(), dir.opposite().is_horizontal());
        }
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let a = monotonic_now_us();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = monotonic_now_us();
        assert!(b > a);
    }

    #[test]
    fn test_grayscale_red_pixel() {
        // 0.299 * 255 rounds to 76.
        assert_eq!(luminance_u8(255, 0, 0), 76);
        let frame = CapturedFrame {
            pixels: vec![255, 0, 0],
            width: 1,
            height: 1,
            channels: 3,
            device_timestamp_us: None,
        };
        assert_eq!(frame.to_grayscale(), vec![76]);
    }

    #[test]
    fn test_grayscale_mono_passthrough() {
        let frame = CapturedFrame {
            pixels: vec![1, 2, 3, 4],
            width: 2,
            height: 2,
            channels: 1,
            device_timestamp_us: None,
        };
        assert_eq!(frame.to_grayscale(), vec![1, 2, 3, 4]);
    }
}
