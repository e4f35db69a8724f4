//! Camera capture devices.
//!
//! Hardware enumeration lives outside the core (the launcher's platform
//! utilities); the core sees devices through the [`CaptureDevice`] trait
//! seam. The built-in synthetic camera paces itself to the configured FPS
//! and produces a deterministic gradient with a low-amplitude noise field,
//! which is what the test suites and headless development run against.

pub mod acquisition;

pub use acquisition::{AcquisitionDeps, CameraManager, RecorderSlot};

use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::time::{Duration, Instant};

use crate::core::CapturedFrame;
use crate::error::{AppResult, IsiError};

/// Capabilities reported for one capture device.
#[derive(Clone, Debug, Serialize)]
pub struct CameraInfo {
    pub name: String,
    pub max_width_px: u32,
    pub max_height_px: u32,
    pub max_fps: f64,
    pub provides_hardware_timestamps: bool,
}

/// A blocking frame source.
///
/// `capture` blocks until the next frame is available. Devices that carry a
/// sensor clock report it per frame via `device_timestamp_us`; the
/// acquisition loop probes the first frame and commits to one timestamp
/// source for the whole session.
pub trait CaptureDevice: Send {
    fn name(&self) -> &str;

    fn open(&mut self, width: u32, height: u32, fps: f64) -> AppResult<()>;

    fn capture(&mut self) -> AppResult<CapturedFrame>;

    fn close(&mut self);
}

// =============================================================================
// Synthetic camera
// =============================================================================

pub const SYNTHETIC_CAMERA_NAME: &str = "synthetic";

struct SyntheticState {
    width: u32,
    height: u32,
    frame_interval: Duration,
    next_deadline: Instant,
    frame_counter: u64,
    rng: StdRng,
}

/// Deterministic software camera used headless and under test.
pub struct SyntheticCamera {
    hardware_timestamps: bool,
    state: Option<SyntheticState>,
}

impl SyntheticCamera {
    pub fn new() -> Self {
        Self {
            hardware_timestamps: true,
            state: None,
        }
    }

    /// Disable the simulated sensor clock, forcing the software fallback.
    pub fn without_hardware_timestamps() -> Self {
        Self {
            hardware_timestamps: false,
            state: None,
        }
    }
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureDevice for SyntheticCamera {
    fn name(&self) -> &str {
        SYNTHETIC_CAMERA_NAME
    }

    fn open(&mut self, width: u32, height: u32, fps: f64) -> AppResult<()> {
        if width == 0 || height == 0 {
            return Err(IsiError::Camera("zero capture resolution".into()));
        }
        let fps = if fps > 0.0 { fps } else { 30.0 };
        info!("synthetic camera opened: {width}x{height} @ {fps} fps");
        self.state = Some(SyntheticState {
            width,
            height,
            frame_interval: Duration::from_secs_f64(1.0 / fps),
            next_deadline: Instant::now(),
            frame_counter: 0,
            rng: StdRng::seed_from_u64(0x1515),
        });
        Ok(())
    }

    fn capture(&mut self) -> AppResult<CapturedFrame> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| IsiError::Camera("capture on closed device".into()))?;

        // Pace to the configured frame rate.
        let now = Instant::now();
        if state.next_deadline > now {
            std::thread::sleep(state.next_deadline - now);
        }
        state.next_deadline += state.frame_interval;

        let (width, height) = (state.width, state.height);
        let phase = state.frame_counter as f64 / 10.0;
        let mut pixels = Vec::with_capacity((width * height) as usize);
        for row in 0..height {
            for col in 0..width {
                let gradient = (row as f64 / height as f64 * 128.0)
                    + (col as f64 / width as f64 * 64.0)
                    + 32.0 * (phase).sin();
                let noise: f64 = state.rng.gen_range(-4.0..4.0);
                pixels.push((gradient + noise).clamp(0.0, 255.0) as u8);
            }
        }

        // The simulated sensor clock ticks in perfect frame intervals.
        let device_timestamp_us = self
            .hardware_timestamps
            .then(|| (state.frame_counter as f64 * state.frame_interval.as_secs_f64() * 1e6) as u64);
        state.frame_counter += 1;

        Ok(CapturedFrame {
            pixels,
            width,
            height,
            channels: 1,
            device_timestamp_us,
        })
    }

    fn close(&mut self) {
        self.state = None;
    }
}

// =============================================================================
// Device selection
// =============================================================================

/// Devices visible to the core. Real hardware enumeration is the
/// launcher's concern; it injects its findings through camera parameters.
pub fn detect_devices() -> Vec<CameraInfo> {
    vec![CameraInfo {
        name: SYNTHETIC_CAMERA_NAME.to_string(),
        max_width_px: 2048,
        max_height_px: 2048,
        max_fps: 120.0,
        provides_hardware_timestamps: true,
    }]
}

/// Open the selected device by name.
pub fn open_device(name: &str) -> AppResult<Box<dyn CaptureDevice>> {
    match name {
        SYNTHETIC_CAMERA_NAME | "" => Ok(Box::new(SyntheticCamera::new())),
        other => Err(IsiError::Camera(format!("unknown camera: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_requires_open() {
        let mut camera = SyntheticCamera::new();
        assert!(camera.capture().is_err());
    }

    #[test]
    fn test_capture_shape_and_timestamps() {
        let mut camera = SyntheticCamera::new();
        camera.open(32, 16, 1000.0).unwrap();
        let first = camera.capture().unwrap();
        let second = camera.capture().unwrap();
        assert_eq!(first.pixels.len(), 32 * 16);
        assert_eq!(first.channels, 1);
        assert_eq!(first.device_timestamp_us, Some(0));
        assert_eq!(second.device_timestamp_us, Some(1000));
    }

    #[test]
    fn test_software_only_device_reports_no_timestamp() {
        let mut camera = SyntheticCamera::without_hardware_timestamps();
        camera.open(8, 8, 1000.0).unwrap();
        assert_eq!(camera.capture().unwrap().device_timestamp_us, None);
    }

    #[test]
    fn test_open_device_by_name() {
        assert!(open_device(SYNTHETIC_CAMERA_NAME).is_ok());
        assert!(open_device("firewire0").is_err());
    }

    #[test]
    fn test_capture_paces_to_fps() {
        let mut camera = SyntheticCamera::new();
        camera.open(4, 4, 200.0).unwrap();
        let start = Instant::now();
        for _ in 0..10 {
            camera.capture().unwrap();
        }
        // 10 frames at 200 fps is 50 ms of pacing (first frame is immediate).
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
