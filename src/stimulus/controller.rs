//! Camera-triggered stimulus controller.
//!
//! Owns the per-direction sweep state consulted by the acquisition loop.
//! Each captured camera frame triggers exactly one `generate_next_frame`
//! call in the same thread, so stimulus cadence is camera cadence by
//! construction: 1:1 correspondence with no independent stimulus clock.

use ndarray::Array2;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::core::Direction;
use crate::error::AppResult;
use crate::session::StimulusEvent;
use crate::stimulus::generator::DatasetInfo;
use crate::stimulus::StimulusProvider;

struct ActiveSweep {
    direction: Direction,
    frame_index: u32,
    info: DatasetInfo,
}

/// Thread-safe per-direction sweep state plus the shared generator.
pub struct CameraTriggeredStimulus {
    provider: std::sync::Arc<StimulusProvider>,
    sweep: Mutex<Option<ActiveSweep>>,
}

impl CameraTriggeredStimulus {
    pub fn new(provider: std::sync::Arc<StimulusProvider>) -> Self {
        Self {
            provider,
            sweep: Mutex::new(None),
        }
    }

    /// Begin a sweep: look up the direction's dataset geometry and reset
    /// the frame counter.
    pub fn start_direction(&self, direction: Direction) -> AppResult<DatasetInfo> {
        let generator = self.provider.get()?;
        let info = generator.dataset_info(direction);
        info!(
            %direction,
            total_frames = info.total_frames,
            start_angle = info.start_angle,
            end_angle = info.end_angle,
            "starting camera-triggered sweep"
        );
        *self.lock() = Some(ActiveSweep {
            direction,
            frame_index: 0,
            info,
        });
        Ok(info)
    }

    /// End the sweep; subsequent triggers return nothing.
    pub fn stop_direction(&self) {
        if let Some(sweep) = self.lock().take() {
            debug!(
                direction = %sweep.direction,
                frames_generated = sweep.frame_index,
                "stopped camera-triggered sweep"
            );
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    /// `(frame_index, total_frames)` of the running sweep, if any.
    pub fn progress(&self) -> Option<(u32, u32)> {
        self.lock()
            .as_ref()
            .map(|s| (s.frame_index, s.info.total_frames))
    }

    /// True once every frame of the active sweep has been generated.
    pub fn is_complete(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|s| s.frame_index >= s.info.total_frames)
    }

    /// Render the next stimulus frame for a camera frame captured at
    /// `timestamp_us`. Returns `None` when no sweep is active or the sweep
    /// has run out of frames.
    pub fn generate_next_frame(
        &self,
        timestamp_us: u64,
        frame_id: u64,
    ) -> AppResult<Option<(Array2<u8>, StimulusEvent, DatasetInfo)>> {
        let (direction, frame_index, info) = {
            let mut sweep = self.lock();
            let Some(active) = sweep.as_mut() else {
                return Ok(None);
            };
            if active.frame_index >= active.info.total_frames {
                return Ok(None);
            }
            let current = active.frame_index;
            active.frame_index += 1;
            (active.direction, current, active.info)
        };

        // Rendering happens outside the sweep lock; the generator itself is
        // immutable and shared.
        let generator = self.provider.get()?;
        let (frame, angle) = generator.generate_frame(direction, frame_index, true)?;
        let event = StimulusEvent {
            timestamp_us,
            frame_id,
            frame_index,
            direction,
            angle_degrees: angle,
        };
        Ok(Some((frame, event, info)))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ActiveSweep>> {
        self.sweep.lock().expect("stimulus sweep lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ParameterBundle, ParameterStore};
    use std::sync::Arc;

    fn test_controller() -> CameraTriggeredStimulus {
        let mut bundle = ParameterBundle::default();
        bundle.monitor.monitor_width_px = 32;
        bundle.monitor.monitor_height_px = 16;
        bundle.stimulus.num_cycles = 1;
        bundle.stimulus.drift_speed_deg_s = 90.0;
        bundle.camera.camera_fps = 10.0;
        let store = Arc::new(ParameterStore::new(bundle));
        let provider = Arc::new(StimulusProvider::new(store));
        CameraTriggeredStimulus::new(provider)
    }

    #[test]
    fn test_inactive_controller_generates_nothing() {
        let ctrl = test_controller();
        assert!(!ctrl.is_active());
        assert!(ctrl.generate_next_frame(100, 1).unwrap().is_none());
    }

    #[test]
    fn test_sweep_counts_frames_and_completes() {
        let ctrl = test_controller();
        let info = ctrl.start_direction(Direction::LR).unwrap();
        assert!(ctrl.is_active());

        for i in 0..info.total_frames {
            let (_, event, _) = ctrl
                .generate_next_frame(i as u64 * 1000, i as u64)
                .unwrap()
                .expect("frame expected while sweep active");
            assert_eq!(event.frame_index, i);
            assert_eq!(event.direction, Direction::LR);
            assert_eq!(event.timestamp_us, i as u64 * 1000);
        }

        assert!(ctrl.is_complete());
        // Past the end: active but exhausted.
        assert!(ctrl.generate_next_frame(999_999, 99).unwrap().is_none());
        assert_eq!(ctrl.progress(), Some((info.total_frames, info.total_frames)));
    }

    #[test]
    fn test_stop_direction_deactivates() {
        let ctrl = test_controller();
        ctrl.start_direction(Direction::BT).unwrap();
        ctrl.stop_direction();
        assert!(!ctrl.is_active());
        assert!(ctrl.generate_next_frame(5, 1).unwrap().is_none());
    }

    #[test]
    fn test_restart_resets_frame_index() {
        let ctrl = test_controller();
        ctrl.start_direction(Direction::LR).unwrap();
        ctrl.generate_next_frame(1, 1).unwrap();
        ctrl.generate_next_frame(2, 2).unwrap();
        ctrl.start_direction(Direction::RL).unwrap();
        let (_, event, _) = ctrl.generate_next_frame(3, 3).unwrap().unwrap();
        assert_eq!(event.frame_index, 0);
        assert_eq!(event.direction, Direction::RL);
    }
}
