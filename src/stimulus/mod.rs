//! Stimulus generation: spherical precompute, frame rendering, and the
//! camera-triggered sweep controller.
//!
//! One generator serves two thin drivers that share it but not state: the
//! preview controller renders one frame per request, the camera-triggered
//! controller renders one frame per captured camera frame.

pub mod controller;
pub mod generator;
pub mod spherical;

pub use controller::CameraTriggeredStimulus;
pub use generator::{ComputeDevice, DatasetInfo, StimulusGenerator};
pub use spherical::{monitor_half_extents_deg, SphericalField};

use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::config::ParameterStore;
use crate::error::AppResult;

/// Lazily builds and caches the generator for the current parameters.
///
/// Invalidated whenever `stimulus` or `monitor` parameters change; the next
/// request rebuilds the generator (and its precomputed field) on demand.
pub struct StimulusProvider {
    store: Arc<ParameterStore>,
    cached: Mutex<Option<Arc<StimulusGenerator>>>,
}

impl StimulusProvider {
    pub fn new(store: Arc<ParameterStore>) -> Self {
        Self {
            store,
            cached: Mutex::new(None),
        }
    }

    /// The generator for the current parameter set, building it if needed.
    pub fn get(&self) -> AppResult<Arc<StimulusGenerator>> {
        let mut cached = self.cached.lock().expect("stimulus provider lock poisoned");
        if let Some(generator) = cached.as_ref() {
            return Ok(Arc::clone(generator));
        }
        let monitor = self.store.monitor();
        let stimulus = self.store.stimulus();
        let fps = self.store.camera().camera_fps;
        let generator = Arc::new(StimulusGenerator::new(&monitor, &stimulus, fps)?);
        *cached = Some(Arc::clone(&generator));
        Ok(generator)
    }

    /// Drop the cached generator; the next `get` rebuilds it.
    pub fn invalidate(&self) {
        debug!("stimulus generator invalidated");
        self.cached
            .lock()
            .expect("stimulus provider lock poisoned")
            .take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ParameterGroupId, ParameterStore};

    #[test]
    fn test_provider_caches_until_invalidated() {
        let store = Arc::new(ParameterStore::default());
        let provider = StimulusProvider::new(Arc::clone(&store));

        let first = provider.get().unwrap();
        let second = provider.get().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        provider.invalidate();
        let third = provider.get().unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn test_rebuild_sees_new_parameters() {
        let store = Arc::new(ParameterStore::default());
        let provider = StimulusProvider::new(Arc::clone(&store));
        let before = provider.get().unwrap().frame_shape();

        store
            .update_group(
                ParameterGroupId::Monitor,
                &serde_json::json!({"monitor_width_px": 320, "monitor_height_px": 200}),
            )
            .unwrap();
        provider.invalidate();

        let after = provider.get().unwrap().frame_shape();
        assert_ne!(before, after);
        assert_eq!(after, (200, 320));
    }
}
