//! Typed parameter groups and the process-wide parameter store.
//!
//! Parameters are organized into named groups (`monitor`, `camera`,
//! `stimulus`, `acquisition`, `analysis`). Each group is a plain serde
//! struct with a `validate()` that names the offending field. Updates are
//! JSON patches: only the keys present in the patch change, the merged
//! group is validated before it replaces the old one, and registered
//! change callbacks run after the data lock is released.
//!
//! Persistence is the launcher's responsibility; `load`/`save` are exposed
//! for it but never called implicitly.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use crate::core::Direction;
use crate::error::{AppResult, IsiError};

// =============================================================================
// Parameter groups
// =============================================================================

/// Monitor geometry and resolution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorParams {
    pub monitor_distance_cm: f64,
    pub monitor_lateral_angle_deg: f64,
    pub monitor_width_px: u32,
    pub monitor_height_px: u32,
    pub monitor_width_cm: f64,
    pub monitor_height_cm: f64,
}

impl Default for MonitorParams {
    fn default() -> Self {
        Self {
            monitor_distance_cm: 10.0,
            monitor_lateral_angle_deg: 0.0,
            monitor_width_px: 1920,
            monitor_height_px: 1080,
            monitor_width_cm: 52.0,
            monitor_height_cm: 29.0,
        }
    }
}

impl MonitorParams {
    pub fn validate(&self) -> AppResult<()> {
        if self.monitor_distance_cm <= 0.0 {
            return Err(IsiError::validation("monitor_distance_cm must be > 0"));
        }
        if self.monitor_width_px == 0 || self.monitor_height_px == 0 {
            return Err(IsiError::validation("monitor resolution must be non-zero"));
        }
        if self.monitor_width_cm <= 0.0 || self.monitor_height_cm <= 0.0 {
            return Err(IsiError::validation("monitor physical size must be > 0"));
        }
        Ok(())
    }
}

/// Camera selection and capture geometry.
///
/// `camera_fps` may be zero while previewing; it is required to be positive
/// before a recording can start.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraParams {
    pub selected_camera: String,
    pub camera_width_px: u32,
    pub camera_height_px: u32,
    pub camera_fps: f64,
}

impl Default for CameraParams {
    fn default() -> Self {
        Self {
            selected_camera: "synthetic".to_string(),
            camera_width_px: 640,
            camera_height_px: 480,
            camera_fps: 30.0,
        }
    }
}

impl CameraParams {
    pub fn validate(&self) -> AppResult<()> {
        if self.camera_width_px == 0 || self.camera_height_px == 0 {
            return Err(IsiError::validation("camera resolution must be non-zero"));
        }
        if self.camera_fps < 0.0 {
            return Err(IsiError::validation("camera_fps must not be negative"));
        }
        Ok(())
    }

    /// Recording-time gate: a positive FPS is mandatory for acquisition.
    pub fn require_fps(&self) -> AppResult<f64> {
        if self.camera_fps > 0.0 {
            Ok(self.camera_fps)
        } else {
            Err(IsiError::validation(
                "camera_fps is required and must be > 0 to start a recording",
            ))
        }
    }
}

/// Drifting-bar stimulus shape and timing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StimulusParams {
    pub bar_width_deg: f64,
    pub drift_speed_deg_s: f64,
    pub checker_size_deg: f64,
    pub flicker_hz: f64,
    pub contrast: f64,
    pub num_cycles: u32,
    pub directions: Vec<Direction>,
}

impl Default for StimulusParams {
    fn default() -> Self {
        Self {
            bar_width_deg: 20.0,
            drift_speed_deg_s: 9.0,
            checker_size_deg: 25.0,
            flicker_hz: 6.0,
            contrast: 1.0,
            num_cycles: 10,
            directions: Direction::ALL.to_vec(),
        }
    }
}

impl StimulusParams {
    pub fn validate(&self) -> AppResult<()> {
        if self.bar_width_deg <= 0.0 {
            return Err(IsiError::validation("bar_width_deg must be > 0"));
        }
        if self.drift_speed_deg_s <= 0.0 {
            return Err(IsiError::validation("drift_speed_deg_s must be > 0"));
        }
        if self.checker_size_deg <= 0.0 {
            return Err(IsiError::validation("checker_size_deg must be > 0"));
        }
        if self.flicker_hz < 0.0 {
            return Err(IsiError::validation("flicker_hz must not be negative"));
        }
        if !(0.0..=1.0).contains(&self.contrast) {
            return Err(IsiError::validation("contrast must be within [0, 1]"));
        }
        if self.num_cycles == 0 {
            return Err(IsiError::validation("num_cycles must be >= 1"));
        }
        if self.directions.is_empty() {
            return Err(IsiError::validation("directions must not be empty"));
        }
        Ok(())
    }
}

/// Sweep-protocol timing around and between directions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionParams {
    pub baseline_sec: f64,
    pub between_trials_sec: f64,
    /// Per-direction repeats of the full cycle block.
    pub repeats: u32,
}

impl Default for AcquisitionParams {
    fn default() -> Self {
        Self {
            baseline_sec: 5.0,
            between_trials_sec: 5.0,
            repeats: 1,
        }
    }
}

impl AcquisitionParams {
    pub fn validate(&self) -> AppResult<()> {
        if self.baseline_sec < 0.0 || self.between_trials_sec < 0.0 {
            return Err(IsiError::validation("durations must not be negative"));
        }
        if self.repeats == 0 {
            return Err(IsiError::validation("repeats must be >= 1"));
        }
        Ok(())
    }
}

/// Retinotopic analysis tuning.
///
/// `ring_size_mm` is retained for UI compatibility; the core pipeline has
/// no consumer for it today.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisParams {
    pub smoothing_sigma: f64,
    pub magnitude_threshold: f64,
    pub phase_filter_sigma: f64,
    pub vfs_threshold_sd: f64,
    /// Minimum connected-component size, in pixels.
    pub area_min_size: usize,
    pub response_threshold_percent: f64,
    pub gradient_window_size: usize,
    pub ring_size_mm: f64,
    pub hemodynamic_delay_sec: f64,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self {
            smoothing_sigma: 2.0,
            magnitude_threshold: 0.0,
            phase_filter_sigma: 0.0,
            vfs_threshold_sd: 0.0,
            area_min_size: 100,
            response_threshold_percent: 0.0,
            gradient_window_size: 1,
            ring_size_mm: 0.5,
            hemodynamic_delay_sec: 1.5,
        }
    }
}

impl AnalysisParams {
    pub fn validate(&self) -> AppResult<()> {
        if self.smoothing_sigma < 0.0 || self.phase_filter_sigma < 0.0 {
            return Err(IsiError::validation("smoothing sigmas must not be negative"));
        }
        if !(0.0..=1.0).contains(&self.magnitude_threshold) {
            return Err(IsiError::validation("magnitude_threshold must be within [0, 1]"));
        }
        if !(0.0..=100.0).contains(&self.response_threshold_percent) {
            return Err(IsiError::validation(
                "response_threshold_percent must be within [0, 100]",
            ));
        }
        if self.gradient_window_size == 0 {
            return Err(IsiError::validation("gradient_window_size must be >= 1"));
        }
        if self.hemodynamic_delay_sec < 0.0 {
            return Err(IsiError::validation("hemodynamic_delay_sec must not be negative"));
        }
        Ok(())
    }
}

// =============================================================================
// Store
// =============================================================================

/// Identifies one parameter group in updates and change notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterGroupId {
    Monitor,
    Camera,
    Stimulus,
    Acquisition,
    Analysis,
}

impl ParameterGroupId {
    pub fn parse(s: &str) -> AppResult<Self> {
        match s {
            "monitor" => Ok(Self::Monitor),
            "camera" => Ok(Self::Camera),
            "stimulus" => Ok(Self::Stimulus),
            "acquisition" => Ok(Self::Acquisition),
            "analysis" => Ok(Self::Analysis),
            other => Err(IsiError::validation(format!("Unknown parameter group: {other}"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Monitor => "monitor",
            Self::Camera => "camera",
            Self::Stimulus => "stimulus",
            Self::Acquisition => "acquisition",
            Self::Analysis => "analysis",
        }
    }
}

impl fmt::Display for ParameterGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The full typed bundle, as written into session metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterBundle {
    pub monitor: MonitorParams,
    pub camera: CameraParams,
    pub stimulus: StimulusParams,
    pub acquisition: AcquisitionParams,
    pub analysis: AnalysisParams,
}

type ChangeCallback = Box<dyn Fn(ParameterGroupId) + Send + Sync>;

/// Thread-safe store of all parameter groups.
///
/// One lock guards the data; callbacks are invoked after it is released so
/// a callback may read the store again without deadlocking.
pub struct ParameterStore {
    data: Mutex<ParameterBundle>,
    callbacks: Mutex<Vec<ChangeCallback>>,
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self::new(ParameterBundle::default())
    }
}

impl ParameterStore {
    pub fn new(bundle: ParameterBundle) -> Self {
        Self {
            data: Mutex::new(bundle),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Load a bundle from a JSON file written by the launcher.
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let bundle: ParameterBundle = serde_json::from_str(&text)?;
        bundle.validate()?;
        Ok(Self::new(bundle))
    }

    /// Write the current bundle to a JSON file. Caller-driven only.
    pub fn save(&self, path: &Path) -> AppResult<()> {
        let bundle = self.snapshot();
        let text = serde_json::to_string_pretty(&bundle)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Register a change callback; it runs synchronously after each
    /// successful update, outside the data lock.
    pub fn on_change(&self, callback: impl Fn(ParameterGroupId) + Send + Sync + 'static) {
        self.callbacks
            .lock()
            .expect("parameter callback lock poisoned")
            .push(Box::new(callback));
    }

    pub fn monitor(&self) -> MonitorParams {
        self.lock().monitor.clone()
    }

    pub fn camera(&self) -> CameraParams {
        self.lock().camera.clone()
    }

    pub fn stimulus(&self) -> StimulusParams {
        self.lock().stimulus.clone()
    }

    pub fn acquisition(&self) -> AcquisitionParams {
        self.lock().acquisition.clone()
    }

    pub fn analysis(&self) -> AnalysisParams {
        self.lock().analysis.clone()
    }

    /// Full typed snapshot for session metadata.
    pub fn snapshot(&self) -> ParameterBundle {
        self.lock().clone()
    }

    /// Apply a JSON patch to one group.
    ///
    /// Only keys present in `patch` change. The merged group is validated
    /// before it is stored; on failure the store is untouched. Unknown keys
    /// are a validation error, not silently dropped.
    pub fn update_group(&self, group: ParameterGroupId, patch: &Value) -> AppResult<()> {
        let patch_obj = patch
            .as_object()
            .ok_or_else(|| IsiError::validation("parameters patch must be a JSON object"))?;

        {
            let mut data = self.lock();
            match group {
                ParameterGroupId::Monitor => data.monitor = merged(&data.monitor, patch_obj)?,
                ParameterGroupId::Camera => data.camera = merged(&data.camera, patch_obj)?,
                ParameterGroupId::Stimulus => data.stimulus = merged(&data.stimulus, patch_obj)?,
                ParameterGroupId::Acquisition => {
                    data.acquisition = merged(&data.acquisition, patch_obj)?
                }
                ParameterGroupId::Analysis => data.analysis = merged(&data.analysis, patch_obj)?,
            }
        }

        let callbacks = self
            .callbacks
            .lock()
            .expect("parameter callback lock poisoned");
        for callback in callbacks.iter() {
            callback(group);
        }
        Ok(())
    }

    /// One group rendered as JSON (for `get_parameters`).
    pub fn group_json(&self, group: ParameterGroupId) -> Value {
        let data = self.lock();
        let result = match group {
            ParameterGroupId::Monitor => serde_json::to_value(&data.monitor),
            ParameterGroupId::Camera => serde_json::to_value(&data.camera),
            ParameterGroupId::Stimulus => serde_json::to_value(&data.stimulus),
            ParameterGroupId::Acquisition => serde_json::to_value(&data.acquisition),
            ParameterGroupId::Analysis => serde_json::to_value(&data.analysis),
        };
        result.unwrap_or(Value::Null)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ParameterBundle> {
        self.data.lock().expect("parameter store lock poisoned")
    }
}

impl ParameterBundle {
    pub fn validate(&self) -> AppResult<()> {
        self.monitor.validate()?;
        self.camera.validate()?;
        self.stimulus.validate()?;
        self.acquisition.validate()?;
        self.analysis.validate()?;
        Ok(())
    }
}

/// Merge a JSON patch into a typed group and validate the result.
fn merged<T>(current: &T, patch: &serde_json::Map<String, Value>) -> AppResult<T>
where
    T: Serialize + for<'de> Deserialize<'de> + Validated,
{
    let mut value = serde_json::to_value(current)?;
    let obj = value
        .as_object_mut()
        .ok_or_else(|| IsiError::validation("parameter group is not an object"))?;
    for (key, patch_value) in patch {
        if !obj.contains_key(key) {
            return Err(IsiError::validation(format!("Unknown parameter: {key}")));
        }
        obj.insert(key.clone(), patch_value.clone());
    }
    let updated: T = serde_json::from_value(value)?;
    updated.validate()?;
    Ok(updated)
}

/// Internal trait so `merged` can validate any group uniformly.
trait Validated {
    fn validate(&self) -> AppResult<()>;
}

macro_rules! impl_validated {
    ($($ty:ty),*) => {
        $(impl Validated for $ty {
            fn validate(&self) -> AppResult<()> {
                <$ty>::validate(self)
            }
        })*
    };
}

impl_validated!(
    MonitorParams,
    CameraParams,
    StimulusParams,
    AcquisitionParams,
    AnalysisParams
);
