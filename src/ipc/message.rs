//! Wire message types for the three IPC channels.
//!
//! Control requests arrive as one JSON object per line with a `type` field;
//! responses echo the `type` and always carry `success`. The sync channel
//! broadcasts [`SyncEvent`]s; the health channel broadcasts [`HealthPulse`]s.
//! Consumers must ignore event types they do not know.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::FrameMetadata;

// =============================================================================
// Control channel
// =============================================================================

/// A parsed control request. Payload fields stay as JSON; each handler
/// extracts what it needs.
#[derive(Clone, Debug, Deserialize)]
pub struct ControlRequest {
    #[serde(rename = "type")]
    pub command: String,
    #[serde(flatten)]
    pub payload: Value,
}

/// Build the uniform success response shape.
pub fn success_response(command: &str, mut payload: Value) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert("success".into(), Value::Bool(true));
    obj.insert("type".into(), Value::String(command.to_string()));
    if let Some(extra) = payload.as_object_mut() {
        for (key, value) in std::mem::take(extra) {
            // A handler payload never overrides the envelope fields.
            obj.entry(key).or_insert(value);
        }
    }
    Value::Object(obj)
}

/// Build the uniform failure response shape.
pub fn error_response(command: &str, error: &str) -> Value {
    serde_json::json!({
        "success": false,
        "type": command,
        "error": error,
    })
}

// =============================================================================
// Sync/event channel
// =============================================================================

/// Typed messages broadcast on the sync channel.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    AcquisitionStarted {
        session_path: String,
    },
    AcquisitionProgress {
        fraction: f64,
        stage: String,
    },
    AcquisitionComplete {
        session_path: String,
        stopped_early: bool,
    },
    AcquisitionError {
        error: String,
    },
    AnalysisStarted {
        session_path: String,
    },
    AnalysisProgress {
        fraction: f64,
        stage: String,
    },
    AnalysisLayerReady {
        layer_name: String,
        image_base64: String,
        width: u32,
        height: u32,
    },
    AnalysisComplete {
        session_path: String,
        num_areas: u32,
        output_path: String,
    },
    AnalysisError {
        error: String,
    },
    ModeChanged {
        mode: String,
    },
    /// A stimulus frame landed in its shared-memory plane.
    StimulusFrame {
        #[serde(flatten)]
        metadata: FrameMetadata,
    },
    /// A camera frame landed in its shared-memory plane.
    CameraFrame {
        #[serde(flatten)]
        metadata: FrameMetadata,
    },
    /// A float32 analysis layer landed in the analysis plane.
    AnalysisLayer {
        layer_name: String,
        width_px: u32,
        height_px: u32,
        data_size_bytes: usize,
        offset_bytes: usize,
        shm_path: String,
    },
}

// =============================================================================
// Health channel
// =============================================================================

/// Periodic backend-initiated status pulse.
#[derive(Clone, Debug, Serialize)]
pub struct HealthPulse {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp_us: u64,
    pub mode: String,
    pub camera_active: bool,
    pub camera_fps_actual: f64,
    pub acquisition_running: bool,
    pub analysis_running: bool,
    pub sync_entries: usize,
}

impl HealthPulse {
    pub const TYPE: &'static str = "health";
}
