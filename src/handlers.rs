//! Control-command handlers.
//!
//! Each handler is a thin adapter: extract fields from the request
//! payload, delegate to the owning component, shape the response payload.
//! `build_registry` wires the full command surface; duplicate names fail
//! the build, before the control loop ever starts.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};

use crate::acquisition::AcquisitionMode;
use crate::app::AppContext;
use crate::camera;
use crate::config::ParameterGroupId;
use crate::core::{monotonic_now_us, Direction};
use crate::error::{AppResult, IsiError};
use crate::ipc::CommandRegistry;
use crate::session;

/// Build the full command table.
pub fn build_registry() -> AppResult<CommandRegistry> {
    let mut registry = CommandRegistry::new();

    registry.register("ping", ping)?;
    registry.register("get_system_status", get_system_status)?;
    registry.register("get_parameters", get_parameters)?;
    registry.register("update_parameters", update_parameters)?;
    registry.register("update_stimulus_parameters", update_stimulus_parameters)?;
    registry.register("get_sync_stats", get_sync_stats)?;

    registry.register("detect_cameras", detect_cameras)?;
    registry.register("get_camera_capabilities", get_camera_capabilities)?;
    registry.register("start_camera_acquisition", start_camera_acquisition)?;
    registry.register("stop_camera_acquisition", stop_camera_acquisition)?;
    registry.register("capture_anatomical", capture_anatomical)?;

    registry.register("get_stimulus_frame", get_stimulus_frame)?;
    registry.register("display_black_screen", display_black_screen)?;

    registry.register("set_acquisition_mode", set_acquisition_mode)?;
    registry.register("start_acquisition", start_acquisition)?;
    registry.register("stop_acquisition", stop_acquisition)?;
    registry.register("get_acquisition_status", get_acquisition_status)?;

    registry.register("list_sessions", list_sessions)?;
    registry.register("load_session", load_session)?;
    registry.register("get_session_data", get_session_data)?;
    registry.register("get_playback_frame", get_playback_frame)?;
    registry.register("unload_session", unload_session)?;

    registry.register("start_analysis", start_analysis)?;
    registry.register("stop_analysis", stop_analysis)?;
    registry.register("get_analysis_status", get_analysis_status)?;
    registry.register("get_analysis_results", get_analysis_results)?;
    registry.register("get_analysis_layer", get_analysis_layer)?;

    Ok(registry)
}

// =============================================================================
// Payload extraction helpers
// =============================================================================

fn str_field<'a>(payload: &'a Value, key: &str) -> AppResult<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| IsiError::validation(format!("missing field: {key}")))
}

fn u64_field(payload: &Value, key: &str) -> AppResult<u64> {
    payload
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| IsiError::validation(format!("missing field: {key}")))
}

fn direction_field(payload: &Value) -> AppResult<Direction> {
    Direction::parse(str_field(payload, "direction")?)
}

// =============================================================================
// Liveness / status / parameters
// =============================================================================

fn ping(_ctx: &AppContext, _payload: &Value) -> AppResult<Value> {
    Ok(json!({ "pong": true, "timestamp_us": monotonic_now_us() }))
}

fn get_system_status(ctx: &AppContext, _payload: &Value) -> AppResult<Value> {
    Ok(serde_json::to_value(ctx.health_pulse())?)
}

fn get_parameters(ctx: &AppContext, payload: &Value) -> AppResult<Value> {
    match payload.get("group").and_then(Value::as_str) {
        Some(name) => {
            let group = ParameterGroupId::parse(name)?;
            Ok(json!({ "group": name, "parameters": ctx.params.group_json(group) }))
        }
        None => Ok(json!({ "parameters": serde_json::to_value(ctx.params.snapshot())? })),
    }
}

fn update_parameters(ctx: &AppContext, payload: &Value) -> AppResult<Value> {
    let group = ParameterGroupId::parse(str_field(payload, "group")?)?;
    let patch = payload
        .get("parameters")
        .ok_or_else(|| IsiError::validation("missing field: parameters"))?;
    ctx.params.update_group(group, patch)?;
    Ok(json!({ "group": group.as_str(), "parameters": ctx.params.group_json(group) }))
}

fn update_stimulus_parameters(ctx: &AppContext, payload: &Value) -> AppResult<Value> {
    let patch = payload
        .get("parameters")
        .ok_or_else(|| IsiError::validation("missing field: parameters"))?;
    ctx.params.update_group(ParameterGroupId::Stimulus, patch)?;
    Ok(json!({ "parameters": ctx.params.group_json(ParameterGroupId::Stimulus) }))
}

fn get_sync_stats(ctx: &AppContext, payload: &Value) -> AppResult<Value> {
    let window = payload
        .get("window_seconds")
        .and_then(Value::as_f64)
        .unwrap_or(5.0);
    Ok(serde_json::to_value(ctx.sync_tracker.stats(window))?)
}

// =============================================================================
// Camera lifecycle
// =============================================================================

fn detect_cameras(_ctx: &AppContext, _payload: &Value) -> AppResult<Value> {
    Ok(json!({ "cameras": camera::detect_devices() }))
}

fn get_camera_capabilities(ctx: &AppContext, payload: &Value) -> AppResult<Value> {
    let name = payload
        .get("camera_name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| ctx.params.camera().selected_camera);
    let info = camera::detect_devices()
        .into_iter()
        .find(|c| c.name == name)
        .ok_or_else(|| IsiError::Camera(format!("unknown camera: {name}")))?;
    Ok(serde_json::to_value(info)?)
}

fn start_camera_acquisition(ctx: &AppContext, _payload: &Value) -> AppResult<Value> {
    let params = ctx.params.camera();
    let device = camera::open_device(&params.selected_camera)?;
    ctx.camera.start(device, &params)?;
    Ok(json!({
        "camera": params.selected_camera,
        "timestamp_source": ctx.camera.timestamp_source().map(|s| s.as_str()),
    }))
}

fn stop_camera_acquisition(ctx: &AppContext, _payload: &Value) -> AppResult<Value> {
    ctx.camera.stop();
    Ok(json!({}))
}

fn capture_anatomical(ctx: &AppContext, _payload: &Value) -> AppResult<Value> {
    let frame = ctx
        .camera
        .latest_frame()
        .ok_or_else(|| IsiError::Camera("no camera frame available".into()))?;
    let recorder = ctx
        .recorder_slot
        .get()
        .ok_or_else(|| IsiError::validation("no active recording session"))?;
    let gray = frame.to_grayscale();
    let image =
        ndarray::Array2::from_shape_vec((frame.height as usize, frame.width as usize), gray)
            .map_err(|e| IsiError::Camera(format!("frame shape: {e}")))?;
    recorder.set_anatomical(image);
    Ok(json!({ "width_px": frame.width, "height_px": frame.height }))
}

// =============================================================================
// Stimulus
// =============================================================================

fn get_stimulus_frame(ctx: &AppContext, payload: &Value) -> AppResult<Value> {
    let direction = direction_field(payload)?;
    let frame_index = payload
        .get("frame_index")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    let show_bar_mask = payload
        .get("show_bar_mask")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let metadata = ctx.preview.render(direction, frame_index, show_bar_mask)?;
    Ok(serde_json::to_value(metadata)?)
}

fn display_black_screen(ctx: &AppContext, _payload: &Value) -> AppResult<Value> {
    let metadata = ctx.preview.display_black()?;
    Ok(serde_json::to_value(metadata)?)
}

// =============================================================================
// Acquisition
// =============================================================================

fn set_acquisition_mode(ctx: &AppContext, payload: &Value) -> AppResult<Value> {
    let mode = str_field(payload, "mode")?;
    match mode {
        "idle" => match ctx.state.mode() {
            AcquisitionMode::Playback => ctx.playback.deactivate()?,
            AcquisitionMode::Preview => ctx.preview.deactivate()?,
            AcquisitionMode::Recording => ctx.record.deactivate(),
            AcquisitionMode::Idle => {}
        },
        "preview" => {
            let direction = direction_field(payload)?;
            let frame_index = payload
                .get("frame_index")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32;
            let show_bar_mask = payload
                .get("show_bar_mask")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            ctx.preview.activate(direction, frame_index, show_bar_mask)?;
        }
        "recording" => {
            let name = session_name_or_default(payload);
            ctx.record.activate(&name)?;
        }
        "playback" => {
            let path = str_field(payload, "session_path")?;
            ctx.playback.activate(std::path::Path::new(path))?;
        }
        other => {
            return Err(IsiError::validation(format!(
                "unknown acquisition mode: {other}"
            )));
        }
    }
    Ok(json!({ "mode": ctx.state.mode().as_str() }))
}

fn session_name_or_default(payload: &Value) -> String {
    payload
        .get("session_name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| {
            format!("session_{}", chrono::Utc::now().format("%Y%m%d_%H%M%S"))
        })
}

fn start_acquisition(ctx: &AppContext, payload: &Value) -> AppResult<Value> {
    let name = session_name_or_default(payload);
    let session_dir = ctx.record.activate(&name)?;
    Ok(json!({
        "session_name": name,
        "session_path": session_dir.display().to_string(),
    }))
}

fn stop_acquisition(ctx: &AppContext, _payload: &Value) -> AppResult<Value> {
    ctx.record.deactivate();
    Ok(json!({}))
}

fn get_acquisition_status(ctx: &AppContext, _payload: &Value) -> AppResult<Value> {
    let snapshot = ctx.state.snapshot();
    let (fraction, stage) = ctx.acquisition.progress();
    let mut status = serde_json::to_value(snapshot)?;
    if let Some(obj) = status.as_object_mut() {
        obj.insert("progress".into(), json!({ "fraction": fraction, "stage": stage }));
    }
    Ok(status)
}

// =============================================================================
// Playback
// =============================================================================

fn list_sessions(ctx: &AppContext, _payload: &Value) -> AppResult<Value> {
    let sessions = session::list_sessions(&ctx.config.session_root)?;
    Ok(json!({ "sessions": sessions }))
}

fn load_session(ctx: &AppContext, payload: &Value) -> AppResult<Value> {
    let path = str_field(payload, "session_path")?;
    let metadata = ctx.playback.activate(std::path::Path::new(path))?;
    Ok(json!({
        "session_name": metadata.session_name,
        "directions": metadata.directions,
        "timestamp": metadata.timestamp,
        "timestamp_info": serde_json::to_value(&metadata.timestamp_info)?,
    }))
}

fn get_session_data(ctx: &AppContext, payload: &Value) -> AppResult<Value> {
    let direction = direction_field(payload)?;
    let (frame_count, frame_shape) = ctx.playback.get_session_data(direction)?;
    Ok(json!({
        "direction": direction,
        "frame_count": frame_count,
        "frame_shape": frame_shape,
    }))
}

fn get_playback_frame(ctx: &AppContext, payload: &Value) -> AppResult<Value> {
    let direction = direction_field(payload)?;
    let frame_index = u64_field(payload, "frame_index")? as usize;
    let frame = ctx.playback.get_playback_frame(direction, frame_index)?;
    let (height, width) = frame.dim();

    // The UI viewport reads the pixels from the camera plane; the response
    // carries a PNG for direct display.
    let pixels: Vec<u8> = frame.iter().copied().collect();
    let metadata = ctx.planes.camera.write_frame(
        &pixels,
        &crate::core::FrameDescriptor {
            timestamp_us: monotonic_now_us(),
            width_px: width as u32,
            height_px: height as u32,
            frame_index: Some(frame_index as u32),
            direction: Some(direction),
            ..Default::default()
        },
    )?;
    ctx.bus
        .publish(&crate::ipc::SyncEvent::CameraFrame { metadata });

    let image = image::GrayImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| IsiError::Storage("frame buffer size mismatch".into()))?;
    let mut png = Vec::new();
    image::ImageEncoder::write_image(
        image::codecs::png::PngEncoder::new(&mut png),
        image.as_raw(),
        width as u32,
        height as u32,
        image::ExtendedColorType::L8,
    )
    .map_err(|e| IsiError::Storage(format!("PNG encode failed: {e}")))?;

    Ok(json!({
        "direction": direction,
        "frame_index": frame_index,
        "width_px": width,
        "height_px": height,
        "image_base64": BASE64.encode(&png),
    }))
}

fn unload_session(ctx: &AppContext, _payload: &Value) -> AppResult<Value> {
    ctx.playback.deactivate()?;
    Ok(json!({}))
}

// =============================================================================
// Analysis
// =============================================================================

fn start_analysis(ctx: &AppContext, payload: &Value) -> AppResult<Value> {
    let path = match payload.get("session_path").and_then(Value::as_str) {
        Some(path) => std::path::PathBuf::from(path),
        None => ctx
            .playback
            .current_session()
            .ok_or_else(|| IsiError::validation("missing field: session_path"))?,
    };
    ctx.analysis.start(&path)?;
    Ok(json!({ "session_path": path.display().to_string() }))
}

fn stop_analysis(ctx: &AppContext, _payload: &Value) -> AppResult<Value> {
    ctx.analysis.request_stop();
    Ok(json!({}))
}

fn get_analysis_status(ctx: &AppContext, _payload: &Value) -> AppResult<Value> {
    Ok(json!({
        "running": ctx.analysis.is_running(),
        "session_path": ctx.analysis.current_session().map(|p| p.display().to_string()),
    }))
}

fn get_analysis_results(ctx: &AppContext, _payload: &Value) -> AppResult<Value> {
    ctx.analysis.results_summary()
}

fn get_analysis_layer(ctx: &AppContext, payload: &Value) -> AppResult<Value> {
    let layer_name = str_field(payload, "layer_name")?;
    ctx.analysis.publish_layer(layer_name)
}
