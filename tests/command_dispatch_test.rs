//! Control-surface tests: the uniform response envelope over the full
//! container and registry.

use serial_test::serial;
use std::sync::Arc;

use isi_macroscope::app::{AppConfig, AppContext};
use isi_macroscope::handlers;
use isi_macroscope::ipc::CommandRegistry;

fn test_stack(tmp: &std::path::Path) -> (Arc<AppContext>, CommandRegistry) {
    let ctx = AppContext::build(AppConfig::for_tests(tmp)).unwrap();
    // Small monitor keeps on-demand renders cheap.
    ctx.params
        .update_group(
            isi_macroscope::config::ParameterGroupId::Monitor,
            &serde_json::json!({"monitor_width_px": 64, "monitor_height_px": 48}),
        )
        .unwrap();
    let registry = handlers::build_registry().unwrap();
    (ctx, registry)
}

#[test]
#[serial]
fn test_ping_and_envelope() {
    let tmp = tempfile::tempdir().unwrap();
    let (ctx, registry) = test_stack(tmp.path());

    let resp = registry.dispatch_line(&ctx, r#"{"type":"ping"}"#);
    assert_eq!(resp["success"], true);
    assert_eq!(resp["type"], "ping");
    assert_eq!(resp["pong"], true);
    ctx.shutdown();
}

#[test]
#[serial]
fn test_unknown_command_and_malformed_line() {
    let tmp = tempfile::tempdir().unwrap();
    let (ctx, registry) = test_stack(tmp.path());

    let resp = registry.dispatch_line(&ctx, r#"{"type":"warp_drive"}"#);
    assert_eq!(resp["success"], false);
    assert_eq!(resp["error"], "Unknown command: warp_drive");

    let resp = registry.dispatch_line(&ctx, "not json at all");
    assert_eq!(resp["success"], false);
    assert!(resp["error"].as_str().unwrap().contains("Malformed request"));
    ctx.shutdown();
}

#[test]
#[serial]
fn test_start_acquisition_without_fps_is_clean_rejection() {
    let tmp = tempfile::tempdir().unwrap();
    let (ctx, registry) = test_stack(tmp.path());
    let resp = registry.dispatch_line(
        &ctx,
        r#"{"type":"update_parameters","group":"camera","parameters":{"camera_fps":0.0}}"#,
    );
    assert_eq!(resp["success"], true);

    let resp = registry.dispatch_line(
        &ctx,
        r#"{"type":"start_acquisition","session_name":"blocked"}"#,
    );
    assert_eq!(resp["success"], false);
    assert_eq!(resp["type"], "start_acquisition");
    assert!(resp["error"].as_str().unwrap().contains("camera_fps is required"));

    // No worker started, state untouched, nothing on disk.
    assert!(!ctx.acquisition.is_running());
    assert!(ctx.state.is_idle());
    assert!(!tmp.path().join("sessions/blocked").exists());
    ctx.shutdown();
}

#[test]
#[serial]
fn test_parameter_updates_validate_and_report() {
    let tmp = tempfile::tempdir().unwrap();
    let (ctx, registry) = test_stack(tmp.path());

    let resp = registry.dispatch_line(
        &ctx,
        r#"{"type":"update_stimulus_parameters","parameters":{"bar_width_deg": 14.0}}"#,
    );
    assert_eq!(resp["success"], true);
    assert_eq!(resp["parameters"]["bar_width_deg"], 14.0);

    let resp = registry.dispatch_line(
        &ctx,
        r#"{"type":"update_parameters","group":"nonsense","parameters":{}}"#,
    );
    assert_eq!(resp["success"], false);
    assert!(resp["error"].as_str().unwrap().contains("nonsense"));

    let resp = registry.dispatch_line(
        &ctx,
        r#"{"type":"update_parameters","group":"stimulus","parameters":{"contrast": 7.0}}"#,
    );
    assert_eq!(resp["success"], false);
    // The failed patch left the earlier value in place.
    assert_eq!(ctx.params.stimulus().bar_width_deg, 14.0);
    assert_eq!(ctx.params.stimulus().contrast, 1.0);
    ctx.shutdown();
}

#[test]
#[serial]
fn test_stimulus_commands_publish_frames() {
    let tmp = tempfile::tempdir().unwrap();
    let (ctx, registry) = test_stack(tmp.path());
    let tap = ctx.bus.tap();

    let resp = registry.dispatch_line(
        &ctx,
        r#"{"type":"get_stimulus_frame","direction":"LR","frame_index":5}"#,
    );
    assert_eq!(resp["success"], true);
    assert_eq!(resp["frame_index"], 5);
    assert_eq!(resp["width_px"], 64);
    assert!(resp["total_frames"].as_u64().unwrap() > 0);

    let resp = registry.dispatch_line(&ctx, r#"{"type":"display_black_screen"}"#);
    assert_eq!(resp["success"], true);

    let first = tap.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
    assert_eq!(first["type"], "stimulus_frame");
    ctx.shutdown();
}

#[test]
#[serial]
fn test_detect_cameras_and_capabilities() {
    let tmp = tempfile::tempdir().unwrap();
    let (ctx, registry) = test_stack(tmp.path());

    let resp = registry.dispatch_line(&ctx, r#"{"type":"detect_cameras"}"#);
    assert_eq!(resp["success"], true);
    assert_eq!(resp["cameras"][0]["name"], "synthetic");

    let resp = registry.dispatch_line(&ctx, r#"{"type":"get_camera_capabilities"}"#);
    assert_eq!(resp["success"], true);
    assert_eq!(resp["provides_hardware_timestamps"], true);
    ctx.shutdown();
}

#[test]
#[serial]
fn test_analysis_surface_without_results() {
    let tmp = tempfile::tempdir().unwrap();
    let (ctx, registry) = test_stack(tmp.path());

    let resp = registry.dispatch_line(&ctx, r#"{"type":"get_analysis_results"}"#);
    assert_eq!(resp["success"], false);
    assert!(resp["error"].as_str().unwrap().contains("no analysis results"));

    let resp = registry.dispatch_line(&ctx, r#"{"type":"get_analysis_status"}"#);
    assert_eq!(resp["success"], true);
    assert_eq!(resp["running"], false);

    let resp = registry.dispatch_line(
        &ctx,
        r#"{"type":"start_analysis","session_path":"/nonexistent/session"}"#,
    );
    assert_eq!(resp["success"], false);
    ctx.shutdown();
}

#[test]
#[serial]
fn test_mode_transition_guard_over_ipc() {
    let tmp = tempfile::tempdir().unwrap();
    let (ctx, registry) = test_stack(tmp.path());

    let resp = registry.dispatch_line(
        &ctx,
        r#"{"type":"set_acquisition_mode","mode":"preview","direction":"TB"}"#,
    );
    assert_eq!(resp["success"], true);
    assert_eq!(resp["mode"], "preview");
    assert!(ctx.state.is_preview());

    let resp = registry.dispatch_line(&ctx, r#"{"type":"set_acquisition_mode","mode":"idle"}"#);
    assert_eq!(resp["success"], true);
    assert!(ctx.state.is_idle());

    let resp = registry.dispatch_line(
        &ctx,
        r#"{"type":"set_acquisition_mode","mode":"sideways"}"#,
    );
    assert_eq!(resp["success"], false);
    ctx.shutdown();
}

#[test]
#[serial]
fn test_list_sessions_empty_root() {
    let tmp = tempfile::tempdir().unwrap();
    let (ctx, registry) = test_stack(tmp.path());
    let resp = registry.dispatch_line(&ctx, r#"{"type":"list_sessions"}"#);
    assert_eq!(resp["success"], true);
    assert_eq!(resp["sessions"].as_array().unwrap().len(), 0);
    ctx.shutdown();
}
