//! End-to-end sweep protocol tests against the full container, driven by
//! the synthetic camera.

use crossbeam::channel::Receiver;
use serial_test::serial;
use std::time::{Duration, Instant};

use isi_macroscope::app::{AppConfig, AppContext};
use isi_macroscope::config::ParameterGroupId;
use isi_macroscope::core::Direction;
use isi_macroscope::session::{self, SessionMetadata};

/// Container tuned for fast protocol runs: tiny monitor, high camera FPS,
/// fast sweeps.
fn fast_context(
    tmp: &std::path::Path,
    directions: &[&str],
    drift_speed: f64,
) -> std::sync::Arc<AppContext> {
    let ctx = AppContext::build(AppConfig::for_tests(tmp)).unwrap();
    ctx.params
        .update_group(
            ParameterGroupId::Monitor,
            &serde_json::json!({"monitor_width_px": 32, "monitor_height_px": 16}),
        )
        .unwrap();
    ctx.params
        .update_group(
            ParameterGroupId::Camera,
            &serde_json::json!({"camera_width_px": 16, "camera_height_px": 12, "camera_fps": 250.0}),
        )
        .unwrap();
    ctx.params
        .update_group(
            ParameterGroupId::Stimulus,
            &serde_json::json!({
                "directions": directions,
                "num_cycles": 1,
                "drift_speed_deg_s": drift_speed,
            }),
        )
        .unwrap();
    ctx.params
        .update_group(
            ParameterGroupId::Acquisition,
            &serde_json::json!({"baseline_sec": 0.05, "between_trials_sec": 0.0, "repeats": 1}),
        )
        .unwrap();
    ctx
}

/// Drain the event tap continuously (its channel is bounded) until the
/// orchestrator finishes or the timeout passes; returns everything seen.
fn drain_until_finished(
    ctx: &AppContext,
    tap: &Receiver<serde_json::Value>,
    timeout: Duration,
) -> Vec<serde_json::Value> {
    let mut events = Vec::new();
    let end = Instant::now() + timeout;
    loop {
        while let Ok(event) = tap.try_recv() {
            events.push(event);
        }
        if !ctx.acquisition.is_running() || Instant::now() > end {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    ctx.acquisition.join();
    while let Ok(event) = tap.try_recv() {
        events.push(event);
    }
    events
}

fn count_type(events: &[serde_json::Value], kind: &str) -> usize {
    events.iter().filter(|e| e["type"] == kind).count()
}

#[test]
#[serial]
fn test_acquisition_rejected_without_camera_fps() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = fast_context(tmp.path(), &["LR"], 1000.0);
    ctx.params
        .update_group(ParameterGroupId::Camera, &serde_json::json!({"camera_fps": 0.0}))
        .unwrap();

    let err = ctx.record.activate("no_fps").unwrap_err();
    assert!(err.to_string().contains("camera_fps is required"));
    assert!(ctx.state.is_idle());
    assert!(!ctx.acquisition.is_running());
    assert!(!tmp.path().join("sessions/no_fps").exists());
    ctx.shutdown();
}

#[test]
#[serial]
fn test_minimal_successful_acquisition() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = fast_context(tmp.path(), &["LR"], 1000.0);
    let tap = ctx.bus.tap();

    let session_dir = ctx.record.activate("minimal").unwrap();
    assert!(ctx.state.is_recording());
    let events_seen = drain_until_finished(&ctx, &tap, Duration::from_secs(30));
    assert!(!ctx.acquisition.is_running(), "protocol did not finish in time");

    // metadata lists exactly the recorded direction.
    let metadata = SessionMetadata::load(&session_dir).unwrap();
    assert_eq!(metadata.directions, vec![Direction::LR]);
    assert_eq!(metadata.timestamp_info.synchronization_method, "camera_triggered");

    // Shape invariant: frames == timestamps == events == angles.
    let camera = hdf5::File::open(session_dir.join("LR_camera.h5")).unwrap();
    let frames_shape = camera.dataset("frames").unwrap().shape();
    let timestamps: Vec<u64> = camera.dataset("timestamps").unwrap().read_raw().unwrap();
    let events = session::load_events(&session_dir, Direction::LR).unwrap();
    let stimulus = hdf5::File::open(session_dir.join("LR_stimulus.h5")).unwrap();
    let angles: Vec<f64> = stimulus.dataset("angles").unwrap().read_raw().unwrap();

    assert!(frames_shape[0] > 0);
    assert_eq!(frames_shape[0], timestamps.len());
    assert_eq!(timestamps.len(), events.len());
    assert_eq!(events.len(), angles.len());

    // Pairing invariant: one event per frame, identical timestamps, and
    // stimulus frame indices are consecutive from zero.
    for (i, (event, ts)) in events.iter().zip(&timestamps).enumerate() {
        assert_eq!(event.timestamp_us, *ts);
        assert_eq!(event.frame_index, i as u32);
        assert_eq!(event.direction, Direction::LR);
    }

    // acquisition_complete published exactly once, preceded by started.
    assert_eq!(count_type(&events_seen, "acquisition_started"), 1);
    assert_eq!(count_type(&events_seen, "acquisition_complete"), 1);
    assert_eq!(count_type(&events_seen, "acquisition_error"), 0);
    let complete = events_seen
        .iter()
        .find(|e| e["type"] == "acquisition_complete")
        .unwrap();
    assert_eq!(complete["stopped_early"], false);
    let started_at = events_seen
        .iter()
        .position(|e| e["type"] == "acquisition_started")
        .unwrap();
    let progress_at = events_seen
        .iter()
        .position(|e| e["type"] == "acquisition_progress")
        .unwrap();
    assert!(started_at < progress_at);

    assert!(ctx.state.is_idle());
    ctx.shutdown();
}

#[test]
#[serial]
fn test_stop_mid_direction_saves_partial_session() {
    let tmp = tempfile::tempdir().unwrap();
    // Slow sweep so the stop lands inside the LR direction.
    let ctx = fast_context(tmp.path(), &["LR", "RL"], 150.0);
    let tap = ctx.bus.tap();

    let session_dir = ctx.record.activate("stopped").unwrap();

    // Wait until LR is actually producing frames, then stop. The tap is
    // drained while polling so the bounded channel never clogs.
    let mut early_events = Vec::new();
    let end = Instant::now() + Duration::from_secs(10);
    loop {
        while let Ok(event) = tap.try_recv() {
            early_events.push(event);
        }
        let producing = ctx.ctstim.progress().map(|(i, _)| i > 5).unwrap_or(false);
        if producing || Instant::now() > end {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    ctx.record.deactivate();

    let mut events_seen = drain_until_finished(&ctx, &tap, Duration::from_secs(30));
    assert!(!ctx.acquisition.is_running(), "protocol did not stop in time");
    early_events.append(&mut events_seen);

    // LR saved as a partial direction; RL skipped entirely.
    let metadata = SessionMetadata::load(&session_dir).unwrap();
    assert_eq!(metadata.directions, vec![Direction::LR]);
    assert!(!session_dir.join("RL_camera.h5").exists());

    let camera = hdf5::File::open(session_dir.join("LR_camera.h5")).unwrap();
    let n = camera.dataset("frames").unwrap().shape()[0];
    let events = session::load_events(&session_dir, Direction::LR).unwrap();
    assert!(n > 0);
    assert_eq!(n, events.len());

    assert_eq!(count_type(&early_events, "acquisition_complete"), 1);
    let complete = early_events
        .iter()
        .find(|e| e["type"] == "acquisition_complete")
        .unwrap();
    assert_eq!(complete["stopped_early"], true);
    assert!(ctx.state.is_idle());
    ctx.shutdown();
}
