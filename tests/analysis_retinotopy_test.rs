//! Synthetic retinotopic recovery through the full analysis stack:
//! fabricated session on disk -> worker -> persisted maps.

use std::f64::consts::PI;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use isi_macroscope::analysis::AnalysisOrchestrator;
use isi_macroscope::config::{ParameterBundle, ParameterGroupId, ParameterStore};
use isi_macroscope::core::{CapturedFrame, Direction};
use isi_macroscope::acquisition::SessionRecorder;
use isi_macroscope::ipc::{EventBus, FramePlanes};
use isi_macroscope::session::{SessionMetadata, StimulusEvent, TimestampInfo};

const WIDTH: usize = 24;
const HEIGHT: usize = 20;
const FRAMES: usize = 40;

/// Per-pixel phase offsets that stay clear of the wrap point.
fn phi_x(x: usize) -> f64 {
    (x as f64 / WIDTH as f64 - 0.5) * 1.6 * PI
}

fn phi_y(y: usize) -> f64 {
    (y as f64 / HEIGHT as f64 - 0.5) * 1.6 * PI
}

/// Fabricate one direction: pixel (y, x) follows
/// `cos(2 pi t / N + s * phi)` where `s` mirrors for the reverse direction.
fn synth_direction(recorder: &SessionRecorder, direction: Direction) {
    let mirror = match direction {
        Direction::LR | Direction::TB => 1.0,
        Direction::RL | Direction::BT => -1.0,
    };
    recorder.start(direction).unwrap();
    for t in 0..FRAMES {
        let ts = (t as u64 + 1) * 20_000;
        let mut pixels = Vec::with_capacity(WIDTH * HEIGHT);
        for y in 0..HEIGHT {
            for x in 0..WIDTH {
                let phi = if direction.is_horizontal() {
                    phi_x(x)
                } else {
                    phi_y(y)
                };
                let value = 127.5
                    + 100.0 * (2.0 * PI * t as f64 / FRAMES as f64 + mirror * phi).cos();
                pixels.push(value.round().clamp(0.0, 255.0) as u8);
            }
        }
        recorder
            .record_camera_frame(
                ts,
                &CapturedFrame {
                    pixels,
                    width: WIDTH as u32,
                    height: HEIGHT as u32,
                    channels: 1,
                    device_timestamp_us: Some(ts),
                },
            )
            .unwrap();
        recorder
            .record_stimulus_event(StimulusEvent {
                timestamp_us: ts,
                frame_id: t as u64,
                frame_index: t as u32,
                direction,
                angle_degrees: t as f64,
            })
            .unwrap();
    }
    recorder.stop();
}

fn fabricate_session(dir: &Path) {
    let mut bundle = ParameterBundle::default();
    bundle.stimulus.num_cycles = 1;
    let metadata = SessionMetadata::new(
        "synthetic",
        bundle.stimulus,
        bundle.monitor,
        bundle.camera,
        bundle.acquisition,
        TimestampInfo::camera_triggered("hardware"),
    );
    let recorder = SessionRecorder::new(dir, metadata).unwrap();
    for direction in Direction::ALL {
        synth_direction(&recorder, direction);
    }
    recorder.save().unwrap();
}

fn read_map(file: &hdf5::File, name: &str) -> (Vec<f32>, Vec<usize>) {
    let ds = file.dataset(name).unwrap();
    (ds.read_raw().unwrap(), ds.shape())
}

fn at(map: &[f32], shape: &[usize], r: usize, c: usize) -> f32 {
    map[r * shape[1] + c]
}

#[test]
fn test_synthetic_retinotopy_recovery() {
    let tmp = tempfile::tempdir().unwrap();
    let session_dir = tmp.path().join("synthetic");
    fabricate_session(&session_dir);

    let store = Arc::new(ParameterStore::default());
    store
        .update_group(
            ParameterGroupId::Analysis,
            &serde_json::json!({
                "smoothing_sigma": 0.0,
                "phase_filter_sigma": 0.0,
                "hemodynamic_delay_sec": 0.0,
                "area_min_size": 10,
            }),
        )
        .unwrap();
    let bus = Arc::new(EventBus::bind(0).unwrap());
    let planes = Arc::new(FramePlanes::create(&tmp.path().join("shm")).unwrap());
    let tap = bus.tap();

    let analysis = AnalysisOrchestrator::new(store, Arc::clone(&bus), Arc::clone(&planes));
    analysis.start(&session_dir).unwrap();
    assert!(analysis.start(&session_dir).is_err(), "second start must be rejected");
    analysis.join();

    // Event sequence: started, progress, layer_ready per primary layer,
    // complete exactly once, no errors.
    let mut events = Vec::new();
    while let Ok(event) = tap.recv_timeout(Duration::from_millis(100)) {
        events.push(event);
    }
    let count = |kind: &str| events.iter().filter(|e| e["type"] == kind).count();
    assert_eq!(count("analysis_started"), 1);
    assert_eq!(count("analysis_complete"), 1);
    assert_eq!(count("analysis_error"), 0);
    assert!(count("analysis_progress") >= 3);
    assert!(count("analysis_layer_ready") >= 5);
    let layer_event = events
        .iter()
        .find(|e| e["type"] == "analysis_layer_ready")
        .unwrap();
    assert!(layer_event["image_base64"].as_str().unwrap().len() > 100);

    // Results summary carries names and counts only, never the maps.
    let summary = analysis.results_summary().unwrap();
    assert_eq!(summary["shape"], serde_json::json!([HEIGHT, WIDTH]));
    assert_eq!(summary["num_areas"], 1);
    assert_eq!(summary["has_anatomical"], false);
    let keys: Vec<&String> = summary.as_object().unwrap().keys().collect();
    assert_eq!(keys.len(), 6);
    assert!(summary["primary_layers"]
        .as_array()
        .unwrap()
        .iter()
        .any(|l| l == "sign_map"));

    // Persisted maps: azimuth monotonic along columns, elevation along
    // rows, sign uniformly +1, one segmented area.
    let file = hdf5::File::open(
        session_dir.join("analysis_results/analysis_results.h5"),
    )
    .unwrap();
    let (azimuth, shape) = read_map(&file, "azimuth_map");
    let (elevation, _) = read_map(&file, "elevation_map");
    let (sign, _) = read_map(&file, "sign_map");
    let (area, _) = read_map(&file, "area_map");
    assert_eq!(shape, vec![HEIGHT, WIDTH]);

    let mid_row = HEIGHT / 2;
    for c in 1..WIDTH {
        let prev = at(&azimuth, &shape, mid_row, c - 1);
        let here = at(&azimuth, &shape, mid_row, c);
        assert!(here < prev, "azimuth not monotonic at column {c}: {prev} -> {here}");
    }
    let mid_col = WIDTH / 2;
    for r in 1..HEIGHT {
        let prev = at(&elevation, &shape, r - 1, mid_col);
        let here = at(&elevation, &shape, r, mid_col);
        assert!(here < prev, "elevation not monotonic at row {r}: {prev} -> {here}");
    }
    assert!(sign.iter().all(|&v| v == 1.0), "sign map must be uniform");
    assert!(area.iter().all(|&v| v == 1.0), "one area covering the map");

    // Phase and magnitude groups exist for every direction.
    for direction in Direction::ALL {
        assert!(file
            .dataset(&format!("phase_maps/{direction}"))
            .is_ok());
        assert!(file
            .dataset(&format!("magnitude_maps/{direction}"))
            .is_ok());
    }

    // Per-layer PNGs sit next to the HDF5.
    assert!(session_dir.join("analysis_results/azimuth_map.png").exists());
    assert!(session_dir.join("analysis_results/sign_map.png").exists());

    // Raw float32 layers travel through the analysis plane only.
    let record = analysis.publish_layer("azimuth_map").unwrap();
    assert_eq!(record["dtype"], "float32");
    assert_eq!(record["offset_bytes"], 0);
    let size = record["data_size_bytes"].as_u64().unwrap() as usize;
    assert_eq!(size, HEIGHT * WIDTH * 4);
    let bytes = planes.analysis.read_at(0, size).unwrap();
    let first = f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    assert_eq!(first, azimuth[0]);
}
