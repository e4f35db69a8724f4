//! Playback controller behavior against a recorded RGB session:
//! metadata-only session data, single-frame reads, grayscale conversion.

use std::sync::Arc;

use isi_macroscope::acquisition::{PlaybackController, SessionRecorder, StateCoordinator};
use isi_macroscope::config::ParameterBundle;
use isi_macroscope::core::{CapturedFrame, Direction};
use isi_macroscope::ipc::EventBus;
use isi_macroscope::session::{SessionMetadata, StimulusEvent, TimestampInfo};

const WIDTH: u32 = 8;
const HEIGHT: u32 = 6;

/// Record six RGB frames; frame `t` is solid red with green ramping by
/// frame so individual frames are distinguishable.
fn record_rgb_session(dir: &std::path::Path) {
    let bundle = ParameterBundle::default();
    let metadata = SessionMetadata::new(
        "rgb_session",
        bundle.stimulus,
        bundle.monitor,
        bundle.camera,
        bundle.acquisition,
        TimestampInfo::camera_triggered("software"),
    );
    let recorder = SessionRecorder::new(dir, metadata).unwrap();
    recorder.start(Direction::LR).unwrap();
    for t in 0..6u32 {
        let mut pixels = Vec::with_capacity((WIDTH * HEIGHT * 3) as usize);
        for _ in 0..(WIDTH * HEIGHT) {
            pixels.extend_from_slice(&[255, (t * 10) as u8, 0]);
        }
        let ts = (t as u64 + 1) * 1000;
        recorder
            .record_camera_frame(
                ts,
                &CapturedFrame {
                    pixels,
                    width: WIDTH,
                    height: HEIGHT,
                    channels: 3,
                    device_timestamp_us: None,
                },
            )
            .unwrap();
        recorder
            .record_stimulus_event(StimulusEvent {
                timestamp_us: ts,
                frame_id: t as u64,
                frame_index: t,
                direction: Direction::LR,
                angle_degrees: t as f64,
            })
            .unwrap();
    }
    recorder.save().unwrap();
}

fn playback() -> PlaybackController {
    PlaybackController::new(
        Arc::new(StateCoordinator::new()),
        Arc::new(EventBus::bind(0).unwrap()),
    )
}

#[test]
fn test_session_data_then_single_frame() {
    let tmp = tempfile::tempdir().unwrap();
    let session = tmp.path().join("rgb_session");
    record_rgb_session(&session);

    let controller = playback();
    let metadata = controller.activate(&session).unwrap();
    assert_eq!(metadata.directions, vec![Direction::LR]);

    // Metadata-only: count and shape, no frame bytes read.
    let (frame_count, frame_shape) = controller.get_session_data(Direction::LR).unwrap();
    assert_eq!(frame_count, 6);
    assert_eq!(frame_shape, vec![HEIGHT as usize, WIDTH as usize, 3]);

    // One frame, grayscale u8. Frame 3 is [255, 30, 0]:
    // 0.299*255 + 0.587*30 = 93.86 -> 94.
    let frame = controller.get_playback_frame(Direction::LR, 3).unwrap();
    assert_eq!(frame.dim(), (HEIGHT as usize, WIDTH as usize));
    assert!(frame.iter().all(|&v| v == 94));

    // Re-requesting the same direction reuses the open handle and still
    // serves frames.
    let (count_again, _) = controller.get_session_data(Direction::LR).unwrap();
    assert_eq!(count_again, 6);
    let frame0 = controller.get_playback_frame(Direction::LR, 0).unwrap();
    // Frame 0 is pure red: 0.299*255 = 76.245 -> 76.
    assert!(frame0.iter().all(|&v| v == 76));

    controller.deactivate().unwrap();
}

#[test]
fn test_out_of_range_and_unrecorded_direction() {
    let tmp = tempfile::tempdir().unwrap();
    let session = tmp.path().join("rgb_session");
    record_rgb_session(&session);

    let controller = playback();
    controller.activate(&session).unwrap();

    assert!(controller.get_playback_frame(Direction::LR, 6).is_err());
    let err = controller.get_session_data(Direction::TB).unwrap_err();
    assert!(err.to_string().contains("TB"));

    controller.deactivate().unwrap();
}

#[test]
fn test_frames_require_loaded_session() {
    let controller = playback();
    assert!(controller.get_session_data(Direction::LR).is_err());
    assert!(controller.get_playback_frame(Direction::LR, 0).is_err());
}
