//! The camera acquisition loop and its owning manager.
//!
//! The loop runs on a dedicated worker thread and is the heart of the
//! camera-triggered model. Per iteration, in fixed order: capture a frame
//! (blocking), stamp it, trigger the next stimulus frame in the same
//! thread, record both with the same timestamp, publish both to their
//! shared-memory planes, and feed the sync tracker. A camera frame and its
//! companion stimulus event share a timestamp by construction.
//!
//! Failure policy: an error while a recording is active is fatal. The
//! loop publishes `acquisition_error`, asks the recorder for a best-effort
//! flush, and terminates (scientific-validity gate). Outside recording,
//! errors are logged and the loop continues.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{error, info, warn};

use crate::acquisition::recorder::SessionRecorder;
use crate::acquisition::state::StateCoordinator;
use crate::camera::CaptureDevice;
use crate::config::CameraParams;
use crate::core::{monotonic_now_us, CapturedFrame, FrameDescriptor, TimestampSource};
use crate::error::{AppResult, IsiError};
use crate::ipc::message::SyncEvent;
use crate::ipc::{EventBus, FramePlanes};
use crate::stimulus::CameraTriggeredStimulus;
use crate::sync_tracker::SyncTracker;

/// Lock-guarded handle to the active session recorder.
///
/// The orchestrator swaps the recorder in and out; the camera loop takes
/// one snapshot per iteration and never holds the lock across I/O.
#[derive(Default)]
pub struct RecorderSlot {
    slot: Mutex<Option<Arc<SessionRecorder>>>,
}

impl RecorderSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, recorder: Option<Arc<SessionRecorder>>) {
        *self.slot.lock().expect("recorder slot lock poisoned") = recorder;
    }

    pub fn get(&self) -> Option<Arc<SessionRecorder>> {
        self.slot.lock().expect("recorder slot lock poisoned").clone()
    }
}

/// Everything the acquisition loop touches besides the device.
#[derive(Clone)]
pub struct AcquisitionDeps {
    pub ctstim: Arc<CameraTriggeredStimulus>,
    pub recorder: Arc<RecorderSlot>,
    pub planes: Arc<FramePlanes>,
    pub bus: Arc<EventBus>,
    pub sync: Arc<SyncTracker>,
    pub state: Arc<StateCoordinator>,
    /// Raised by the loop on a fatal recording error; observed by the
    /// acquisition orchestrator.
    pub fatal: Arc<AtomicBool>,
}

/// Owns the capture worker thread for one camera session.
pub struct CameraManager {
    deps: AcquisitionDeps,
    handle: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
    timestamp_source: Mutex<Option<TimestampSource>>,
    /// f64 bits of the measured frame rate.
    fps_bits: Arc<AtomicU64>,
    latest_frame: Arc<Mutex<Option<CapturedFrame>>>,
}

impl CameraManager {
    pub fn new(deps: AcquisitionDeps) -> Self {
        Self {
            deps,
            handle: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicBool::new(false)),
            timestamp_source: Mutex::new(None),
            fps_bits: Arc::new(AtomicU64::new(0)),
            latest_frame: Arc::new(Mutex::new(None)),
        }
    }

    /// Open the device and start the acquisition worker.
    pub fn start(&self, mut device: Box<dyn CaptureDevice>, params: &CameraParams) -> AppResult<()> {
        if self.active.load(Ordering::SeqCst) {
            return Err(IsiError::Camera("camera already running".into()));
        }
        device.open(
            params.camera_width_px,
            params.camera_height_px,
            params.camera_fps,
        )?;

        // Probe the first frame for a device clock; the chosen source holds
        // for every frame of the session.
        let first = device.capture()?;
        let source = if first.device_timestamp_us.is_some() {
            TimestampSource::Hardware
        } else {
            TimestampSource::Software
        };
        info!(source = source.as_str(), camera = device.name(), "timestamp source selected");
        *self.timestamp_source.lock().expect("timestamp lock poisoned") = Some(source);

        self.stop.store(false, Ordering::SeqCst);
        self.deps.fatal.store(false, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
        self.deps.state.set_camera_active(true);

        let deps = self.deps.clone();
        let stop = Arc::clone(&self.stop);
        let active = Arc::clone(&self.active);
        let fps_bits = Arc::clone(&self.fps_bits);
        let latest = Arc::clone(&self.latest_frame);
        let handle = std::thread::Builder::new()
            .name("acquisition".into())
            .spawn(move || {
                run_loop(device, source, first, deps.clone(), stop, fps_bits, latest);
                active.store(false, Ordering::SeqCst);
                deps.state.set_camera_active(false);
            })?;
        *self.handle.lock().expect("camera handle lock poisoned") = Some(handle);
        Ok(())
    }

    /// Signal the loop to stop and join the worker.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().expect("camera handle lock poisoned").take() {
            if handle.join().is_err() {
                error!("acquisition worker panicked");
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn timestamp_source(&self) -> Option<TimestampSource> {
        *self.timestamp_source.lock().expect("timestamp lock poisoned")
    }

    /// Measured frame rate of the running loop.
    pub fn fps_actual(&self) -> f64 {
        f64::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }

    /// Copy of the most recent captured frame (anatomical capture).
    pub fn latest_frame(&self) -> Option<CapturedFrame> {
        self.latest_frame
            .lock()
            .expect("latest frame lock poisoned")
            .clone()
    }
}

fn run_loop(
    mut device: Box<dyn CaptureDevice>,
    source: TimestampSource,
    first_frame: CapturedFrame,
    deps: AcquisitionDeps,
    stop: Arc<AtomicBool>,
    fps_bits: Arc<AtomicU64>,
    latest: Arc<Mutex<Option<CapturedFrame>>>,
) {
    let mut frame_id: u64 = 0;
    let mut pending = Some(first_frame);
    let mut last_ts_us: Option<u64> = None;
    let mut fps_ema = 0.0f64;

    info!("acquisition loop started");
    while !stop.load(Ordering::SeqCst) {
        let frame = match pending.take() {
            Some(frame) => frame,
            None => match device.capture() {
                Ok(frame) => frame,
                Err(e) => {
                    if handle_loop_error(&deps, &e.to_string()) {
                        break;
                    }
                    continue;
                }
            },
        };
        frame_id += 1;

        let ts = match source {
            TimestampSource::Hardware => frame
                .device_timestamp_us
                .unwrap_or_else(monotonic_now_us),
            TimestampSource::Software => monotonic_now_us(),
        };

        if let Some(prev) = last_ts_us {
            let dt_us = ts.saturating_sub(prev);
            if dt_us > 0 {
                let instant_fps = 1e6 / dt_us as f64;
                fps_ema = if fps_ema == 0.0 {
                    instant_fps
                } else {
                    0.9 * fps_ema + 0.1 * instant_fps
                };
                fps_bits.store(fps_ema.to_bits(), Ordering::Relaxed);
            }
        }
        last_ts_us = Some(ts);

        if let Err(e) = process_frame(&deps, frame_id, ts, &frame, &latest) {
            if handle_loop_error(&deps, &e.to_string()) {
                break;
            }
        }
    }
    device.close();
    info!(frames = frame_id, "acquisition loop finished");
}

/// Fixed per-frame order: stimulus -> record(both) -> publish -> sync.
fn process_frame(
    deps: &AcquisitionDeps,
    frame_id: u64,
    ts: u64,
    frame: &CapturedFrame,
    latest: &Mutex<Option<CapturedFrame>>,
) -> AppResult<()> {
    let stimulus = deps.ctstim.generate_next_frame(ts, frame_id)?;

    // One recorder snapshot per iteration. A camera frame is recorded
    // exactly when its companion stimulus frame was generated in this
    // iteration, which keeps frames and events 1:1 with equal timestamps
    // even in the window between sweep exhaustion and direction close.
    let recorder = deps.recorder.get();
    if let Some(recorder) = recorder.as_ref() {
        if recorder.is_recording() {
            if let Some((_, event, _)) = stimulus.as_ref() {
                recorder.record_camera_frame(ts, frame)?;
                recorder.record_stimulus_event(*event)?;
            }
        }
    }

    let gray = frame.to_grayscale();
    let camera_meta = deps.planes.camera.write_frame(
        &gray,
        &FrameDescriptor {
            timestamp_us: ts,
            width_px: frame.width,
            height_px: frame.height,
            ..Default::default()
        },
    )?;
    deps.bus.publish(&SyncEvent::CameraFrame {
        metadata: camera_meta,
    });

    let mut stimulus_ts = ts;
    if let Some((image, event, info)) = stimulus {
        stimulus_ts = event.timestamp_us;
        let (height, width) = image.dim();
        let pixels: Vec<u8> = image.iter().copied().collect();
        let meta = deps.planes.stimulus.write_frame(
            &pixels,
            &FrameDescriptor {
                timestamp_us: event.timestamp_us,
                width_px: width as u32,
                height_px: height as u32,
                frame_index: Some(event.frame_index),
                total_frames: Some(info.total_frames),
                direction: Some(event.direction),
                angle_degrees: Some(event.angle_degrees),
                start_angle: Some(info.start_angle),
                end_angle: Some(info.end_angle),
            },
        )?;
        deps.bus.publish(&SyncEvent::StimulusFrame { metadata: meta });
    }

    deps.sync.add(ts, stimulus_ts);

    *latest.lock().expect("latest frame lock poisoned") = Some(frame.clone());
    Ok(())
}

/// Apply the failure policy. Returns true when the loop must terminate.
fn handle_loop_error(deps: &AcquisitionDeps, message: &str) -> bool {
    let recorder = deps.recorder.get();
    let recording = recorder.as_ref().is_some_and(|r| r.is_recording());
    if recording {
        error!(error = message, "fatal error during recording; terminating acquisition");
        deps.fatal.store(true, Ordering::SeqCst);
        deps.bus.publish(&SyncEvent::AcquisitionError {
            error: message.to_string(),
        });
        if let Some(recorder) = recorder {
            recorder.abort_flush();
        }
        true
    } else {
        warn!(error = message, "acquisition loop error outside recording; continuing");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SyntheticCamera;
    use crate::config::{ParameterBundle, ParameterStore};
    use crate::stimulus::StimulusProvider;

    fn test_deps(dir: &std::path::Path) -> AcquisitionDeps {
        let mut bundle = ParameterBundle::default();
        bundle.monitor.monitor_width_px = 32;
        bundle.monitor.monitor_height_px = 16;
        bundle.camera.camera_fps = 500.0;
        let store = Arc::new(ParameterStore::new(bundle));
        let provider = Arc::new(StimulusProvider::new(store));
        AcquisitionDeps {
            ctstim: Arc::new(CameraTriggeredStimulus::new(provider)),
            recorder: Arc::new(RecorderSlot::new()),
            planes: Arc::new(FramePlanes::create(dir).unwrap()),
            bus: Arc::new(EventBus::bind(0).unwrap()),
            sync: Arc::new(SyncTracker::new()),
            state: Arc::new(StateCoordinator::new()),
            fatal: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn test_loop_publishes_camera_frames() {
        let tmp = tempfile::tempdir().unwrap();
        let deps = test_deps(tmp.path());
        let tap = deps.bus.tap();
        let manager = CameraManager::new(deps);
        let mut params = CameraParams::default();
        params.camera_width_px = 16;
        params.camera_height_px = 8;
        params.camera_fps = 500.0;

        manager
            .start(Box::new(SyntheticCamera::new()), &params)
            .unwrap();
        assert!(manager.is_active());
        assert_eq!(manager.timestamp_source(), Some(TimestampSource::Hardware));

        let event = tap
            .recv_timeout(std::time::Duration::from_secs(2))
            .unwrap();
        assert_eq!(event["type"], "camera_frame");
        assert_eq!(event["width_px"], 16);

        manager.stop();
        assert!(!manager.is_active());
        assert!(manager.latest_frame().is_some());
    }

    #[test]
    fn test_software_fallback_when_no_device_clock() {
        let tmp = tempfile::tempdir().unwrap();
        let deps = test_deps(tmp.path());
        let manager = CameraManager::new(deps);
        let params = CameraParams {
            camera_width_px: 8,
            camera_height_px: 8,
            camera_fps: 500.0,
            ..Default::default()
        };
        manager
            .start(
                Box::new(SyntheticCamera::without_hardware_timestamps()),
                &params,
            )
            .unwrap();
        assert_eq!(manager.timestamp_source(), Some(TimestampSource::Software));
        manager.stop();
    }

    #[test]
    fn test_double_start_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let deps = test_deps(tmp.path());
        let manager = CameraManager::new(deps);
        let params = CameraParams {
            camera_width_px: 8,
            camera_height_px: 8,
            camera_fps: 500.0,
            ..Default::default()
        };
        manager
            .start(Box::new(SyntheticCamera::new()), &params)
            .unwrap();
        assert!(manager
            .start(Box::new(SyntheticCamera::new()), &params)
            .is_err());
        manager.stop();
    }
}
