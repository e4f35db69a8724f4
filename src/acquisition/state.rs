//! Acquisition mode state machine.
//!
//! Exactly one mode is active at a time; transitions are validated against
//! a fixed table and every read or write goes through a single lock. The
//! coordinator is the single source of truth for mode; the UI only
//! mirrors it via `mode_changed` sync events.

use serde::Serialize;
use std::sync::Mutex;
use tracing::info;

use crate::error::{AppResult, IsiError};

/// The four acquisition modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    Idle,
    Preview,
    Recording,
    Playback,
}

impl AcquisitionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AcquisitionMode::Idle => "idle",
            AcquisitionMode::Preview => "preview",
            AcquisitionMode::Recording => "recording",
            AcquisitionMode::Playback => "playback",
        }
    }

    /// The transition table. Out of RECORDING only IDLE is reachable;
    /// self-transitions are not transitions.
    fn can_transition_to(self, to: AcquisitionMode) -> bool {
        use AcquisitionMode::*;
        match (self, to) {
            (a, b) if a == b => false,
            (Idle, _) => true,
            (Preview, _) => true,
            (Recording, Idle) => true,
            (Recording, _) => false,
            (Playback, Idle) | (Playback, Preview) => true,
            (Playback, _) => false,
        }
    }
}

impl std::fmt::Display for AcquisitionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the full flag bundle, serialized into status responses.
#[derive(Clone, Debug, Serialize)]
pub struct StateSnapshot {
    pub mode: AcquisitionMode,
    pub camera_active: bool,
    pub stimulus_active: bool,
    pub acquisition_running: bool,
    pub current_session: Option<String>,
}

struct CoordinatorInner {
    mode: AcquisitionMode,
    camera_active: bool,
    stimulus_active: bool,
    acquisition_running: bool,
    current_session: Option<String>,
}

/// Process-lifetime owner of the mode enum and activity flags.
pub struct StateCoordinator {
    inner: Mutex<CoordinatorInner>,
}

impl Default for StateCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CoordinatorInner {
                mode: AcquisitionMode::Idle,
                camera_active: false,
                stimulus_active: false,
                acquisition_running: false,
                current_session: None,
            }),
        }
    }

    /// Attempt a guarded transition. Rejections name both states.
    pub fn transition(&self, to: AcquisitionMode) -> AppResult<()> {
        let mut inner = self.lock();
        if inner.mode == to {
            return Ok(());
        }
        if !inner.mode.can_transition_to(to) {
            return Err(IsiError::InvalidTransition {
                from: inner.mode.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        info!(from = %inner.mode, to = %to, "acquisition mode transition");
        inner.mode = to;
        Ok(())
    }

    pub fn mode(&self) -> AcquisitionMode {
        self.lock().mode
    }

    pub fn is_idle(&self) -> bool {
        self.mode() == AcquisitionMode::Idle
    }

    pub fn is_preview(&self) -> bool {
        self.mode() == AcquisitionMode::Preview
    }

    pub fn is_recording(&self) -> bool {
        self.mode() == AcquisitionMode::Recording
    }

    pub fn is_playback(&self) -> bool {
        self.mode() == AcquisitionMode::Playback
    }

    pub fn set_camera_active(&self, active: bool) {
        self.lock().camera_active = active;
    }

    pub fn set_stimulus_active(&self, active: bool) {
        self.lock().stimulus_active = active;
    }

    pub fn set_acquisition_running(&self, running: bool) {
        self.lock().acquisition_running = running;
    }

    pub fn set_current_session(&self, session: Option<String>) {
        self.lock().current_session = session;
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.lock();
        StateSnapshot {
            mode: inner.mode,
            camera_active: inner.camera_active,
            stimulus_active: inner.stimulus_active,
            acquisition_running: inner.acquisition_running,
            current_session: inner.current_session.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CoordinatorInner> {
        self.inner.lock().expect("state coordinator lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AcquisitionMode::*;

    #[test]
    fn test_idle_reaches_everything() {
        for target in [Preview, Recording, Playback] {
            let state = StateCoordinator::new();
            state.transition(target).unwrap();
            assert_eq!(state.mode(), target);
        }
    }

    #[test]
    fn test_recording_only_exits_to_idle() {
        let state = StateCoordinator::new();
        state.transition(Recording).unwrap();
        assert!(state.transition(Preview).is_err());
        assert!(state.transition(Playback).is_err());
        assert_eq!(state.mode(), Recording);
        state.transition(Idle).unwrap();
        assert!(state.is_idle());
    }

    #[test]
    fn test_playback_cannot_start_recording() {
        let state = StateCoordinator::new();
        state.transition(Playback).unwrap();
        assert!(state.transition(Recording).is_err());
        state.transition(Preview).unwrap();
        assert!(state.is_preview());
    }

    #[test]
    fn test_preview_reaches_everything() {
        for target in [Idle, Recording, Playback] {
            let state = StateCoordinator::new();
            state.transition(Preview).unwrap();
            state.transition(target).unwrap();
            assert_eq!(state.mode(), target);
        }
    }

    #[test]
    fn test_same_mode_is_noop() {
        let state = StateCoordinator::new();
        state.transition(Recording).unwrap();
        state.transition(Recording).unwrap();
        assert!(state.is_recording());
    }

    #[test]
    fn test_snapshot_reflects_flags() {
        let state = StateCoordinator::new();
        state.set_camera_active(true);
        state.set_current_session(Some("sess".into()));
        let snap = state.snapshot();
        assert!(snap.camera_active);
        assert!(!snap.acquisition_running);
        assert_eq!(snap.current_session.as_deref(), Some("sess"));
    }
}
