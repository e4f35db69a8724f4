//! Acquisition: mode state machine, session recording, the sweep
//! protocol orchestrator, and the three mode controllers.

pub mod modes;
pub mod orchestrator;
pub mod recorder;
pub mod state;

pub use modes::{PlaybackController, PreviewController, RecordController};
pub use orchestrator::{AcquisitionOrchestrator, OrchestratorDeps};
pub use recorder::SessionRecorder;
pub use state::{AcquisitionMode, StateCoordinator, StateSnapshot};
