//! IPC surface: control dispatch, broadcast channels, and the
//! shared-memory frame planes.

pub mod channels;
pub mod dispatch;
pub mod message;
pub mod shm;

pub use channels::{EventBus, LinePublisher};
pub use dispatch::{CommandRegistry, HandlerFn};
pub use message::{ControlRequest, HealthPulse, SyncEvent};
pub use shm::{FramePlane, FramePlanes, PlaneKind};
