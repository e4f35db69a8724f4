//! Custom error types for the application.
//!
//! This module defines the primary error type, `IsiError`, for the entire
//! backend. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the error classes the system distinguishes:
//!
//! - **`Validation`**: A request or parameter update carried a missing or
//!   invalid value (unknown direction, `camera_fps` absent, bad range).
//!   Surfaced as a `{success:false, error}` response; no recovery attempted.
//! - **`Io` / `Storage` / `Hdf5`**: Resource errors from the filesystem,
//!   the session layout, or the HDF5 layer.
//! - **`Camera`**: The capture device failed to open or deliver a frame.
//! - **`SharedMemory`**: A frame-plane create or write failed.
//! - **`InvalidTransition`**: A guarded acquisition-mode transition was
//!   rejected by the state coordinator.
//! - **`RecordingFatal`**: An error raised inside the acquisition loop while
//!   a recording was active. This is the scientific-validity gate: the
//!   acquisition terminates and the session is left on disk for forensics.
//! - **`Analysis`**: The analysis pipeline failed; no partial results file
//!   is written.
//! - **`Cancelled`**: A worker honored a cooperative stop request.
//!
//! Handlers never leak these across the IPC boundary; the dispatcher renders
//! every error as a uniform `{success:false, type, error}` response.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, IsiError>;

#[derive(Error, Debug)]
pub enum IsiError {
    #[error("{0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Shared memory error: {0}")]
    SharedMemory(String),

    #[error("Invalid mode transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Duplicate command handler registered for '{0}'")]
    DuplicateHandler(String),

    #[error("Recording error: {0}")]
    RecordingFatal(String),

    #[error("Analysis error: {0}")]
    Analysis(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IsiError {
    /// Shorthand for a validation failure with a formatted message.
    pub fn validation(msg: impl Into<String>) -> Self {
        IsiError::Validation(msg.into())
    }
}
