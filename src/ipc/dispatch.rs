//! Control-command dispatch.
//!
//! On startup the composition root registers every handler against its
//! command name; registering the same name twice is a startup error, not a
//! silent overwrite. At runtime the dispatcher parses one request line,
//! looks up the handler, and renders whatever happened (including a
//! handler panic) as the uniform `{success, type, ...}` response shape.
//! Error details are logged here; the response carries the message only.

use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};

use crate::app::AppContext;
use crate::error::{AppResult, IsiError};
use crate::ipc::message::{error_response, success_response, ControlRequest};

/// A control-command handler: extracts what it needs from the request
/// payload and returns the response payload.
pub type HandlerFn =
    Arc<dyn Fn(&AppContext, &Value) -> AppResult<Value> + Send + Sync + 'static>;

/// Table of command handlers, built once at startup.
#[derive(Default)]
pub struct CommandRegistry {
    table: HashMap<&'static str, HandlerFn>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Duplicate names are rejected so a wiring mistake
    /// surfaces before the control loop starts.
    pub fn register<F>(&mut self, command: &'static str, handler: F) -> AppResult<()>
    where
        F: Fn(&AppContext, &Value) -> AppResult<Value> + Send + Sync + 'static,
    {
        if self.table.contains_key(command) {
            return Err(IsiError::DuplicateHandler(command.to_string()));
        }
        self.table.insert(command, Arc::new(handler));
        Ok(())
    }

    pub fn command_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.table.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Dispatch one raw request line and return the response object.
    pub fn dispatch_line(&self, ctx: &AppContext, line: &str) -> Value {
        let request: ControlRequest = match serde_json::from_str(line) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "malformed control request");
                return error_response("unknown", &format!("Malformed request: {e}"));
            }
        };
        self.dispatch(ctx, &request)
    }

    /// Dispatch one parsed request.
    pub fn dispatch(&self, ctx: &AppContext, request: &ControlRequest) -> Value {
        let command = request.command.as_str();
        let Some(handler) = self.table.get(command) else {
            warn!(command, "unknown control command");
            return error_response(command, &format!("Unknown command: {command}"));
        };

        let handler = Arc::clone(handler);
        let outcome = catch_unwind(AssertUnwindSafe(|| handler(ctx, &request.payload)));
        match outcome {
            Ok(Ok(payload)) => success_response(command, payload),
            Ok(Err(e)) => {
                error!(command, error = %e, "command failed");
                error_response(command, &e.to_string())
            }
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                error!(command, panic = %msg, "handler panicked");
                error_response(command, &format!("Internal error: {msg}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_registration_is_error() {
        let mut registry = CommandRegistry::new();
        registry
            .register("ping", |_, _| Ok(serde_json::json!({})))
            .unwrap();
        let err = registry
            .register("ping", |_, _| Ok(serde_json::json!({})))
            .unwrap_err();
        assert!(err.to_string().contains("ping"));
    }

    #[test]
    fn test_command_names_sorted() {
        let mut registry = CommandRegistry::new();
        registry.register("b", |_, _| Ok(Value::Null)).unwrap();
        registry.register("a", |_, _| Ok(Value::Null)).unwrap();
        assert_eq!(registry.command_names(), vec!["a", "b"]);
    }
}
