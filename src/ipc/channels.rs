//! Line-oriented JSON channels.
//!
//! The control channel is stdin/stdout and lives in `main`; this module
//! provides the two broadcast channels (sync/event and health). Each is a
//! TCP listener on localhost publishing newline-delimited JSON to every
//! connected client. Publishing never blocks the backend: a client that
//! stalls or disconnects is dropped on the next write.
//!
//! In-process consumers (tests, the health publisher) can attach a local
//! tap; taps receive every published value through a bounded channel and
//! drop messages rather than block, the same policy applied to live-frame
//! taps elsewhere in the system.

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{AppResult, IsiError};
use crate::ipc::message::SyncEvent;

/// Bounded depth of each local tap.
const TAP_CHANNEL_SIZE: usize = 256;

/// A one-to-many publisher of newline-delimited JSON.
pub struct LinePublisher {
    name: &'static str,
    port: u16,
    clients: Arc<Mutex<Vec<TcpStream>>>,
    taps: Mutex<Vec<Sender<serde_json::Value>>>,
}

impl LinePublisher {
    /// Bind a listener on `127.0.0.1:port` and start the accept thread.
    /// Port 0 binds an ephemeral port (used by tests).
    pub fn bind(name: &'static str, port: u16) -> AppResult<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .map_err(|e| IsiError::Io(std::io::Error::new(e.kind(), format!("{name}: {e}"))))?;
        let bound_port = listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(port);
        let clients: Arc<Mutex<Vec<TcpStream>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_clients = Arc::clone(&clients);
        std::thread::Builder::new()
            .name(format!("{name}-accept"))
            .spawn(move || {
                for stream in listener.incoming() {
                    match stream {
                        Ok(stream) => {
                            // Publishes must not stall on one slow client.
                            let _ = stream.set_nonblocking(true);
                            debug!(channel = name, "subscriber connected");
                            if let Ok(mut clients) = accept_clients.lock() {
                                clients.push(stream);
                            }
                        }
                        Err(e) => {
                            warn!(channel = name, error = %e, "accept failed");
                        }
                    }
                }
            })?;

        info!(channel = name, port = bound_port, "broadcast channel listening");
        Ok(Self {
            name,
            port: bound_port,
            clients,
            taps: Mutex::new(Vec::new()),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Attach a local tap receiving every published value.
    pub fn tap(&self) -> Receiver<serde_json::Value> {
        let (tx, rx) = bounded(TAP_CHANNEL_SIZE);
        self.taps.lock().expect("tap lock poisoned").push(tx);
        rx
    }

    /// Publish one value to all subscribers and taps. Dead or stalled
    /// clients are dropped; a full tap drops this message only.
    pub fn publish<T: Serialize>(&self, message: &T) {
        let value = match serde_json::to_value(message) {
            Ok(v) => v,
            Err(e) => {
                warn!(channel = self.name, error = %e, "unserializable message dropped");
                return;
            }
        };

        {
            let mut taps = self.taps.lock().expect("tap lock poisoned");
            taps.retain(|tap| match tap.try_send(value.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    debug!(channel = self.name, "tap full, message dropped");
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
        }

        let mut line = value.to_string();
        line.push('\n');
        let bytes = line.as_bytes();
        if let Ok(mut clients) = self.clients.lock() {
            clients.retain_mut(|stream| match stream.write_all(bytes) {
                Ok(()) => true,
                Err(e) => {
                    debug!(channel = self.name, error = %e, "dropping subscriber");
                    false
                }
            });
        }
    }
}

/// The sync/event broadcast channel with typed publish helpers.
pub struct EventBus {
    publisher: LinePublisher,
}

impl EventBus {
    pub fn bind(port: u16) -> AppResult<Self> {
        Ok(Self {
            publisher: LinePublisher::bind("sync", port)?,
        })
    }

    pub fn publish(&self, event: &SyncEvent) {
        self.publisher.publish(event);
    }

    pub fn port(&self) -> u16 {
        self.publisher.port()
    }

    pub fn tap(&self) -> Receiver<serde_json::Value> {
        self.publisher.tap()
    }
}
