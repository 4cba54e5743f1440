//! Transport seam.
//!
//! The sync core never touches a socket directly. It asks a [`Transport`] to
//! open, close, and emit frames, and it is fed [`TransportEvent`]s back over
//! a channel. Reconnect timing belongs to the transport.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Request ID attached to frames that expect an acknowledgment.
pub type AckId = u64;

/// Something that happened on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A connection attempt (first or retry) started.
    Connecting,
    Connected,
    Disconnected { reason: String },
    Message { event: String, data: Value },
    Ack { id: AckId, data: Value },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport closed")]
    Closed,
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

pub trait Transport: Send + Sync + fmt::Debug {
    /// Begin connecting. Calling this while already open is harmless.
    fn open(&self);

    /// Stop the connection and any pending retries.
    fn close(&self);

    /// Queue a frame. Must not block on the network.
    fn emit(&self, event: &str, data: Value, ack: Option<AckId>) -> Result<(), TransportError>;
}

#[cfg(test)]
pub(crate) mod recording {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub struct Emitted {
        pub event: String,
        pub data: Value,
        pub ack: Option<AckId>,
    }

    /// Transport that records every frame instead of sending it.
    #[derive(Debug, Default)]
    pub struct RecordingTransport {
        emitted: Mutex<Vec<Emitted>>,
        pub opens: AtomicUsize,
        pub closes: AtomicUsize,
        pub fail_emits: AtomicBool,
    }

    impl RecordingTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn emitted(&self) -> Vec<Emitted> {
            self.emitted.lock().clone()
        }

        pub fn named(&self, event: &str) -> Vec<Emitted> {
            self.emitted
                .lock()
                .iter()
                .filter(|e| e.event == event)
                .cloned()
                .collect()
        }

        pub fn count(&self, event: &str) -> usize {
            self.named(event).len()
        }

        pub fn total(&self) -> usize {
            self.emitted.lock().len()
        }

        pub fn clear(&self) {
            self.emitted.lock().clear();
        }

        pub fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        pub fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    impl Transport for RecordingTransport {
        fn open(&self) {
            self.opens.fetch_add(1, Ordering::SeqCst);
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn emit(&self, event: &str, data: Value, ack: Option<AckId>) -> Result<(), TransportError> {
            if self.fail_emits.load(Ordering::SeqCst) {
                return Err(TransportError::NotConnected);
            }
            self.emitted.lock().push(Emitted {
                event: event.to_string(),
                data,
                ack,
            });
            Ok(())
        }
    }
}
