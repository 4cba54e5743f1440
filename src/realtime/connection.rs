//! Connection lifecycle.
//!
//! Tracks the single shared transport and validates its state transitions.
//!
//! # State Diagram
//!
//! ```text
//!                 open
//! ┌──────────────┐──────▶┌────────────┐ established ┌───────────┐
//! │ Disconnected │       │ Connecting │────────────▶│ Connected │
//! └──────────────┘◀──────└────────────┘◀────────────└───────────┘
//!        ▲      lost/close      ▲          attempt        │
//!        │                      └──────── (retry) ────────┤
//!        └────────────────── lost/close ──────────────────┘
//! ```
//!
//! Retries are driven by the transport; they show up here as `Attempt`
//! events. After the user closes the connection, `Attempt` and
//! `Established` are refused until the next open, so events the transport
//! queued before it stopped cannot revive it. Work that needs a live
//! connection can be parked with
//! [`Connection::defer`] and is handed back exactly once on the next
//! `Established`.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::info;

use super::game::GameId;
use super::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Connecting or connected: a transport is live or coming up.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Caller asked to connect.
    Open,
    /// Transport started a (re)connection attempt.
    Attempt,
    /// Transport reports the socket is up.
    Established,
    /// Transport reports the socket went away.
    Lost,
    /// Caller asked to disconnect.
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition from {from} via {event:?}: {reason}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub event: ConnectionEvent,
    pub reason: &'static str,
}

/// Work parked until the next successful connect.
#[derive(Debug)]
pub enum Deferred {
    /// Retry a subscribe for this match.
    Subscribe(GameId),
    /// Wake a task waiting for the connection.
    Notify(oneshot::Sender<()>),
}

#[derive(Debug)]
pub struct Connection {
    transport: Arc<dyn Transport>,
    state: ConnectionState,
    /// When the current state was entered
    since: DateTime<Utc>,
    /// Successful connects so far
    established_count: u64,
    /// Set by `open`, cleared by `close`
    keep_open: bool,
    deferred: Vec<Deferred>,
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            state: ConnectionState::Disconnected,
            since: Utc::now(),
            established_count: 0,
            keep_open: false,
            deferred: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }

    pub fn established_count(&self) -> u64 {
        self.established_count
    }

    /// Whether the user wants a connection (opened and not closed since).
    pub fn keep_open(&self) -> bool {
        self.keep_open
    }

    /// Shared handle for components that emit frames.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// Apply an event in place. Returns the previous state.
    pub fn apply_mut(&mut self, event: ConnectionEvent) -> Result<ConnectionState, InvalidTransition> {
        let next = self.transition(event)?;
        let previous = self.state;
        if next != previous {
            info!(from = %previous, to = %next, "connection state changed");
            self.since = Utc::now();
        }
        if event == ConnectionEvent::Established {
            self.established_count += 1;
        }
        self.state = next;
        Ok(previous)
    }

    fn transition(&self, event: ConnectionEvent) -> Result<ConnectionState, InvalidTransition> {
        use ConnectionEvent::*;
        use ConnectionState::*;

        let invalid = |reason: &'static str| InvalidTransition {
            from: self.state,
            event,
            reason,
        };

        match (self.state, event) {
            (Disconnected, Open) => Ok(Connecting),
            (_, Open) => Err(invalid("Already connecting or connected")),

            (_, Attempt | Established) if !self.keep_open => Err(invalid("Closed or never opened")),

            (_, Attempt) => Ok(Connecting),

            // A repeated Established re-runs the handshake
            (_, Established) => Ok(Connected),

            (Disconnected, Lost) => Err(invalid("Already disconnected")),
            (_, Lost) => Ok(Disconnected),

            (Disconnected, Close) => Err(invalid("Already disconnected")),
            (_, Close) => Ok(Disconnected),
        }
    }

    /// Start connecting unless a transport is already live.
    /// Returns whether the transport was asked to open.
    pub fn open(&mut self) -> bool {
        self.keep_open = true;
        if self.apply_mut(ConnectionEvent::Open).is_err() {
            return false;
        }
        self.transport.open();
        true
    }

    /// Close the transport and stop its retries, whatever the current state.
    /// Returns `false` if the user had not opened it.
    pub fn close(&mut self) -> bool {
        if !self.keep_open {
            return false;
        }
        self.keep_open = false;
        if self.state != ConnectionState::Disconnected {
            // only Disconnected refuses Close
            let _ = self.apply_mut(ConnectionEvent::Close);
        }
        self.transport.close();
        true
    }

    /// Park work until the next `Established`.
    pub fn defer(&mut self, work: Deferred) {
        self.deferred.push(work);
    }

    /// Hand back all parked work. Each item is returned exactly once.
    pub fn take_deferred(&mut self) -> Vec<Deferred> {
        std::mem::take(&mut self.deferred)
    }

    /// Drop a parked subscribe for `game_id`. Returns whether one was parked.
    pub fn cancel_deferred_subscribe(&mut self, game_id: GameId) -> bool {
        let before = self.deferred.len();
        self.deferred
            .retain(|work| !matches!(work, Deferred::Subscribe(id) if *id == game_id));
        self.deferred.len() != before
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }
}
