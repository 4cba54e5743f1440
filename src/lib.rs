//! Goban Sync Library
//!
//! This crate keeps a Go client's view of its matches synchronized with the
//! game server in real time.
//!
//! # Overview
//!
//! The realtime module provides:
//!
//! - **Connection Management** - One shared connection with a validated state
//!   machine, an authentication handshake, and full resubscription after
//!   every reconnect.
//!
//! - **Match Subscriptions** - Per-match handler sets that are registered and
//!   removed together, so repeated subscribe/unsubscribe cycles never leak.
//!
//! - **Event Routing** - Full syncs, moves, clocks, and undo traffic applied
//!   to local match state through a pluggable rules engine.
//!
//! - **Commands** - Moves, resignation, undo, stone removal, and game-list
//!   queries, with acknowledgment waits where the server confirms.
//!
//! - **Clock Drift** - A midpoint estimate of local/server offset used to
//!   count game clocks down between server updates.
//!
//! # Design Principles
//!
//! 1. **One lock, no await under it** - All shared state sits in a single
//!    `SyncCore` behind a mutex that is never held across a suspension point.
//!
//! 2. **Stores provide indexed access** - Each match is stored once; the
//!    active and connected sets are indexes over the same entries.
//!
//! 3. **Transport is a seam** - The core speaks to a `Transport` trait; the
//!    WebSocket implementation is one option.
//!
//! 4. **Bad input drops one update** - Malformed payloads are logged and
//!    skipped without disturbing anything else.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use goban_sync::{GameId, SyncClient, SyncConfig, WebSocketTransport};
//! use tokio::sync::mpsc;
//!
//! # async fn demo() {
//! let (events_tx, events_rx) = mpsc::unbounded_channel();
//! let transport = Arc::new(WebSocketTransport::new("wss://play.example/socket", events_tx));
//! let client = SyncClient::new(transport, SyncConfig::default());
//!
//! // Drive the client from inbound events and its timers
//! tokio::spawn(client.clone().run(events_rx));
//!
//! client.connect();
//! client.subscribe(GameId(12345));
//! # }
//! ```

pub mod realtime;

// Re-export everything from realtime module at crate root
pub use realtime::*;
