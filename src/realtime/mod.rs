//! Realtime match synchronization.
//!
//! This module keeps local match state in step with the game server over a
//! single persistent connection:
//!
//! - `connection` - Connection state machine and deferred on-connect work
//! - `registry` - Per-match subscriptions and their handler tables
//! - `router` - Applies inbound per-match messages to match state
//! - `dispatcher` - Outbound intents and acknowledgment waits
//! - `drift` - Local/server clock offset from probe round trips
//! - `tracker` - Discovery of the user's active matches
//! - `client` - The mutex-guarded core and its event loop
//! - `websocket` - The concrete WebSocket transport
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                      SyncClient (Arc<Mutex<SyncCore>>)               │
//! │                                                                      │
//! │  ┌────────────────┐  ┌──────────────────────┐  ┌──────────────────┐  │
//! │  │  Connection    │  │ SubscriptionRegistry │  │ CommandDispatcher│  │
//! │  │                │  │                      │  │                  │  │
//! │  │ state machine  │  │ game_id →            │  │ ack_id →         │  │
//! │  │ deferred work  │  │   handler tokens     │  │   oneshot waiter │  │
//! │  └────────────────┘  └──────────────────────┘  └──────────────────┘  │
//! │                                                                      │
//! │  ┌─────────────────────────────────────────────────────────────────┐ │
//! │  │                        MatchStore                               │ │
//! │  │   game_id → MatchState       active ⊆ ids    connected ⊆ ids    │ │
//! │  └─────────────────────────────────────────────────────────────────┘ │
//! │                                                                      │
//! │  EventRouter   ActiveMatchTracker   DriftEstimator                   │
//! └──────────────────────────────────────────────────────────────────────┘
//!          ▲ TransportEvent (mpsc)              │ emit
//!          │                                    ▼
//!      ┌─────────────────── dyn Transport ───────────────────┐
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use goban_sync::realtime::{GameId, Move, Point, Session};
//!
//! client.set_session(Some(Session::new(42, "alice", chat_token, notify_token)));
//! client.subscribe(GameId(7));
//!
//! // waits up to the configured ack timeout
//! client.submit_move(GameId(7), Move::Stone(Point::new(3, 3))).await?;
//! ```

pub mod client;
pub mod clock;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod drift;
pub mod error;
pub mod events;
pub mod game;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod tracker;
pub mod transport;
pub mod websocket;

// Re-export commonly used types
pub use client::{QueryStart, SyncClient, SyncCore};
pub use clock::{
    ClockDisplay, ClockSnapshot, ManualClock, PlayerClock, Side, SideDisplay, SystemClock,
    TimeControlSystem, TimeSource,
};
pub use config::SyncConfig;
pub use connection::{ConnectionEvent, ConnectionState, InvalidTransition};
pub use dispatcher::{AckWait, Session};
pub use drift::{DriftEstimate, DriftSample};
pub use error::SyncError;
pub use events::SyncEvent;
pub use game::{
    default_engine_factory, EngineFactory, GameId, GamePhase, GameSnapshot, MatchState,
    MatchStore, Move, MoveError, MoveHistory, MoveRecord, PlayerInfo, Players, Point,
    RulesEngine, DEFAULT_BOARD_SIZE,
};
pub use protocol::{GameList, GameListPage, GameListQuery, MessageKind};
pub use transport::{AckId, Transport, TransportError, TransportEvent};
pub use websocket::{ReconnectPolicy, WebSocketTransport};
