//! Outbound command dispatch.
//!
//! Most intents are fire-and-forget. Move submission and game-list queries
//! are acknowledged: the frame carries an [`AckId`] and the caller waits on a
//! oneshot that the inbound ack resolves. A wait that times out is simply
//! abandoned; the server may still apply the command.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::error::{Result, SyncError};
use super::game::{GameId, Move, Point};
use super::protocol::{
    events, to_value, GameListQuery, MoveCommand, RemovedStonesCommand, ResignCommand, UndoCommand,
};
use super::transport::{AckId, Transport};

/// Logged-in user credentials used for authenticated commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: i64,
    pub username: String,
    /// Signed token for the general `authenticate` channel.
    pub chat_auth: String,
    /// Signed token for `notification/connect`.
    pub notification_auth: String,
    pub jwt: Option<String>,
}

impl Session {
    pub fn new(
        user_id: i64,
        username: impl Into<String>,
        chat_auth: impl Into<String>,
        notification_auth: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            username: username.into(),
            chat_auth: chat_auth.into(),
            notification_auth: notification_auth.into(),
            jwt: None,
        }
    }

    #[must_use]
    pub fn with_jwt(mut self, jwt: impl Into<String>) -> Self {
        self.jwt = Some(jwt.into());
        self
    }
}

fn require(session: Option<&Session>) -> Result<&Session> {
    session.ok_or(SyncError::NotAuthenticated)
}

#[derive(Debug)]
struct PendingAck {
    command: &'static str,
    tx: oneshot::Sender<Value>,
}

/// A sent command waiting for its acknowledgment.
#[derive(Debug)]
pub struct AckWait {
    pub id: AckId,
    pub command: &'static str,
    rx: oneshot::Receiver<Value>,
}

impl AckWait {
    /// Wait up to `timeout` for the acknowledgment payload.
    pub async fn wait(self, timeout: Duration) -> Result<Value> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(data)) => Ok(data),
            // sender dropped: the dispatcher abandoned or was torn down
            Ok(Err(_)) => Err(SyncError::Closed),
            Err(_) => Err(SyncError::AckTimeout {
                command: self.command,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

#[derive(Debug)]
pub struct CommandDispatcher {
    transport: Arc<dyn Transport>,
    pending: HashMap<AckId, PendingAck>,
    next_ack: AckId,
}

impl CommandDispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            pending: HashMap::new(),
            next_ack: 0,
        }
    }

    /// Fire-and-forget send.
    pub fn send(&self, event: &str, payload: Value) -> Result<()> {
        self.transport.emit(event, payload, None)?;
        Ok(())
    }

    /// Send with an ack ID and register the waiter.
    pub fn send_acked(&mut self, command: &'static str, payload: Value) -> Result<AckWait> {
        self.next_ack += 1;
        let id = self.next_ack;
        let (tx, rx) = oneshot::channel();

        self.transport.emit(command, payload, Some(id))?;
        self.pending.insert(id, PendingAck { command, tx });
        Ok(AckWait { id, command, rx })
    }

    /// Deliver an inbound acknowledgment. Returns whether anyone was waiting.
    pub fn resolve(&mut self, id: AckId, data: Value) -> bool {
        let Some(pending) = self.pending.remove(&id) else {
            debug!(id, "ack for unknown or abandoned command");
            return false;
        };
        if pending.tx.send(data).is_err() {
            debug!(id, command = pending.command, "ack arrived after caller gave up");
            return false;
        }
        true
    }

    /// Forget a waiter that stopped waiting (timed out or dropped).
    pub fn abandon(&mut self, id: AckId) -> bool {
        match self.pending.remove(&id) {
            Some(pending) => {
                warn!(id, command = pending.command, "acknowledgment abandoned");
                true
            }
            None => false,
        }
    }

    /// Fail every waiter. Acks never cross a reconnect, so this runs when
    /// the connection goes away; waiters see [`SyncError::Closed`].
    pub fn abandon_all(&mut self) -> usize {
        let count = self.pending.len();
        if count > 0 {
            debug!(count, "dropping pending acknowledgments");
        }
        self.pending.clear();
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn submit_move(
        &mut self,
        session: Option<&Session>,
        game_id: GameId,
        mv: Move,
    ) -> Result<AckWait> {
        let session = require(session)?;
        let payload = MoveCommand {
            game_id,
            player_id: session.user_id,
            coords: mv.to_wire(),
        };
        self.send_acked(events::GAME_MOVE, to_value(&payload))
    }

    pub fn resign(&self, session: Option<&Session>, game_id: GameId) -> Result<()> {
        let session = require(session)?;
        let payload = ResignCommand {
            game_id,
            player_id: session.user_id,
        };
        self.send(events::GAME_RESIGN, to_value(&payload))
    }

    pub fn request_undo(
        &self,
        session: Option<&Session>,
        game_id: GameId,
        move_number: u32,
    ) -> Result<()> {
        let session = require(session)?;
        let payload = UndoCommand {
            game_id,
            player_id: session.user_id,
            move_number,
        };
        self.send(events::UNDO_REQUEST, to_value(&payload))
    }

    pub fn accept_undo(
        &self,
        session: Option<&Session>,
        game_id: GameId,
        move_number: u32,
    ) -> Result<()> {
        let session = require(session)?;
        let payload = UndoCommand {
            game_id,
            player_id: session.user_id,
            move_number,
        };
        self.send(events::UNDO_ACCEPT, to_value(&payload))
    }

    /// Mark (or unmark) stones as dead during stone removal.
    pub fn set_removed_stones(
        &self,
        session: Option<&Session>,
        game_id: GameId,
        stones: &[Point],
        removed: bool,
    ) -> Result<()> {
        let session = require(session)?;
        let payload = RemovedStonesCommand {
            game_id,
            player_id: session.user_id,
            removed,
            stones: stones.iter().map(|p| Move::Stone(*p).to_wire()).collect(),
        };
        self.send(events::REMOVED_STONES_SET, to_value(&payload))
    }

    pub fn query_game_list(&mut self, query: &GameListQuery) -> Result<AckWait> {
        self.send_acked(events::GAMELIST_QUERY, to_value(query))
    }
}
