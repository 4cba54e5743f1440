//! Inbound per-match event application.
//!
//! Each handler decodes its payload and mutates exactly one [`MatchState`].
//! A bad payload or an engine rejection drops that one update and nothing
//! else; the router never returns an error to the connection loop.

use serde_json::Value;
use tracing::{debug, warn};

use super::clock::ClockSnapshot;
use super::game::{GameId, GameSnapshot, MatchStore, Move, MoveRecord};
use super::protocol::{decode, MessageKind, MovePayload, UndoPayload};

/// What happened to one inbound update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Updated,
    /// Already applied, or no local state for the match.
    Ignored,
    /// Full sync reported a final result; the caller must unsubscribe.
    Concluded { outcome: Option<String> },
    /// Decode failure or engine rejection.
    Dropped,
}

/// Running totals, handy in logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub updated: u64,
    pub ignored: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
pub struct EventRouter {
    stats: RouterStats,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Apply one message of `kind` for `game_id`.
    pub fn apply(
        &mut self,
        store: &mut MatchStore,
        game_id: GameId,
        kind: MessageKind,
        data: Value,
    ) -> Applied {
        let applied = match kind {
            MessageKind::GameData => self.full_sync(store, game_id, data),
            MessageKind::Move => self.on_move(store, game_id, data),
            MessageKind::Clock => self.on_clock(store, game_id, data),
            MessageKind::UndoAccepted => self.on_undo_accepted(store, game_id, data),
            MessageKind::UndoRequested => self.on_undo_requested(store, game_id, data),
        };

        match &applied {
            Applied::Updated | Applied::Concluded { .. } => self.stats.updated += 1,
            Applied::Ignored => self.stats.ignored += 1,
            Applied::Dropped => self.stats.dropped += 1,
        }
        applied
    }

    fn full_sync(&mut self, store: &mut MatchStore, game_id: GameId, data: Value) -> Applied {
        let event = MessageKind::GameData.channel(game_id);
        let snapshot: GameSnapshot = match decode(&event, data) {
            Ok(s) => s,
            Err(e) => return dropped(game_id, &e),
        };
        if snapshot.game_id != game_id {
            warn!(%game_id, payload_id = %snapshot.game_id, "gamedata for another game");
            return Applied::Dropped;
        }
        let Some(state) = store.get_mut(game_id) else {
            return Applied::Ignored;
        };

        let outcome = snapshot.outcome.clone();
        let is_final = snapshot.is_final();
        if let Err(e) = state.replace_full_state(snapshot) {
            if !is_final {
                return dropped(game_id, &e);
            }
            // the match is over either way
            warn!(%game_id, error = %e, "final gamedata rejected by engine");
        }

        if is_final {
            Applied::Concluded { outcome }
        } else {
            Applied::Updated
        }
    }

    fn on_move(&mut self, store: &mut MatchStore, game_id: GameId, data: Value) -> Applied {
        let event = MessageKind::Move.channel(game_id);
        let payload: MovePayload = match decode(&event, data) {
            Ok(p) => p,
            Err(e) => return dropped(game_id, &e),
        };
        if payload.game_id != game_id {
            warn!(%game_id, payload_id = %payload.game_id, "move for another game");
            return Applied::Dropped;
        }
        let mv = match Move::from_wire_slice(&payload.coords) {
            Ok(mv) => mv,
            Err(e) => return dropped(game_id, &e),
        };
        let Some(state) = store.get_mut(game_id) else {
            return Applied::Ignored;
        };

        let number = payload.move_number.unwrap_or(state.move_count() + 1);
        if number <= state.move_count() {
            debug!(%game_id, number, "duplicate move ignored");
            return Applied::Ignored;
        }

        match state.apply_move(MoveRecord { number, mv }) {
            Ok(()) => Applied::Updated,
            Err(e) => dropped(game_id, &e),
        }
    }

    fn on_clock(&mut self, store: &mut MatchStore, game_id: GameId, data: Value) -> Applied {
        let event = MessageKind::Clock.channel(game_id);
        let clock: ClockSnapshot = match decode(&event, data) {
            Ok(c) => c,
            Err(e) => return dropped(game_id, &e),
        };
        let Some(state) = store.get_mut(game_id) else {
            return Applied::Ignored;
        };
        state.replace_clock(clock);
        Applied::Updated
    }

    fn on_undo_accepted(&mut self, store: &mut MatchStore, game_id: GameId, data: Value) -> Applied {
        let event = MessageKind::UndoAccepted.channel(game_id);
        let payload: UndoPayload = match decode(&event, data) {
            Ok(p) => p,
            Err(e) => return dropped(game_id, &e),
        };
        let Some(state) = store.get_mut(game_id) else {
            return Applied::Ignored;
        };
        state.undo_to(payload.move_number());
        Applied::Updated
    }

    fn on_undo_requested(
        &mut self,
        store: &mut MatchStore,
        game_id: GameId,
        data: Value,
    ) -> Applied {
        let event = MessageKind::UndoRequested.channel(game_id);
        let payload: UndoPayload = match decode(&event, data) {
            Ok(p) => p,
            Err(e) => return dropped(game_id, &e),
        };
        let Some(state) = store.get_mut(game_id) else {
            return Applied::Ignored;
        };
        state.request_undo(payload.move_number());
        Applied::Updated
    }
}

fn dropped(game_id: GameId, error: &dyn std::error::Error) -> Applied {
    warn!(%game_id, %error, "update dropped");
    Applied::Dropped
}
