//! Active-match discovery.
//!
//! `active_game` summaries announce matches the user is part of. The first
//! summary for an ID creates a minimal [`MatchState`] and marks it active;
//! the caller then subscribes it, which promotes the same entry to
//! connected. Later summaries for a known ID are ignored.

use std::fmt;

use tracing::debug;

use super::game::{EngineFactory, GameId, MatchState, MatchStore, Players};
use super::protocol::ActiveGameSummary;

pub struct ActiveMatchTracker {
    factory: EngineFactory,
}

impl fmt::Debug for ActiveMatchTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveMatchTracker").finish_non_exhaustive()
    }
}

impl ActiveMatchTracker {
    pub fn new(factory: EngineFactory) -> Self {
        Self { factory }
    }

    /// Track a summary. Returns the ID to subscribe if it was new.
    pub fn on_summary_update(
        &self,
        store: &mut MatchStore,
        summary: &ActiveGameSummary,
    ) -> Option<GameId> {
        if store.is_active(summary.id) {
            return None;
        }

        if !store.contains(summary.id) {
            let engine = (self.factory)(summary.width, summary.height);
            let state = MatchState::new(summary.id, summary.width, summary.height, engine)
                .with_players(
                    summary.name.clone(),
                    Players {
                        black: summary.black.clone(),
                        white: summary.white.clone(),
                    },
                );
            store.insert(state);
        }
        store.mark_active(summary.id);
        debug!(game_id = %summary.id, name = %summary.name, "tracking active game");
        Some(summary.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::game::default_engine_factory;
    use crate::realtime::protocol::decode;
    use serde_json::json;

    fn summary(id: i64) -> ActiveGameSummary {
        decode(
            "active_game",
            json!({
                "id": id,
                "name": "Evening game",
                "width": 13,
                "height": 13,
                "black": {"id": 1, "username": "kuro"},
                "white": {"id": 2, "username": "shiro"},
                "player_to_move": 1
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_first_summary_creates_state() {
        let tracker = ActiveMatchTracker::new(default_engine_factory());
        let mut store = MatchStore::new();

        assert_eq!(tracker.on_summary_update(&mut store, &summary(4)), Some(GameId(4)));

        let state = store.get(GameId(4)).unwrap();
        assert_eq!(state.width, 13);
        assert_eq!(state.name, "Evening game");
        assert_eq!(state.players.black.username, "kuro");
        assert!(store.is_active(GameId(4)));
    }

    #[test]
    fn test_repeated_summary_ignored() {
        let tracker = ActiveMatchTracker::new(default_engine_factory());
        let mut store = MatchStore::new();

        tracker.on_summary_update(&mut store, &summary(4));
        store.get_mut(GameId(4)).unwrap().request_undo(1);

        assert_eq!(tracker.on_summary_update(&mut store, &summary(4)), None);
        assert_eq!(store.get(GameId(4)).unwrap().undo_requested_at, Some(1));
        assert_eq!(store.count(), 1);
    }
}
