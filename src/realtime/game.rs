//! Match state and the rules-engine seam.
//!
//! The sync layer never decides whether a move is legal. Move history lives
//! behind [`RulesEngine`], which the embedding application can back with a
//! real board implementation. [`MoveHistory`] is the built-in engine that
//! only keeps the move list in order.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::clock::{ClockDisplay, ClockSnapshot, TimeControlSystem};

/// Board size used when a match is subscribed before anything is known about it.
pub const DEFAULT_BOARD_SIZE: u32 = 19;

/// Server-side match identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct GameId(pub i64);

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for GameId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Board intersection, zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub column: u32,
    pub row: u32,
}

impl Point {
    pub fn new(column: u32, row: u32) -> Self {
        Self { column, row }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.column, self.row)
    }
}

/// A single turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Move {
    Pass,
    Stone(Point),
}

impl Move {
    /// Decode a wire coordinate pair.
    ///
    /// The wire sends `[row, column]`; `[-1, -1]` is a pass.
    pub fn from_wire(first: i64, second: i64) -> Result<Self, MoveError> {
        match (first, second) {
            (-1, -1) => Ok(Self::Pass),
            (row, column) if row >= 0 && column >= 0 => {
                let row = u32::try_from(row).map_err(|_| MoveError::InvalidCoordinate(first, second))?;
                let column =
                    u32::try_from(column).map_err(|_| MoveError::InvalidCoordinate(first, second))?;
                Ok(Self::Stone(Point::new(column, row)))
            }
            _ => Err(MoveError::InvalidCoordinate(first, second)),
        }
    }

    /// Decode the first two elements of a wire move array (`[r, c, time?]`).
    pub fn from_wire_slice(coords: &[f64]) -> Result<Self, MoveError> {
        match coords {
            [first, second, ..] => Self::from_wire(*first as i64, *second as i64),
            _ => Err(MoveError::Malformed),
        }
    }

    pub fn to_wire(&self) -> [i64; 2] {
        match self {
            Self::Pass => [-1, -1],
            Self::Stone(p) => [i64::from(p.row), i64::from(p.column)],
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

/// A move tagged with its 1-based position in the game record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveRecord {
    pub number: u32,
    pub mv: Move,
}

/// Rejections from the rules engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoveError {
    #[error("move number mismatch: expected {expected}, got {got}")]
    MoveCountMismatch { expected: u32, got: u32 },
    #[error("{point} is outside the {width}x{height} board")]
    OutOfBounds { point: Point, width: u32, height: u32 },
    #[error("invalid wire coordinate [{0}, {1}]")]
    InvalidCoordinate(i64, i64),
    #[error("malformed move record")]
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GamePhase {
    #[default]
    #[serde(rename = "play")]
    Play,
    #[serde(rename = "stone removal")]
    StoneRemoval,
    #[serde(rename = "finished")]
    Finished,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlayerInfo {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Players {
    #[serde(default)]
    pub black: PlayerInfo,
    #[serde(default)]
    pub white: PlayerInfo,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TimeControl {
    #[serde(default)]
    pub system: TimeControlSystem,
}

/// Full authoritative match snapshot (`game/{id}/gamedata`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSnapshot {
    pub game_id: GameId,
    #[serde(default)]
    pub game_name: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub phase: GamePhase,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub winner: Option<i64>,
    #[serde(default)]
    pub players: Players,
    /// `[row, column, seconds_taken?]` per move.
    #[serde(default)]
    pub moves: Vec<Vec<f64>>,
    #[serde(default)]
    pub time_control: TimeControl,
    #[serde(default)]
    pub clock: Option<ClockSnapshot>,
    #[serde(default)]
    pub undo_requested: Option<u32>,
}

impl GameSnapshot {
    /// Whether the server has declared a result.
    pub fn is_final(&self) -> bool {
        self.outcome.as_deref().is_some_and(|o| !o.is_empty()) || self.phase == GamePhase::Finished
    }

    /// Decode the move list, stopping at the first malformed entry.
    pub fn decoded_moves(&self) -> Result<Vec<Move>, MoveError> {
        self.moves.iter().map(|m| Move::from_wire_slice(m)).collect()
    }
}

/// Mutator over a match's move history.
pub trait RulesEngine: Send + fmt::Debug {
    /// Extend the history by one move.
    fn apply_move(&mut self, record: MoveRecord) -> Result<(), MoveError>;

    /// Revert so that exactly `move_number` moves remain.
    fn undo_to(&mut self, move_number: u32);

    /// Rebuild from a full snapshot.
    fn replace_full_state(&mut self, snapshot: &GameSnapshot) -> Result<(), MoveError>;

    fn move_count(&self) -> u32;

    fn moves(&self) -> &[Move];
}

/// Builds a fresh engine for a `width` x `height` board.
pub type EngineFactory = Arc<dyn Fn(u32, u32) -> Box<dyn RulesEngine> + Send + Sync>;

pub fn default_engine_factory() -> EngineFactory {
    Arc::new(|width, height| -> Box<dyn RulesEngine> { Box::new(MoveHistory::new(width, height)) })
}

/// Ordered move list with bounds checks and nothing else.
#[derive(Debug, Clone, Default)]
pub struct MoveHistory {
    width: u32,
    height: u32,
    moves: Vec<Move>,
}

impl MoveHistory {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            moves: Vec::new(),
        }
    }

    fn check_bounds(&self, mv: Move) -> Result<(), MoveError> {
        match mv {
            Move::Stone(point) if point.column >= self.width || point.row >= self.height => {
                Err(MoveError::OutOfBounds {
                    point,
                    width: self.width,
                    height: self.height,
                })
            }
            _ => Ok(()),
        }
    }
}

impl RulesEngine for MoveHistory {
    fn apply_move(&mut self, record: MoveRecord) -> Result<(), MoveError> {
        let expected = self.move_count() + 1;
        if record.number != expected {
            return Err(MoveError::MoveCountMismatch {
                expected,
                got: record.number,
            });
        }
        self.check_bounds(record.mv)?;
        self.moves.push(record.mv);
        Ok(())
    }

    fn undo_to(&mut self, move_number: u32) {
        self.moves.truncate(move_number as usize);
    }

    fn replace_full_state(&mut self, snapshot: &GameSnapshot) -> Result<(), MoveError> {
        let mut rebuilt = MoveHistory::new(snapshot.width, snapshot.height);
        for mv in snapshot.decoded_moves()? {
            rebuilt.check_bounds(mv)?;
            rebuilt.moves.push(mv);
        }
        *self = rebuilt;
        Ok(())
    }

    fn move_count(&self) -> u32 {
        self.moves.len() as u32
    }

    fn moves(&self) -> &[Move] {
        &self.moves
    }
}

/// Local view of one match.
#[derive(Debug)]
pub struct MatchState {
    /// Server match ID
    pub id: GameId,
    /// Display name, empty until a summary or snapshot names it
    pub name: String,
    /// Board columns
    pub width: u32,
    /// Board rows
    pub height: u32,
    pub players: Players,
    pub phase: GamePhase,
    /// Result text once the server declares one
    pub outcome: Option<String>,
    /// Rules used to count the clock down locally
    pub time_control: TimeControlSystem,
    /// Move number the opponent asked to undo back to, until accepted.
    pub undo_requested_at: Option<u32>,
    /// Countdown as of the last tick.
    pub clock_display: Option<ClockDisplay>,
    snapshot: Option<GameSnapshot>,
    clock: Option<ClockSnapshot>,
    engine: Box<dyn RulesEngine>,
    /// When this local state was created
    pub created_at: DateTime<Utc>,
    /// Last time any update was applied
    pub updated_at: DateTime<Utc>,
}

impl MatchState {
    /// Blank match with no moves, players, or clock.
    pub fn new(id: GameId, width: u32, height: u32, engine: Box<dyn RulesEngine>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: String::new(),
            width,
            height,
            players: Players::default(),
            phase: GamePhase::Play,
            outcome: None,
            time_control: TimeControlSystem::None,
            undo_requested_at: None,
            clock_display: None,
            snapshot: None,
            clock: None,
            engine,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_players(mut self, name: impl Into<String>, players: Players) -> Self {
        self.name = name.into();
        self.players = players;
        self
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Replace everything with the server's snapshot.
    pub fn replace_full_state(&mut self, snapshot: GameSnapshot) -> Result<(), MoveError> {
        self.engine.replace_full_state(&snapshot)?;
        self.name = snapshot.game_name.clone();
        self.width = snapshot.width;
        self.height = snapshot.height;
        self.players = snapshot.players.clone();
        self.phase = snapshot.phase;
        self.outcome = snapshot.outcome.clone().filter(|o| !o.is_empty());
        self.time_control = snapshot.time_control.system;
        self.undo_requested_at = snapshot.undo_requested;
        self.clock = snapshot.clock.clone();
        self.snapshot = Some(snapshot);
        self.touch();
        Ok(())
    }

    /// Append one move. Clears any pending undo request.
    pub fn apply_move(&mut self, record: MoveRecord) -> Result<(), MoveError> {
        self.engine.apply_move(record)?;
        self.undo_requested_at = None;
        self.touch();
        Ok(())
    }

    /// Revert to `move_number` moves after an accepted undo.
    pub fn undo_to(&mut self, move_number: u32) {
        self.engine.undo_to(move_number);
        self.undo_requested_at = None;
        self.touch();
    }

    /// Record an undo request without touching the history.
    pub fn request_undo(&mut self, move_number: u32) {
        self.undo_requested_at = Some(move_number);
        self.touch();
    }

    /// Replace the clock snapshot outright.
    pub fn replace_clock(&mut self, clock: ClockSnapshot) {
        self.clock = Some(clock);
        self.touch();
    }

    /// Recompute the displayed countdown for `server_now_ms`.
    pub fn refresh_clock_display(&mut self, server_now_ms: f64) {
        self.clock_display = self
            .clock
            .as_ref()
            .map(|clock| clock.display_at(self.time_control, server_now_ms));
    }

    /// Last full snapshot received, if any.
    pub fn snapshot(&self) -> Option<&GameSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn clock(&self) -> Option<&ClockSnapshot> {
        self.clock.as_ref()
    }

    pub fn move_count(&self) -> u32 {
        self.engine.move_count()
    }

    pub fn moves(&self) -> &[Move] {
        self.engine.moves()
    }

    pub fn is_final(&self) -> bool {
        self.outcome.is_some() || self.phase == GamePhase::Finished
    }
}

/// Every locally tracked match, with the active/connected indexes over it.
///
/// A match is stored once; both indexes refer to the same entry, so moving
/// a match from active to connected never creates a second instance.
#[derive(Debug, Default)]
pub struct MatchStore {
    matches: HashMap<GameId, MatchState>,
    /// Discovered through summaries
    active: HashSet<GameId>,
    /// Subscribed with live handlers
    connected: HashSet<GameId>,
}

impl MatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless a match with this ID already exists.
    /// Returns whether the state was inserted.
    pub fn insert(&mut self, state: MatchState) -> bool {
        if self.matches.contains_key(&state.id) {
            return false;
        }
        self.matches.insert(state.id, state);
        true
    }

    /// Get the match, creating it with `create` if missing.
    pub fn get_or_insert_with(
        &mut self,
        id: GameId,
        create: impl FnOnce() -> MatchState,
    ) -> &mut MatchState {
        self.matches.entry(id).or_insert_with(create)
    }

    pub fn get(&self, id: GameId) -> Option<&MatchState> {
        self.matches.get(&id)
    }

    pub fn get_mut(&mut self, id: GameId) -> Option<&mut MatchState> {
        self.matches.get_mut(&id)
    }

    pub fn contains(&self, id: GameId) -> bool {
        self.matches.contains_key(&id)
    }

    /// Add to the active set. Ignored if the match is not stored.
    pub fn mark_active(&mut self, id: GameId) {
        if self.matches.contains_key(&id) {
            self.active.insert(id);
        }
    }

    pub fn is_active(&self, id: GameId) -> bool {
        self.active.contains(&id)
    }

    /// Add to the connected set. Ignored if the match is not stored.
    pub fn mark_connected(&mut self, id: GameId) {
        if self.matches.contains_key(&id) {
            self.connected.insert(id);
        }
    }

    pub fn unmark_connected(&mut self, id: GameId) {
        self.connected.remove(&id);
    }

    pub fn is_connected(&self, id: GameId) -> bool {
        self.connected.contains(&id)
    }

    /// Connected match IDs in ascending order.
    pub fn connected_ids(&self) -> Vec<GameId> {
        let mut ids: Vec<GameId> = self.connected.iter().copied().collect();
        ids.sort();
        ids
    }

    /// Active match IDs in ascending order.
    pub fn active_ids(&self) -> Vec<GameId> {
        let mut ids: Vec<GameId> = self.active.iter().copied().collect();
        ids.sort();
        ids
    }

    /// Mutable access to every connected match.
    pub fn connected_mut(&mut self) -> impl Iterator<Item = &mut MatchState> {
        let connected = &self.connected;
        self.matches
            .values_mut()
            .filter(move |m| connected.contains(&m.id))
    }

    /// Drop a match from both indexes and destroy its state.
    pub fn remove(&mut self, id: GameId) -> Option<MatchState> {
        self.active.remove(&id);
        self.connected.remove(&id);
        self.matches.remove(&id)
    }

    pub fn count(&self) -> usize {
        self.matches.len()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn blank(id: i64) -> MatchState {
        MatchState::new(GameId(id), 19, 19, Box::new(MoveHistory::new(19, 19)))
    }

    fn snapshot_json(moves: serde_json::Value) -> GameSnapshot {
        serde_json::from_value(serde_json::json!({
            "game_id": 3,
            "game_name": "Friendly",
            "width": 9,
            "height": 9,
            "players": {
                "black": {"id": 10, "username": "kuro"},
                "white": {"id": 20, "username": "shiro"}
            },
            "moves": moves,
            "time_control": {"system": "byoyomi", "main_time": 600}
        }))
        .unwrap()
    }

    #[test]
    fn test_wire_coordinates_are_swapped() {
        assert_eq!(Move::from_wire(-1, -1), Ok(Move::Pass));
        assert_eq!(Move::from_wire(3, 4), Ok(Move::Stone(Point::new(4, 3))));
        assert_eq!(Move::Stone(Point::new(4, 3)).to_wire(), [3, 4]);
        assert_eq!(Move::from_wire(-1, 2), Err(MoveError::InvalidCoordinate(-1, 2)));
    }

    #[test]
    fn test_move_history_rejects_count_mismatch() {
        let mut history = MoveHistory::new(9, 9);
        history
            .apply_move(MoveRecord { number: 1, mv: Move::Pass })
            .unwrap();

        let err = history
            .apply_move(MoveRecord { number: 3, mv: Move::Pass })
            .unwrap_err();
        assert_eq!(err, MoveError::MoveCountMismatch { expected: 2, got: 3 });
        assert_eq!(history.move_count(), 1);
    }

    #[test]
    fn test_move_history_bounds() {
        let mut history = MoveHistory::new(9, 9);
        let err = history
            .apply_move(MoveRecord {
                number: 1,
                mv: Move::Stone(Point::new(9, 0)),
            })
            .unwrap_err();
        assert!(matches!(err, MoveError::OutOfBounds { .. }));
    }

    #[test]
    fn test_replace_full_state() {
        let mut state = blank(3);
        state
            .replace_full_state(snapshot_json(serde_json::json!([[2, 3, 1.5], [-1, -1]])))
            .unwrap();

        assert_eq!(state.width, 9);
        assert_eq!(state.name, "Friendly");
        assert_eq!(state.players.white.username, "shiro");
        assert_eq!(state.time_control, TimeControlSystem::Byoyomi);
        assert_eq!(state.moves(), &[Move::Stone(Point::new(3, 2)), Move::Pass]);
        assert!(!state.is_final());
    }

    #[test]
    fn test_undo_flow() {
        let mut state = blank(1);
        for number in 1..=4 {
            state
                .apply_move(MoveRecord { number, mv: Move::Pass })
                .unwrap();
        }

        state.request_undo(3);
        assert_eq!(state.undo_requested_at, Some(3));
        assert_eq!(state.move_count(), 4);

        state.undo_to(3);
        assert_eq!(state.move_count(), 3);
        assert_eq!(state.undo_requested_at, None);
    }

    #[test]
    fn test_snapshot_outcome() {
        let mut snap = snapshot_json(serde_json::json!([]));
        assert!(!snap.is_final());
        snap.outcome = Some(String::new());
        assert!(!snap.is_final());
        snap.outcome = Some("Resignation".to_string());
        assert!(snap.is_final());
    }

    #[test]
    fn test_store_promotion_reuses_instance() {
        let mut store = MatchStore::new();
        assert!(store.insert(blank(5)));
        store.mark_active(GameId(5));
        store.get_mut(GameId(5)).unwrap().request_undo(2);

        // second insert for the same id is refused
        assert!(!store.insert(blank(5)));

        store.mark_connected(GameId(5));
        assert!(store.is_active(GameId(5)));
        assert!(store.is_connected(GameId(5)));
        assert_eq!(store.count(), 1);
        assert_eq!(store.get(GameId(5)).unwrap().undo_requested_at, Some(2));
    }

    #[test]
    fn test_store_remove_clears_indexes() {
        let mut store = MatchStore::new();
        store.insert(blank(1));
        store.insert(blank(2));
        store.mark_active(GameId(1));
        store.mark_connected(GameId(1));
        store.mark_connected(GameId(2));

        assert!(store.remove(GameId(1)).is_some());

        assert!(!store.is_active(GameId(1)));
        assert_eq!(store.connected_ids(), vec![GameId(2)]);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_mark_requires_state() {
        let mut store = MatchStore::new();
        store.mark_connected(GameId(9));
        assert!(!store.is_connected(GameId(9)));
    }
}
