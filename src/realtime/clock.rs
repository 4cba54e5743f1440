//! Time sources and game clock countdown rules.
//!
//! The server only sends clock snapshots when something changes (a move, a
//! pause, a period being consumed). Between snapshots the displayed clock is
//! recomputed locally from the snapshot, the time-control system, and the
//! current server-relative time.

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::game::GameId;

/// Source of "now", in milliseconds since the Unix epoch.
pub trait TimeSource: Send + Sync + fmt::Debug {
    fn now_ms(&self) -> f64;
}

/// Wall clock backed by `chrono::Utc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now_ms(&self) -> f64 {
        chrono::Utc::now().timestamp_millis() as f64
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new(start_ms: f64) -> Self {
        Self {
            now: Mutex::new(start_ms),
        }
    }

    pub fn set(&self, ms: f64) {
        *self.now.lock() = ms;
    }

    pub fn advance(&self, ms: f64) {
        *self.now.lock() += ms;
    }
}

impl TimeSource for ManualClock {
    fn now_ms(&self) -> f64 {
        *self.now.lock()
    }
}

/// Time-control system of a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeControlSystem {
    Fischer,
    Byoyomi,
    Canadian,
    Simple,
    Absolute,
    #[default]
    None,
}

impl TimeControlSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fischer => "fischer",
            Self::Byoyomi => "byoyomi",
            Self::Canadian => "canadian",
            Self::Simple => "simple",
            Self::Absolute => "absolute",
            Self::None => "none",
        }
    }
}

/// Board side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Black,
    White,
}

/// Remaining time for one side, as last reported by the server.
///
/// Times are in seconds. Simple and absolute clocks arrive on the wire as a
/// bare number and are normalized into `thinking_time`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "WirePlayerClock")]
pub struct PlayerClock {
    pub thinking_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub periods: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moves_left: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_time: Option<f64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WirePlayerClock {
    Seconds(f64),
    Detailed {
        #[serde(default)]
        thinking_time: f64,
        #[serde(default)]
        periods: Option<u32>,
        #[serde(default)]
        period_time: Option<f64>,
        #[serde(default)]
        moves_left: Option<u32>,
        #[serde(default)]
        block_time: Option<f64>,
    },
}

impl From<WirePlayerClock> for PlayerClock {
    fn from(wire: WirePlayerClock) -> Self {
        match wire {
            WirePlayerClock::Seconds(thinking_time) => Self {
                thinking_time,
                ..Default::default()
            },
            WirePlayerClock::Detailed {
                thinking_time,
                periods,
                period_time,
                moves_left,
                block_time,
            } => Self {
                thinking_time,
                periods,
                period_time,
                moves_left,
                block_time,
            },
        }
    }
}

/// Clock snapshot as pushed on `game/{id}/clock` or embedded in a full sync.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClockSnapshot {
    #[serde(default)]
    pub game_id: GameId,
    /// Player ID of the side to move.
    pub current_player: i64,
    #[serde(default)]
    pub black_player_id: i64,
    #[serde(default)]
    pub white_player_id: i64,
    /// Server time (ms) at which the current turn started.
    pub last_move: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_since: Option<f64>,
    pub black_time: PlayerClock,
    pub white_time: PlayerClock,
}

/// Locally computed view of one side's clock.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SideDisplay {
    /// Main time left, in seconds.
    pub main_time: f64,
    pub periods_left: Option<u32>,
    /// Time left in the current byo-yomi period or Canadian block.
    pub period_remaining: Option<f64>,
    pub moves_left: Option<u32>,
    pub timed_out: bool,
}

/// Locally computed view of both clocks.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClockDisplay {
    pub black: SideDisplay,
    pub white: SideDisplay,
    pub to_move: Option<Side>,
    pub paused: bool,
}

impl ClockSnapshot {
    /// Which side is on the move, if `current_player` matches either player.
    pub fn to_move(&self) -> Option<Side> {
        if self.current_player == self.black_player_id {
            Some(Side::Black)
        } else if self.current_player == self.white_player_id {
            Some(Side::White)
        } else {
            None
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_since.is_some()
    }

    /// Compute the clocks as they should read at `server_now_ms`.
    pub fn display_at(&self, system: TimeControlSystem, server_now_ms: f64) -> ClockDisplay {
        let to_move = self.to_move();
        let elapsed = if self.is_paused() {
            0.0
        } else {
            ((server_now_ms - self.last_move) / 1000.0).max(0.0)
        };

        let side = |clock: &PlayerClock, side: Side| {
            if to_move == Some(side) {
                countdown(system, clock, elapsed)
            } else {
                countdown(system, clock, 0.0)
            }
        };

        ClockDisplay {
            black: side(&self.black_time, Side::Black),
            white: side(&self.white_time, Side::White),
            to_move,
            paused: self.is_paused(),
        }
    }
}

/// Apply `elapsed` seconds of thinking to a player's clock.
pub fn countdown(system: TimeControlSystem, clock: &PlayerClock, elapsed: f64) -> SideDisplay {
    let untouched = SideDisplay {
        main_time: clock.thinking_time,
        periods_left: clock.periods,
        period_remaining: clock.period_time.or(clock.block_time),
        moves_left: clock.moves_left,
        timed_out: false,
    };

    if system == TimeControlSystem::None || elapsed <= 0.0 {
        return untouched;
    }

    let main = clock.thinking_time - elapsed;
    if main > 0.0 {
        return SideDisplay {
            main_time: main,
            ..untouched
        };
    }
    let overtime = -main;

    let expired = SideDisplay {
        main_time: 0.0,
        periods_left: clock.periods.map(|_| 0),
        period_remaining: untouched.period_remaining.map(|_| 0.0),
        moves_left: clock.moves_left,
        timed_out: true,
    };

    match system {
        TimeControlSystem::Byoyomi => {
            let (Some(periods), Some(period_time)) = (clock.periods, clock.period_time) else {
                return expired;
            };
            if period_time <= 0.0 {
                return expired;
            }
            let used = (overtime / period_time).floor();
            if used >= f64::from(periods) {
                return expired;
            }
            SideDisplay {
                main_time: 0.0,
                periods_left: Some(periods - used as u32),
                period_remaining: Some(period_time - (overtime - used * period_time)),
                moves_left: None,
                timed_out: false,
            }
        }
        TimeControlSystem::Canadian => {
            let Some(block_time) = clock.block_time else {
                return expired;
            };
            let left = block_time - overtime;
            if left <= 0.0 {
                return expired;
            }
            SideDisplay {
                main_time: 0.0,
                periods_left: None,
                period_remaining: Some(left),
                moves_left: clock.moves_left,
                timed_out: false,
            }
        }
        _ => expired,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn snapshot(black: PlayerClock, white: PlayerClock) -> ClockSnapshot {
        ClockSnapshot {
            game_id: GameId(1),
            current_player: 10,
            black_player_id: 10,
            white_player_id: 20,
            last_move: 1_000_000.0,
            black_time: black,
            white_time: white,
            ..Default::default()
        }
    }

    fn byoyomi(thinking_time: f64, periods: u32, period_time: f64) -> PlayerClock {
        PlayerClock {
            thinking_time,
            periods: Some(periods),
            period_time: Some(period_time),
            ..Default::default()
        }
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100.0);
        clock.advance(50.0);
        assert_eq!(clock.now_ms(), 150.0);
        clock.set(10.0);
        assert_eq!(clock.now_ms(), 10.0);
    }

    #[test]
    fn test_only_side_to_move_counts_down() {
        let snap = snapshot(byoyomi(60.0, 5, 30.0), byoyomi(60.0, 5, 30.0));
        let display = snap.display_at(TimeControlSystem::Byoyomi, 1_010_000.0);

        assert_eq!(display.to_move, Some(Side::Black));
        assert_eq!(display.black.main_time, 50.0);
        assert_eq!(display.white.main_time, 60.0);
    }

    #[test]
    fn test_byoyomi_consumes_whole_periods() {
        let snap = snapshot(byoyomi(10.0, 3, 30.0), byoyomi(60.0, 3, 30.0));
        // 10s main + 45s overtime: one full period gone, 15s into the second
        let display = snap.display_at(TimeControlSystem::Byoyomi, 1_055_000.0);

        assert_eq!(display.black.main_time, 0.0);
        assert_eq!(display.black.periods_left, Some(2));
        assert_eq!(display.black.period_remaining, Some(15.0));
        assert!(!display.black.timed_out);
    }

    #[test]
    fn test_byoyomi_timeout() {
        let snap = snapshot(byoyomi(10.0, 2, 30.0), byoyomi(60.0, 2, 30.0));
        let display = snap.display_at(TimeControlSystem::Byoyomi, 1_071_000.0);

        assert!(display.black.timed_out);
        assert_eq!(display.black.periods_left, Some(0));
    }

    #[test]
    fn test_canadian_block() {
        let canadian = PlayerClock {
            thinking_time: 0.0,
            moves_left: Some(10),
            block_time: Some(300.0),
            ..Default::default()
        };
        let snap = snapshot(canadian.clone(), canadian);
        let display = snap.display_at(TimeControlSystem::Canadian, 1_100_000.0);

        assert_eq!(display.black.period_remaining, Some(200.0));
        assert_eq!(display.black.moves_left, Some(10));
        assert!(!display.black.timed_out);
    }

    #[test]
    fn test_fischer_times_out_at_zero() {
        let fischer = PlayerClock {
            thinking_time: 5.0,
            ..Default::default()
        };
        let snap = snapshot(fischer.clone(), fischer);
        let display = snap.display_at(TimeControlSystem::Fischer, 1_006_000.0);

        assert!(display.black.timed_out);
        assert_eq!(display.black.main_time, 0.0);
        assert!(!display.white.timed_out);
    }

    #[test]
    fn test_paused_clock_does_not_advance() {
        let mut snap = snapshot(byoyomi(60.0, 5, 30.0), byoyomi(60.0, 5, 30.0));
        snap.paused_since = Some(1_000_500.0);
        let display = snap.display_at(TimeControlSystem::Byoyomi, 1_050_000.0);

        assert!(display.paused);
        assert_eq!(display.black.main_time, 60.0);
    }

    #[test]
    fn test_untimed_game_never_counts_down() {
        let snap = snapshot(PlayerClock::default(), PlayerClock::default());
        let display = snap.display_at(TimeControlSystem::None, 9_000_000.0);
        assert!(!display.black.timed_out);
    }

    #[test]
    fn test_decode_wire_clock() {
        let snap: ClockSnapshot = serde_json::from_value(serde_json::json!({
            "game_id": 7,
            "current_player": 20,
            "black_player_id": 10,
            "white_player_id": 20,
            "last_move": 1234.0,
            "black_time": 300,
            "white_time": {"thinking_time": 120.5, "periods": 3, "period_time": 30}
        }))
        .unwrap();

        assert_eq!(snap.game_id, GameId(7));
        assert_eq!(snap.to_move(), Some(Side::White));
        assert_eq!(snap.black_time.thinking_time, 300.0);
        assert_eq!(snap.white_time.periods, Some(3));
        assert_eq!(snap.white_time.period_time, Some(30.0));
    }
}
