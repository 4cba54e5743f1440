//! Notifications for whatever presents the synchronized state.
//!
//! Events only say *what* changed; read the current values back through
//! [`SyncClient`](super::client::SyncClient).

use super::connection::ConnectionState;
use super::drift::DriftEstimate;
use super::game::GameId;
use super::protocol::MessageKind;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ConnectionChanged(ConnectionState),
    DriftUpdated(DriftEstimate),
    /// A summary introduced a new active match.
    MatchTracked(GameId),
    MatchUpdated { game_id: GameId, kind: MessageKind },
    /// The server reported a final result. Followed by `MatchRemoved`.
    MatchFinished {
        game_id: GameId,
        outcome: Option<String>,
    },
    MatchRemoved(GameId),
    /// Displayed clocks of connected matches were recomputed.
    ClocksTicked,
}
