//! Wire protocol: event names, payload shapes, and frame encoding.
//!
//! All payloads are JSON objects with snake_case keys. Where the wire name
//! doesn't read well in Rust (`move`, `where`) serde renames it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::SyncError;
use super::game::{GameId, GamePhase, PlayerInfo};
use super::transport::{AckId, TransportError};

/// Outbound and connection-scoped event names.
pub mod events {
    pub const GAME_CONNECT: &str = "game/connect";
    pub const GAME_DISCONNECT: &str = "game/disconnect";
    pub const GAME_MOVE: &str = "game/move";
    pub const GAME_RESIGN: &str = "game/resign";
    pub const UNDO_REQUEST: &str = "game/undo/request";
    pub const UNDO_ACCEPT: &str = "game/undo/accept";
    pub const REMOVED_STONES_SET: &str = "game/removed_stones/set";
    pub const NOTIFICATION_CONNECT: &str = "notification/connect";
    pub const AUTHENTICATE: &str = "authenticate";
    pub const GAMELIST_QUERY: &str = "gamelist/query";
    pub const PING: &str = "net/ping";
    pub const PONG: &str = "net/pong";
    pub const ACTIVE_GAME: &str = "active_game";
}

/// Per-match inbound message kinds, each delivered on `game/{id}/{kind}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    GameData,
    Move,
    Clock,
    UndoAccepted,
    UndoRequested,
}

impl MessageKind {
    pub const ALL: [MessageKind; 5] = [
        Self::GameData,
        Self::Move,
        Self::Clock,
        Self::UndoAccepted,
        Self::UndoRequested,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GameData => "gamedata",
            Self::Move => "move",
            Self::Clock => "clock",
            Self::UndoAccepted => "undo_accepted",
            Self::UndoRequested => "undo_requested",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }

    /// Event name this kind is delivered on for `game_id`.
    pub fn channel(&self, game_id: GameId) -> String {
        format!("game/{}/{}", game_id, self.as_str())
    }

    /// Split `game/{id}/{kind}` back into its parts.
    pub fn parse_channel(event: &str) -> Option<(GameId, Self)> {
        let rest = event.strip_prefix("game/")?;
        let (id, kind) = rest.split_once('/')?;
        let id = id.parse::<i64>().ok()?;
        Some((GameId(id), Self::parse(kind)?))
    }
}

/// Decode `data` into `T`, tagging failures with the event name.
pub fn decode<T: DeserializeOwned>(event: &str, data: Value) -> Result<T, SyncError> {
    serde_json::from_value(data).map_err(|e| SyncError::decode(event, e))
}

// Inbound payloads

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MovePayload {
    pub game_id: GameId,
    #[serde(default)]
    pub move_number: Option<u32>,
    /// `[row, column, seconds_taken?]`
    #[serde(rename = "move")]
    pub coords: Vec<f64>,
}

/// Undo notifications carry a move number, bare or wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum UndoPayload {
    MoveNumber(u32),
    Wrapped { move_number: u32 },
}

impl UndoPayload {
    pub fn move_number(&self) -> u32 {
        match self {
            Self::MoveNumber(n) | Self::Wrapped { move_number: n } => *n,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PongPayload {
    /// Client time echoed back from the ping.
    pub client: f64,
    pub server: f64,
}

/// Lightweight listing entry pushed on `active_game`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ActiveGameSummary {
    pub id: GameId,
    #[serde(default)]
    pub name: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub phase: GamePhase,
    #[serde(default)]
    pub black: PlayerInfo,
    #[serde(default)]
    pub white: PlayerInfo,
    #[serde(default)]
    pub player_to_move: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GameListPage {
    pub list: String,
    pub by: String,
    pub size: u32,
    pub from: u32,
    pub limit: u32,
    #[serde(default)]
    pub results: Vec<Value>,
}

// Outbound payloads

#[derive(Debug, Clone, Serialize)]
pub struct GameConnect {
    pub game_id: GameId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_id: Option<i64>,
    pub chat: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GameDisconnect {
    pub game_id: GameId,
}

#[derive(Debug, Clone, Serialize)]
pub struct MoveCommand {
    pub game_id: GameId,
    pub player_id: i64,
    #[serde(rename = "move")]
    pub coords: [i64; 2],
}

#[derive(Debug, Clone, Serialize)]
pub struct ResignCommand {
    pub game_id: GameId,
    pub player_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UndoCommand {
    pub game_id: GameId,
    pub player_id: i64,
    pub move_number: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemovedStonesCommand {
    pub game_id: GameId,
    pub player_id: i64,
    pub removed: bool,
    pub stones: Vec<[i64; 2]>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationConnect {
    pub player_id: i64,
    pub username: String,
    pub auth: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Authenticate {
    pub player_id: i64,
    pub username: String,
    pub auth: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Ping {
    pub client: f64,
    pub drift: f64,
    pub latency: f64,
}

/// Which game listing to page through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GameList {
    #[default]
    Live,
    Corr,
    Kibitz,
}

#[derive(Debug, Clone, Serialize)]
pub struct GameListQuery {
    pub list: GameList,
    pub sort_by: String,
    pub from: u32,
    pub limit: u32,
    #[serde(rename = "where")]
    pub filter: serde_json::Map<String, Value>,
}

impl GameListQuery {
    pub fn new(list: GameList, from: u32, limit: u32) -> Self {
        Self {
            list,
            sort_by: "rank".to_string(),
            from,
            limit,
            filter: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn sorted_by(mut self, key: impl Into<String>) -> Self {
        self.sort_by = key.into();
        self
    }
}

/// Serialize an outbound payload. Plain structs never fail here.
pub fn to_value<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

/// One text frame on the socket.
///
/// Events are `[event, data]` or `[event, data, ack_id]`;
/// acknowledgments are `["ack", ack_id, data]`.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event {
        event: String,
        data: Value,
        ack: Option<AckId>,
    },
    Ack {
        id: AckId,
        data: Value,
    },
}

const ACK_TAG: &str = "ack";

impl Frame {
    pub fn encode(&self) -> String {
        let array = match self {
            Self::Event {
                event,
                data,
                ack: None,
            } => serde_json::json!([event, data]),
            Self::Event {
                event,
                data,
                ack: Some(id),
            } => serde_json::json!([event, data, id]),
            Self::Ack { id, data } => serde_json::json!([ACK_TAG, id, data]),
        };
        array.to_string()
    }

    pub fn decode(text: &str) -> Result<Self, TransportError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| TransportError::InvalidFrame(e.to_string()))?;
        let Value::Array(parts) = value else {
            return Err(TransportError::InvalidFrame("frame is not an array".into()));
        };
        if parts.is_empty() {
            return Err(TransportError::InvalidFrame("empty frame".into()));
        }
        let mut parts = parts.into_iter();

        let Some(Value::String(head)) = parts.next() else {
            return Err(TransportError::InvalidFrame("missing event name".into()));
        };

        if head == ACK_TAG {
            let id = parts
                .next()
                .and_then(|v| v.as_u64())
                .ok_or_else(|| TransportError::InvalidFrame("ack without id".into()))?;
            let data = parts.next().unwrap_or(Value::Null);
            return Ok(Self::Ack { id, data });
        }

        let data = parts.next().unwrap_or(Value::Null);
        let ack = parts.next().and_then(|v| v.as_u64());
        Ok(Self::Event {
            event: head,
            data,
            ack,
        })
    }
}
