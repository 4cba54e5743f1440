//! Subscription bookkeeping.
//!
//! A match is subscribed exactly when its five per-match handlers are in the
//! [`HandlerTable`]. Subscribing registers all of them, unsubscribing removes
//! all of them, so repeated cycles on the same match never leak handlers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::game::GameId;
use super::protocol::{events, to_value, GameConnect, GameDisconnect, MessageKind};
use super::transport::Transport;

/// Opaque handle for one registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerToken(u64);

/// Where an inbound event gets routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handler {
    pub token: HandlerToken,
    /// Match the event belongs to
    pub game_id: GameId,
    /// Which per-match message this handles
    pub kind: MessageKind,
}

/// Per-match handlers registered on the shared connection, keyed by event name.
#[derive(Debug, Default)]
pub struct HandlerTable {
    by_event: HashMap<String, Handler>,
    next_token: u64,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `game/{game_id}/{kind}`.
    pub fn register(&mut self, game_id: GameId, kind: MessageKind) -> HandlerToken {
        self.next_token += 1;
        let token = HandlerToken(self.next_token);
        self.by_event.insert(
            kind.channel(game_id),
            Handler {
                token,
                game_id,
                kind,
            },
        );
        token
    }

    /// Remove the handler with `token`. Returns whether it was registered.
    pub fn deregister(&mut self, token: HandlerToken) -> bool {
        let before = self.by_event.len();
        self.by_event.retain(|_, h| h.token != token);
        self.by_event.len() != before
    }

    /// Handler for an exact event name.
    pub fn lookup(&self, event: &str) -> Option<&Handler> {
        self.by_event.get(event)
    }

    /// Number of handlers registered for `game_id`.
    pub fn count_for(&self, game_id: GameId) -> usize {
        self.by_event
            .values()
            .filter(|h| h.game_id == game_id)
            .count()
    }

    pub fn len(&self) -> usize {
        self.by_event.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_event.is_empty()
    }
}

/// A live subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub game_id: GameId,
    /// One token per message kind
    pub tokens: Vec<HandlerToken>,
    /// When `game/connect` was sent
    pub subscribed_at: DateTime<Utc>,
}

/// Result of a subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed,
    AlreadySubscribed,
    /// Nothing was sent; retry on the next connect.
    NotConnected,
}

/// Subscribed matches and the handler table they own.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    transport: Arc<dyn Transport>,
    subscriptions: HashMap<GameId, Subscription>,
    handlers: HandlerTable,
}

impl SubscriptionRegistry {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            subscriptions: HashMap::new(),
            handlers: HandlerTable::new(),
        }
    }

    pub fn is_subscribed(&self, game_id: GameId) -> bool {
        self.subscriptions.contains_key(&game_id)
    }

    /// Send `game/connect` and register handlers for `game_id`.
    pub fn subscribe(
        &mut self,
        game_id: GameId,
        player_id: Option<i64>,
        connected: bool,
    ) -> SubscribeOutcome {
        if self.is_subscribed(game_id) {
            return SubscribeOutcome::AlreadySubscribed;
        }
        if !connected {
            return SubscribeOutcome::NotConnected;
        }

        let payload = GameConnect {
            game_id,
            player_id,
            chat: false,
        };
        if let Err(e) = self
            .transport
            .emit(events::GAME_CONNECT, to_value(&payload), None)
        {
            warn!(%game_id, error = %e, "game/connect not sent");
            return SubscribeOutcome::NotConnected;
        }

        let tokens = MessageKind::ALL
            .iter()
            .map(|kind| self.handlers.register(game_id, *kind))
            .collect();
        self.subscriptions.insert(
            game_id,
            Subscription {
                game_id,
                tokens,
                subscribed_at: Utc::now(),
            },
        );
        info!(%game_id, "subscribed");
        SubscribeOutcome::Subscribed
    }

    /// Send `game/disconnect` and drop every handler for `game_id`.
    /// Returns `false` if it was not subscribed.
    pub fn unsubscribe(&mut self, game_id: GameId, connected: bool) -> bool {
        let Some(subscription) = self.subscriptions.remove(&game_id) else {
            return false;
        };

        if connected {
            let payload = GameDisconnect { game_id };
            if let Err(e) = self
                .transport
                .emit(events::GAME_DISCONNECT, to_value(&payload), None)
            {
                warn!(%game_id, error = %e, "game/disconnect not sent");
            }
        }

        for token in subscription.tokens {
            self.handlers.deregister(token);
        }
        info!(%game_id, "unsubscribed");
        true
    }

    /// Forget every subscription without touching the wire.
    ///
    /// Used after a reconnect, when the server has already dropped the old
    /// connection's subscriptions. Returns the IDs that were subscribed.
    pub fn clear(&mut self) -> Vec<GameId> {
        let mut ids: Vec<GameId> = self.subscriptions.keys().copied().collect();
        ids.sort();
        for (_, subscription) in self.subscriptions.drain() {
            for token in subscription.tokens {
                self.handlers.deregister(token);
            }
        }
        ids
    }

    /// Find the handler registered for an inbound event name.
    pub fn route(&self, event: &str) -> Option<Handler> {
        self.handlers.lookup(event).copied()
    }

    pub fn get(&self, game_id: GameId) -> Option<&Subscription> {
        self.subscriptions.get(&game_id)
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub fn subscribed_ids(&self) -> Vec<GameId> {
        let mut ids: Vec<GameId> = self.subscriptions.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
