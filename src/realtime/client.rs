//! The synchronization client.
//!
//! [`SyncCore`] holds every piece of shared state (connection, registry,
//! pending acks, match collections) and is only ever touched through one
//! `parking_lot::Mutex`. Inbound transport events, timer ticks, and caller
//! commands all take that lock, so their mutations are serialized. The lock
//! is never held across an `.await`.
//!
//! [`SyncClient`] is the cloneable handle around it. Its [`run`](SyncClient::run)
//! loop multiplexes the inbound event channel with the probe and countdown
//! timers.
//!
//! ```text
//! TransportEvent ──▶ SyncCore::handle_event ──▶ EventRouter ──▶ MatchStore
//!                          │        │
//!                          │        └── net/pong ──▶ DriftEstimator
//!                          └── ack ──▶ CommandDispatcher ──▶ oneshot waiter
//! probe timer ──▶ send_probe      countdown timer ──▶ tick_clocks
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::clock::{SystemClock, TimeSource};
use super::config::SyncConfig;
use super::connection::{Connection, ConnectionEvent, ConnectionState, Deferred};
use super::dispatcher::{AckWait, CommandDispatcher, Session};
use super::drift::{DriftEstimate, DriftEstimator};
use super::error::{Result, SyncError};
use super::events::SyncEvent;
use super::game::{default_engine_factory, EngineFactory, GameId, MatchState, MatchStore, Move, Point};
use super::protocol::{
    decode, events, to_value, ActiveGameSummary, Authenticate, GameListPage, GameListQuery,
    NotificationConnect, Ping, PongPayload,
};
use super::registry::{Handler, SubscribeOutcome, SubscriptionRegistry};
use super::router::{Applied, EventRouter};
use super::tracker::ActiveMatchTracker;
use super::transport::{AckId, Transport, TransportEvent};

/// How a game-list query got started.
#[derive(Debug)]
pub enum QueryStart {
    Sent(AckWait),
    /// Not connected; resolves on the next connect.
    Deferred(oneshot::Receiver<()>),
}

/// All synchronization state, serialized behind the client's mutex.
pub struct SyncCore {
    config: SyncConfig,
    connection: Connection,
    registry: SubscriptionRegistry,
    dispatcher: CommandDispatcher,
    drift: DriftEstimator,
    router: EventRouter,
    tracker: ActiveMatchTracker,
    matches: MatchStore,
    session: Option<Session>,
    factory: EngineFactory,
    events: broadcast::Sender<SyncEvent>,
}

impl std::fmt::Debug for SyncCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCore")
            .field("state", &self.connection.state())
            .field("subscribed", &self.registry.len())
            .field("matches", &self.matches.count())
            .field("pending_acks", &self.dispatcher.pending_count())
            .finish_non_exhaustive()
    }
}

impl SyncCore {
    /// Build a disconnected core. Observer events go to `events`.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: SyncConfig,
        time: Arc<dyn TimeSource>,
        factory: EngineFactory,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        let connection = Connection::new(transport);
        Self {
            registry: SubscriptionRegistry::new(connection.transport()),
            dispatcher: CommandDispatcher::new(connection.transport()),
            drift: DriftEstimator::new(time),
            router: EventRouter::new(),
            tracker: ActiveMatchTracker::new(Arc::clone(&factory)),
            matches: MatchStore::new(),
            session: None,
            config,
            connection,
            factory,
            events,
        }
    }

    fn notify(&self, event: SyncEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    fn user_id(&self) -> Option<i64> {
        self.session.as_ref().map(|s| s.user_id)
    }

    // Connection lifecycle

    /// Open the transport unless it is already connecting or connected.
    pub fn connect(&mut self) -> bool {
        let opened = self.connection.open();
        if opened {
            self.notify(SyncEvent::ConnectionChanged(self.connection.state()));
        } else {
            debug!(state = %self.connection.state(), "connect ignored");
        }
        opened
    }

    /// Close the transport and stop its retries, in any state. Pending
    /// acknowledgments fail; subscriptions are kept and replayed on the
    /// next connect. Returns `false` if nothing was open.
    pub fn disconnect(&mut self) -> bool {
        let previous = self.connection.state();
        if !self.connection.close() {
            debug!(state = %previous, "disconnect ignored");
            return false;
        }
        self.dispatcher.abandon_all();
        if previous != self.connection.state() {
            self.notify(SyncEvent::ConnectionChanged(self.connection.state()));
        }
        true
    }

    /// Set or clear the logged-in session. While connected, a new session
    /// is authenticated right away.
    pub fn set_session(&mut self, session: Option<Session>) {
        self.session = session;
        if self.connection.is_connected() {
            self.authenticate();
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Apply one event reported by the transport.
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connecting => {
                self.transition(ConnectionEvent::Attempt);
            }
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::Disconnected { reason } => {
                info!(%reason, "transport disconnected");
                self.transition(ConnectionEvent::Lost);
                // acks are never answered across a reconnect
                self.dispatcher.abandon_all();
            }
            TransportEvent::Message { event, data } => self.on_message(event, data),
            TransportEvent::Ack { id, data } => {
                self.dispatcher.resolve(id, data);
            }
        }
    }

    /// Returns whether the event was accepted.
    fn transition(&mut self, event: ConnectionEvent) -> bool {
        match self.connection.apply_mut(event) {
            Ok(previous) => {
                if previous != self.connection.state() {
                    self.notify(SyncEvent::ConnectionChanged(self.connection.state()));
                }
                true
            }
            Err(e) => {
                debug!(error = %e, "transport event ignored");
                false
            }
        }
    }

    fn on_connected(&mut self) {
        if !self.transition(ConnectionEvent::Established) {
            return;
        }

        self.send_probe();
        self.authenticate();

        // Start from a clean registry so no handler from the previous
        // transport survives, then resubscribe everything that was live.
        let previously = self.matches.connected_ids();
        self.registry.clear();
        for id in &previously {
            self.matches.unmark_connected(*id);
        }
        info!(count = previously.len(), "resubscribing after connect");
        for id in previously {
            self.subscribe(id);
        }

        for work in self.connection.take_deferred() {
            match work {
                Deferred::Subscribe(id) => self.subscribe(id),
                Deferred::Notify(tx) => {
                    let _ = tx.send(());
                }
            }
        }
    }

    fn authenticate(&self) {
        let Some(session) = &self.session else {
            return;
        };

        let notification = NotificationConnect {
            player_id: session.user_id,
            username: session.username.clone(),
            auth: session.notification_auth.clone(),
        };
        let general = Authenticate {
            player_id: session.user_id,
            username: session.username.clone(),
            auth: session.chat_auth.clone(),
            jwt: session.jwt.clone(),
        };

        for (event, payload) in [
            (events::NOTIFICATION_CONNECT, to_value(&notification)),
            (events::AUTHENTICATE, to_value(&general)),
        ] {
            if let Err(e) = self.dispatcher.send(event, payload) {
                warn!(event, error = %e, "authentication not sent");
            }
        }
    }

    /// Send a drift probe if connected.
    pub fn send_probe(&mut self) {
        if !self.connection.is_connected() {
            return;
        }
        let estimate = self.drift.estimate();
        let ping = Ping {
            client: self.drift.now(),
            drift: estimate.drift,
            latency: estimate.latency,
        };
        if let Err(e) = self.dispatcher.send(events::PING, to_value(&ping)) {
            debug!(error = %e, "probe not sent");
        }
    }

    // Subscriptions

    /// Subscribe to a match, or park the request until the next connect.
    pub fn subscribe(&mut self, game_id: GameId) {
        let connected = self.connection.is_connected();
        match self.registry.subscribe(game_id, self.user_id(), connected) {
            SubscribeOutcome::AlreadySubscribed => {}
            SubscribeOutcome::NotConnected => {
                debug!(%game_id, "subscribe deferred until connected");
                self.connection.defer(Deferred::Subscribe(game_id));
            }
            SubscribeOutcome::Subscribed => {
                let size = self.config.default_board_size;
                let factory = &self.factory;
                self.matches
                    .get_or_insert_with(game_id, || {
                        MatchState::new(game_id, size, size, factory(size, size))
                    });
                self.matches.mark_connected(game_id);
            }
        }
    }

    /// Unsubscribe and destroy the match's local state. A subscribe still
    /// waiting for the next connect is cancelled instead.
    pub fn unsubscribe(&mut self, game_id: GameId) {
        let connected = self.connection.is_connected();
        if !self.registry.unsubscribe(game_id, connected) {
            if self.connection.cancel_deferred_subscribe(game_id) {
                debug!(%game_id, "deferred subscribe cancelled");
            }
            return;
        }
        self.matches.remove(game_id);
        self.notify(SyncEvent::MatchRemoved(game_id));
    }

    // Inbound

    fn on_message(&mut self, event: String, data: Value) {
        if !self.config.is_quiet(&event) {
            debug!(%event, "inbound message");
        }

        match event.as_str() {
            events::PONG => self.on_pong(&event, data),
            events::ACTIVE_GAME => self.on_active_game(&event, data),
            _ => match self.registry.route(&event) {
                Some(handler) => self.route(handler, data),
                None => debug!(%event, "no handler registered"),
            },
        }
    }

    fn route(&mut self, handler: Handler, data: Value) {
        let game_id = handler.game_id;
        match self
            .router
            .apply(&mut self.matches, game_id, handler.kind, data)
        {
            Applied::Updated => self.notify(SyncEvent::MatchUpdated {
                game_id,
                kind: handler.kind,
            }),
            Applied::Concluded { outcome } => {
                info!(%game_id, ?outcome, "game finished");
                self.notify(SyncEvent::MatchFinished { game_id, outcome });
                self.unsubscribe(game_id);
            }
            Applied::Ignored | Applied::Dropped => {}
        }
    }

    fn on_pong(&mut self, event: &str, data: Value) {
        let pong: PongPayload = match decode(event, data) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "probe reply dropped");
                return;
            }
        };
        let estimate = self.drift.record_probe_reply(pong.client, pong.server);
        self.notify(SyncEvent::DriftUpdated(estimate));
    }

    fn on_active_game(&mut self, event: &str, data: Value) {
        let summary: ActiveGameSummary = match decode(event, data) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "active game summary dropped");
                return;
            }
        };
        if let Some(game_id) = self.tracker.on_summary_update(&mut self.matches, &summary) {
            self.notify(SyncEvent::MatchTracked(game_id));
            self.subscribe(game_id);
        }
    }

    /// Recompute the displayed clock of every connected match.
    pub fn tick_clocks(&mut self) {
        if self.matches.connected_count() == 0 {
            return;
        }
        let server_now = self.drift.server_now();
        for state in self.matches.connected_mut() {
            state.refresh_clock_display(server_now);
        }
        self.notify(SyncEvent::ClocksTicked);
    }

    // Outbound

    /// Send `game/move` and register its acknowledgment.
    pub fn submit_move(&mut self, game_id: GameId, mv: Move) -> Result<AckWait> {
        self.dispatcher
            .submit_move(self.session.as_ref(), game_id, mv)
    }

    pub fn resign(&self, game_id: GameId) -> Result<()> {
        self.dispatcher.resign(self.session.as_ref(), game_id)
    }

    pub fn request_undo(&self, game_id: GameId, move_number: u32) -> Result<()> {
        self.dispatcher
            .request_undo(self.session.as_ref(), game_id, move_number)
    }

    pub fn accept_undo(&self, game_id: GameId, move_number: u32) -> Result<()> {
        self.dispatcher
            .accept_undo(self.session.as_ref(), game_id, move_number)
    }

    pub fn set_removed_stones(&self, game_id: GameId, stones: &[Point], removed: bool) -> Result<()> {
        self.dispatcher
            .set_removed_stones(self.session.as_ref(), game_id, stones, removed)
    }

    /// Send `gamelist/query` now, or park until the next connect.
    pub fn begin_game_list_query(&mut self, query: &GameListQuery) -> Result<QueryStart> {
        if self.connection.is_connected() {
            return Ok(QueryStart::Sent(self.dispatcher.query_game_list(query)?));
        }
        let (tx, rx) = oneshot::channel();
        self.connection.defer(Deferred::Notify(tx));
        Ok(QueryStart::Deferred(rx))
    }

    /// Stop waiting for acknowledgment `id`.
    pub fn abandon_ack(&mut self, id: AckId) -> bool {
        self.dispatcher.abandon(id)
    }

    // Accessors

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn drift(&self) -> DriftEstimate {
        self.drift.estimate()
    }

    pub fn matches(&self) -> &MatchStore {
        &self.matches
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Commands still waiting for an acknowledgment.
    pub fn pending_acks(&self) -> usize {
        self.dispatcher.pending_count()
    }

    /// Work parked until the next connect.
    pub fn deferred_count(&self) -> usize {
        self.connection.deferred_count()
    }
}

/// Abandons an acknowledgment wait however it ends: answered, timed out,
/// or dropped by the caller. Abandoning an answered wait is a no-op.
struct AbandonOnDrop<'a> {
    core: &'a Mutex<SyncCore>,
    id: AckId,
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        self.core.lock().abandon_ack(self.id);
    }
}

/// Cloneable handle to a running synchronization client.
#[derive(Clone)]
pub struct SyncClient {
    core: Arc<Mutex<SyncCore>>,
    config: SyncConfig,
    events: broadcast::Sender<SyncEvent>,
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("core", &*self.core.lock())
            .finish()
    }
}

impl SyncClient {
    /// Client on the system clock with the built-in move-history engine.
    pub fn new(transport: Arc<dyn Transport>, config: SyncConfig) -> Self {
        Self::with_parts(
            transport,
            config,
            Arc::new(SystemClock),
            default_engine_factory(),
        )
    }

    /// Client with an explicit time source and rules-engine factory.
    pub fn with_parts(
        transport: Arc<dyn Transport>,
        config: SyncConfig,
        time: Arc<dyn TimeSource>,
        factory: EngineFactory,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let core = SyncCore::new(transport, config.clone(), time, factory, events.clone());
        Self {
            core: Arc::new(Mutex::new(core)),
            config,
            events,
        }
    }

    /// Subscribe to observer events. Each receiver sees events sent after it was created.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// See [`SyncCore::connect`].
    pub fn connect(&self) -> bool {
        self.core.lock().connect()
    }

    /// See [`SyncCore::disconnect`].
    pub fn disconnect(&self) -> bool {
        self.core.lock().disconnect()
    }

    pub fn set_session(&self, session: Option<Session>) {
        self.core.lock().set_session(session);
    }

    /// Follow a match; deferred until connected if necessary.
    pub fn subscribe(&self, game_id: GameId) {
        self.core.lock().subscribe(game_id);
    }

    pub fn unsubscribe(&self, game_id: GameId) {
        self.core.lock().unsubscribe(game_id);
    }

    /// Feed one transport event. [`run`](Self::run) calls this for every
    /// event it receives; embedders with their own loop can call it directly.
    pub fn handle_event(&self, event: TransportEvent) {
        self.core.lock().handle_event(event);
    }

    /// Recompute displayed clocks now instead of waiting for the next tick.
    pub fn tick_clocks(&self) {
        self.core.lock().tick_clocks();
    }

    /// Submit a move and wait for the server's acknowledgment.
    ///
    /// A timeout means confirmation did not arrive in time, not that the
    /// move was rejected.
    pub async fn submit_move(&self, game_id: GameId, mv: Move) -> Result<Value> {
        let wait = self.core.lock().submit_move(game_id, mv)?;
        let _guard = AbandonOnDrop {
            core: &self.core,
            id: wait.id,
        };
        wait.wait(self.config.move_ack_timeout).await
    }

    /// Resign the match. Fire-and-forget.
    pub fn resign(&self, game_id: GameId) -> Result<()> {
        self.core.lock().resign(game_id)
    }

    pub fn request_undo(&self, game_id: GameId, move_number: u32) -> Result<()> {
        self.core.lock().request_undo(game_id, move_number)
    }

    pub fn accept_undo(&self, game_id: GameId, move_number: u32) -> Result<()> {
        self.core.lock().accept_undo(game_id, move_number)
    }

    /// Mark `stones` dead (or alive again) during stone removal.
    pub fn set_removed_stones(&self, game_id: GameId, stones: &[Point], removed: bool) -> Result<()> {
        self.core.lock().set_removed_stones(game_id, stones, removed)
    }

    /// Fetch one page of a game listing, waiting for a connection first if needed.
    pub async fn query_game_list(&self, query: GameListQuery) -> Result<GameListPage> {
        loop {
            let start = self.core.lock().begin_game_list_query(&query)?;
            match start {
                QueryStart::Sent(wait) => {
                    let _guard = AbandonOnDrop {
                        core: &self.core,
                        id: wait.id,
                    };
                    let data = wait.wait(self.config.query_timeout).await?;
                    return decode(events::GAMELIST_QUERY, data);
                }
                QueryStart::Deferred(connected) => {
                    debug!("game list query waiting for connection");
                    connected.await.map_err(|_| SyncError::Closed)?;
                }
            }
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.core.lock().state()
    }

    /// Latest drift estimate; zero until the first probe reply.
    pub fn drift(&self) -> DriftEstimate {
        self.core.lock().drift()
    }

    pub fn is_subscribed(&self, game_id: GameId) -> bool {
        self.core.lock().registry().is_subscribed(game_id)
    }

    /// Subscribed matches, ascending.
    pub fn connected_ids(&self) -> Vec<GameId> {
        self.core.lock().matches().connected_ids()
    }

    /// Matches announced by `active_game` summaries, ascending.
    pub fn active_ids(&self) -> Vec<GameId> {
        self.core.lock().matches().active_ids()
    }

    /// Read a match's state under the lock.
    pub fn with_match<R>(&self, game_id: GameId, f: impl FnOnce(&MatchState) -> R) -> Option<R> {
        let core = self.core.lock();
        core.matches().get(game_id).map(f)
    }

    /// Run with exclusive access to the core.
    pub fn with_core<R>(&self, f: impl FnOnce(&mut SyncCore) -> R) -> R {
        f(&mut self.core.lock())
    }

    /// Drive the client until the transport's event channel closes.
    pub async fn run(self, mut inbound: mpsc::UnboundedReceiver<TransportEvent>) {
        let mut probe = tokio::time::interval(self.config.probe_interval);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut countdown = tokio::time::interval(self.config.countdown_tick);
        countdown.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // the first tick completes immediately; the connect handler probes anyway
        probe.tick().await;

        loop {
            tokio::select! {
                event = inbound.recv() => {
                    let Some(event) = event else {
                        info!("transport event channel closed");
                        break;
                    };
                    let connected = matches!(event, TransportEvent::Connected);
                    self.handle_event(event);
                    if connected {
                        probe.reset();
                    }
                }
                _ = probe.tick() => self.core.lock().send_probe(),
                _ = countdown.tick() => self.tick_clocks(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::clock::ManualClock;
    use crate::realtime::protocol::{GameList, MessageKind};
    use crate::realtime::transport::recording::RecordingTransport;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        transport: Arc<RecordingTransport>,
        clock: Arc<ManualClock>,
        client: SyncClient,
    }

    fn harness() -> Harness {
        let transport = Arc::new(RecordingTransport::new());
        let clock = Arc::new(ManualClock::new(1_000_000.0));
        let client = SyncClient::with_parts(
            transport.clone(),
            SyncConfig::default(),
            clock.clone(),
            default_engine_factory(),
        );
        Harness {
            transport,
            clock,
            client,
        }
    }

    fn session() -> Session {
        Session::new(42, "alice", "chat-token", "notify-token")
    }

    fn message(event: &str, data: Value) -> TransportEvent {
        TransportEvent::Message {
            event: event.to_string(),
            data,
        }
    }

    fn connected_harness() -> Harness {
        let h = harness();
        h.client.connect();
        h.client.handle_event(TransportEvent::Connected);
        h
    }

    fn game_connects(h: &Harness) -> Vec<i64> {
        h.transport
            .named(events::GAME_CONNECT)
            .iter()
            .map(|e| e.data["game_id"].as_i64().unwrap())
            .collect()
    }

    #[test]
    fn test_connect_is_idempotent() {
        let h = harness();
        assert!(h.client.connect());
        assert!(!h.client.connect());
        h.client.handle_event(TransportEvent::Connected);
        assert!(!h.client.connect());

        assert_eq!(h.transport.opens(), 1);
        assert_eq!(h.client.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_connect_sends_probe_and_auth() {
        let h = harness();
        h.client.set_session(Some(session()));
        h.client.connect();
        h.client.handle_event(TransportEvent::Connected);

        let ping = &h.transport.named(events::PING)[0];
        assert_eq!(ping.data, json!({"client": 1_000_000.0, "drift": 0.0, "latency": 0.0}));

        assert_eq!(
            h.transport.named(events::NOTIFICATION_CONNECT)[0].data,
            json!({"player_id": 42, "username": "alice", "auth": "notify-token"})
        );
        assert_eq!(
            h.transport.named(events::AUTHENTICATE)[0].data,
            json!({"player_id": 42, "username": "alice", "auth": "chat-token"})
        );
    }

    #[test]
    fn test_anonymous_connect_skips_auth() {
        let h = connected_harness();
        assert_eq!(h.transport.count(events::AUTHENTICATE), 0);
        assert_eq!(h.transport.count(events::NOTIFICATION_CONNECT), 0);

        h.client.set_session(Some(session()));
        assert_eq!(h.transport.count(events::AUTHENTICATE), 1);
        assert_eq!(h.transport.count(events::NOTIFICATION_CONNECT), 1);
    }

    #[test]
    fn test_subscribe_twice_registers_once() {
        let h = connected_harness();
        h.client.subscribe(GameId(1));
        h.client.subscribe(GameId(1));

        assert_eq!(game_connects(&h), vec![1]);
        h.client.with_core(|core| {
            assert_eq!(
                core.registry().handlers().count_for(GameId(1)),
                MessageKind::ALL.len()
            );
        });
        assert_eq!(h.client.connected_ids(), vec![GameId(1)]);
    }

    #[test]
    fn test_reconnect_resubscribes_each_match_once() {
        let h = connected_harness();
        h.client.subscribe(GameId(1));
        h.client.subscribe(GameId(2));
        h.transport.clear();

        h.client.handle_event(TransportEvent::Disconnected {
            reason: "reset".into(),
        });
        h.client.handle_event(TransportEvent::Connecting);
        h.client.handle_event(TransportEvent::Connected);

        let mut resubscribed = game_connects(&h);
        resubscribed.sort();
        assert_eq!(resubscribed, vec![1, 2]);
        h.client.with_core(|core| {
            assert_eq!(core.registry().handlers().len(), 2 * MessageKind::ALL.len());
        });
        assert_eq!(h.client.connected_ids(), vec![GameId(1), GameId(2)]);
    }

    #[test]
    fn test_subscribe_while_disconnected_defers_once() {
        let h = harness();
        h.client.subscribe(GameId(5));
        assert_eq!(h.transport.total(), 0);
        assert!(!h.client.is_subscribed(GameId(5)));

        h.client.connect();
        h.client.handle_event(TransportEvent::Connected);
        assert_eq!(game_connects(&h), vec![5]);
        h.client.with_core(|core| assert_eq!(core.deferred_count(), 0));

        // reconnect replays the subscription, not the spent continuation
        h.transport.clear();
        h.client.handle_event(TransportEvent::Disconnected {
            reason: "reset".into(),
        });
        h.client.handle_event(TransportEvent::Connected);
        assert_eq!(game_connects(&h), vec![5]);
    }

    #[test]
    fn test_stale_handlers_do_not_route_after_unsubscribe() {
        let h = connected_harness();
        h.client.subscribe(GameId(3));
        h.client.unsubscribe(GameId(3));

        h.client
            .handle_event(message("game/3/move", json!({"move": [1, 1], "game_id": 3})));

        assert!(h.client.with_match(GameId(3), |_| ()).is_none());
        assert_eq!(h.transport.count(events::GAME_DISCONNECT), 1);
        h.client
            .with_core(|core| assert!(core.registry().handlers().is_empty()));
    }

    #[test]
    fn test_full_sync_with_outcome_unsubscribes() {
        let h = connected_harness();
        let mut events_rx = h.client.events();
        h.client.subscribe(GameId(7));

        h.client.handle_event(message(
            "game/7/gamedata",
            json!({
                "game_id": 7,
                "width": 19,
                "height": 19,
                "outcome": "Timeout",
                "moves": []
            }),
        ));

        assert!(!h.client.is_subscribed(GameId(7)));
        assert_eq!(h.transport.count(events::GAME_DISCONNECT), 1);
        assert!(h.client.connected_ids().is_empty());

        let mut seen = Vec::new();
        while let Ok(event) = events_rx.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&SyncEvent::MatchFinished {
            game_id: GameId(7),
            outcome: Some("Timeout".to_string())
        }));
        assert_eq!(seen.last(), Some(&SyncEvent::MatchRemoved(GameId(7))));
    }

    #[test]
    fn test_moves_route_to_match() {
        let h = connected_harness();
        h.client.subscribe(GameId(7));

        h.client
            .handle_event(message("game/7/move", json!({"move": [-1, -1], "game_id": 7})));
        h.client
            .handle_event(message("game/7/move", json!({"move": [3, 4], "game_id": 7})));

        let moves = h.client.with_match(GameId(7), |m| m.moves().to_vec()).unwrap();
        assert_eq!(moves, vec![Move::Pass, Move::Stone(Point::new(4, 3))]);
    }

    #[test]
    fn test_pong_updates_drift() {
        let h = connected_harness();
        // ping went out at 1_000_000, reply lands 200ms later
        h.clock.set(1_000_200.0);

        h.client.handle_event(message(
            events::PONG,
            json!({"client": 1_000_000.0, "server": 999_000.0}),
        ));

        let drift = h.client.drift();
        assert_eq!(drift.latency, 200.0);
        assert_eq!(drift.drift, (1_000_200.0 - 100.0) - 999_000.0);

        h.client.with_core(|core| core.send_probe());
        let pings = h.transport.named(events::PING);
        assert_eq!(pings.last().unwrap().data["latency"], json!(200.0));
    }

    #[test]
    fn test_active_game_promotes_same_instance() {
        let h = connected_harness();
        let summary = json!({
            "id": 11,
            "name": "Club game",
            "width": 9,
            "height": 9,
            "black": {"id": 42, "username": "alice"},
            "white": {"id": 43, "username": "bob"}
        });

        h.client.handle_event(message(events::ACTIVE_GAME, summary.clone()));
        h.client.handle_event(message(events::ACTIVE_GAME, summary));

        assert_eq!(game_connects(&h), vec![11]);
        assert_eq!(h.client.active_ids(), vec![GameId(11)]);
        assert_eq!(h.client.connected_ids(), vec![GameId(11)]);
        let width = h.client.with_match(GameId(11), |m| m.width).unwrap();
        assert_eq!(width, 9);
        h.client
            .with_core(|core| assert_eq!(core.matches().count(), 1));
    }

    #[test]
    fn test_tick_uses_drift_offset() {
        let h = connected_harness();
        h.client.subscribe(GameId(7));
        h.client.handle_event(message(
            "game/7/gamedata",
            json!({
                "game_id": 7,
                "width": 19,
                "height": 19,
                "time_control": {"system": "fischer"},
                "clock": {
                    "current_player": 1,
                    "black_player_id": 1,
                    "white_player_id": 2,
                    "last_move": 990_000.0,
                    "black_time": {"thinking_time": 60},
                    "white_time": {"thinking_time": 60}
                }
            }),
        ));

        // Local clock runs 10s ahead of the server: offset 10_000.
        h.clock.set(1_010_000.0);
        h.client.handle_event(message(
            events::PONG,
            json!({"client": 1_010_000.0, "server": 1_000_000.0}),
        ));
        h.client.tick_clocks();

        let display = h
            .client
            .with_match(GameId(7), |m| m.clock_display.clone())
            .unwrap()
            .unwrap();
        // server now = 1_000_000, 10s since last move
        assert_eq!(display.black.main_time, 50.0);
        assert_eq!(display.white.main_time, 60.0);
    }

    #[tokio::test]
    async fn test_move_without_session_makes_no_calls() {
        let h = connected_harness();
        h.transport.clear();

        let err = h
            .client
            .submit_move(GameId(1), Move::Pass)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::NotAuthenticated));
        assert_eq!(h.transport.total(), 0);
    }

    #[tokio::test]
    async fn test_move_acknowledged() {
        let h = connected_harness();
        h.client.set_session(Some(session()));

        let client = h.client.clone();
        let task = tokio::spawn(async move { client.submit_move(GameId(1), Move::Pass).await });
        tokio::task::yield_now().await;

        let sent = h.transport.named(events::GAME_MOVE);
        assert_eq!(sent.len(), 1);
        let id = sent[0].ack.unwrap();
        h.client.handle_event(TransportEvent::Ack {
            id,
            data: json!({"ok": 1}),
        });

        assert_eq!(task.await.unwrap().unwrap(), json!({"ok": 1}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_ack_timeout_is_abandoned() {
        let h = connected_harness();
        h.client.set_session(Some(session()));

        let err = h
            .client
            .submit_move(GameId(1), Move::Stone(Point::new(0, 0)))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::AckTimeout { .. }));
        h.client.with_core(|core| assert_eq!(core.pending_acks(), 0));
    }

    #[tokio::test]
    async fn test_game_list_query_waits_for_connect() {
        let h = harness();
        let client = h.client.clone();
        let task = tokio::spawn(async move {
            client
                .query_game_list(GameListQuery::new(GameList::Live, 0, 10))
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(h.transport.count(events::GAMELIST_QUERY), 0);

        h.client.connect();
        h.client.handle_event(TransportEvent::Connected);
        tokio::task::yield_now().await;

        let sent = h.transport.named(events::GAMELIST_QUERY);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data["from"], json!(0));
        assert_eq!(sent[0].data["limit"], json!(10));

        h.client.handle_event(TransportEvent::Ack {
            id: sent[0].ack.unwrap(),
            data: json!({
                "list": "live", "by": "rank", "size": 1, "from": 0, "limit": 10,
                "results": [{"id": 1}]
            }),
        });
        let page = task.await.unwrap().unwrap();
        assert_eq!(page.size, 1);
        assert_eq!(page.results.len(), 1);

        // a later reconnect does not send the query again
        h.client.handle_event(TransportEvent::Disconnected {
            reason: "reset".into(),
        });
        h.client.handle_event(TransportEvent::Connected);
        tokio::task::yield_now().await;
        assert_eq!(h.transport.count(events::GAMELIST_QUERY), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_probes_on_interval() {
        let h = harness();
        let (tx, rx) = mpsc::unbounded_channel();
        let runner = tokio::spawn(h.client.clone().run(rx));

        h.client.connect();
        tx.send(TransportEvent::Connected).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(h.transport.count(events::PING), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.transport.count(events::PING), 2);

        drop(tx);
        runner.await.unwrap();
    }

    #[test]
    fn test_disconnect_keeps_subscriptions_for_next_connect() {
        let h = connected_harness();
        h.client.subscribe(GameId(1));
        h.client.subscribe(GameId(2));
        h.transport.clear();

        assert!(h.client.disconnect());
        assert_eq!(h.transport.closes(), 1);
        assert_eq!(h.client.state(), ConnectionState::Disconnected);
        assert!(h.client.is_subscribed(GameId(1)));
        assert_eq!(h.transport.count(events::GAME_DISCONNECT), 0);
        assert!(!h.client.disconnect());

        assert!(h.client.connect());
        assert_eq!(h.transport.opens(), 2);
        h.client.handle_event(TransportEvent::Connected);

        assert_eq!(game_connects(&h), vec![1, 2]);
        assert_eq!(h.client.connected_ids(), vec![GameId(1), GameId(2)]);
    }

    #[test]
    fn test_disconnect_between_retries_stops_transport() {
        let h = connected_harness();
        h.client.subscribe(GameId(1));
        h.client.handle_event(TransportEvent::Disconnected {
            reason: "reset".into(),
        });
        h.transport.clear();

        assert!(h.client.disconnect());
        assert_eq!(h.transport.closes(), 1);

        // a retry already in flight when the transport stopped
        h.client.handle_event(TransportEvent::Connecting);
        h.client.handle_event(TransportEvent::Connected);

        assert_eq!(h.client.state(), ConnectionState::Disconnected);
        assert_eq!(h.transport.total(), 0);
    }

    #[test]
    fn test_stale_attempt_after_disconnect_does_not_block_connect() {
        let h = connected_harness();
        h.client.disconnect();

        h.client.handle_event(TransportEvent::Connecting);
        assert_eq!(h.client.state(), ConnectionState::Disconnected);

        assert!(h.client.connect());
        assert_eq!(h.transport.opens(), 2);
        assert_eq!(h.client.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_unsubscribe_cancels_deferred_subscribe() {
        let h = harness();
        h.client.subscribe(GameId(5));
        h.client.unsubscribe(GameId(5));
        h.client.with_core(|core| assert_eq!(core.deferred_count(), 0));

        h.client.connect();
        h.client.handle_event(TransportEvent::Connected);

        assert!(game_connects(&h).is_empty());
        assert!(!h.client.is_subscribed(GameId(5)));
    }

    #[test]
    fn test_final_sync_rejected_by_engine_still_unsubscribes() {
        let h = connected_harness();
        h.client.subscribe(GameId(7));

        h.client.handle_event(message(
            "game/7/gamedata",
            json!({
                "game_id": 7,
                "width": 9,
                "height": 9,
                "outcome": "Resignation",
                "moves": [[12, 12]]
            }),
        ));

        assert!(!h.client.is_subscribed(GameId(7)));
        assert!(h.client.connected_ids().is_empty());
        assert_eq!(h.transport.count(events::GAME_DISCONNECT), 1);
    }

    #[tokio::test]
    async fn test_dropped_move_wait_releases_ack() {
        let h = connected_harness();
        h.client.set_session(Some(session()));

        let client = h.client.clone();
        let task = tokio::spawn(async move { client.submit_move(GameId(1), Move::Pass).await });
        tokio::task::yield_now().await;
        h.client.with_core(|core| assert_eq!(core.pending_acks(), 1));

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        h.client.with_core(|core| assert_eq!(core.pending_acks(), 0));
    }

    #[tokio::test]
    async fn test_connection_loss_fails_pending_acks() {
        let h = connected_harness();
        h.client.set_session(Some(session()));

        let client = h.client.clone();
        let task = tokio::spawn(async move { client.submit_move(GameId(1), Move::Pass).await });
        tokio::task::yield_now().await;

        h.client.handle_event(TransportEvent::Disconnected {
            reason: "reset".into(),
        });

        assert!(matches!(task.await.unwrap(), Err(SyncError::Closed)));
        h.client.with_core(|core| assert_eq!(core.pending_acks(), 0));
    }

    #[tracing_test::traced_test]
    #[test]
    fn test_liveness_replies_are_not_logged() {
        let h = connected_harness();
        h.client.handle_event(message(
            events::PONG,
            json!({"client": 1_000_000.0, "server": 1_000_000.0}),
        ));
        h.client
            .handle_event(message("game/99/clock", json!({})));

        assert!(!logs_contain("net/pong"));
        assert!(logs_contain("game/99/clock"));
    }
}
