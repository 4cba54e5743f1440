//! WebSocket transport.
//!
//! Frames are JSON arrays (see [`Frame`]). One background task owns the
//! socket: it connects, pumps frames both ways, and on loss waits out a
//! capped exponential backoff before trying again. Every step is reported
//! as a [`TransportEvent`] on the channel handed to [`WebSocketTransport::new`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::protocol::Frame;
use super::transport::{AckId, Transport, TransportError, TransportEvent};

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(750);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Delay schedule between reconnection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            multiplier: 2,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt.min(16));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Default)]
struct Worker {
    outbound: Option<mpsc::UnboundedSender<String>>,
    task: Option<JoinHandle<()>>,
}

#[derive(Debug)]
pub struct WebSocketTransport {
    url: String,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<TransportEvent>,
    connected: Arc<AtomicBool>,
    worker: Mutex<Worker>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            url: url.into(),
            policy: ReconnectPolicy::default(),
            events,
            connected: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(Worker::default()),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Transport for WebSocketTransport {
    fn open(&self) {
        let mut worker = self.worker.lock();
        if worker.task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "cannot open websocket outside a tokio runtime");
                let _ = self.events.send(TransportEvent::Disconnected {
                    reason: e.to_string(),
                });
                return;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let task = runtime.spawn(run_socket(
            self.url.clone(),
            self.policy,
            self.events.clone(),
            rx,
            Arc::clone(&self.connected),
        ));
        worker.outbound = Some(tx);
        worker.task = Some(task);
    }

    fn close(&self) {
        let mut worker = self.worker.lock();
        worker.outbound = None;
        if let Some(task) = worker.task.take() {
            task.abort();
            info!(url = %self.url, "websocket closed");
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn emit(&self, event: &str, data: Value, ack: Option<AckId>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let worker = self.worker.lock();
        let Some(outbound) = &worker.outbound else {
            return Err(TransportError::NotConnected);
        };
        let frame = Frame::Event {
            event: event.to_string(),
            data,
            ack,
        };
        outbound
            .send(frame.encode())
            .map_err(|_| TransportError::Closed)
    }
}

async fn run_socket(
    url: String,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    connected: Arc<AtomicBool>,
) {
    let mut attempt = 0u32;
    loop {
        // frames queued for a socket that is gone are stale
        while outbound.try_recv().is_ok() {}

        if events.send(TransportEvent::Connecting).is_err() {
            break;
        }
        debug!(%url, attempt, "connecting");

        let reason = match connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                attempt = 0;
                connected.store(true, Ordering::SeqCst);
                info!(%url, "websocket connected");
                let _ = events.send(TransportEvent::Connected);

                let reason = pump(socket, &events, &mut outbound).await;
                connected.store(false, Ordering::SeqCst);
                reason
            }
            Err(e) => e.to_string(),
        };

        warn!(%url, %reason, "websocket disconnected");
        if events
            .send(TransportEvent::Disconnected { reason })
            .is_err()
        {
            break;
        }

        let delay = policy.delay_for(attempt);
        attempt = attempt.saturating_add(1);
        debug!(delay_ms = delay.as_millis() as u64, "waiting before reconnect");
        tokio::time::sleep(delay).await;
    }
}

/// Move frames until the socket ends. Returns why it ended.
async fn pump(
    socket: Socket,
    events: &mpsc::UnboundedSender<TransportEvent>,
    outbound: &mut mpsc::UnboundedReceiver<String>,
) -> String {
    let (mut write, mut read) = socket.split();
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(text) = frame else {
                    let _ = write.close().await;
                    return "transport dropped".to_string();
                };
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    return e.to_string();
                }
            }
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = inbound_event(text.as_str()) {
                        let _ = events.send(event);
                    }
                }
                Some(Ok(Message::Close(_))) | None => return "closed by server".to_string(),
                Some(Ok(_)) => {}
                Some(Err(e)) => return e.to_string(),
            }
        }
    }
}

/// Translate one text frame into a transport event.
fn inbound_event(text: &str) -> Option<TransportEvent> {
    match Frame::decode(text) {
        Ok(Frame::Event { event, data, .. }) => Some(TransportEvent::Message { event, data }),
        Ok(Frame::Ack { id, data }) => Some(TransportEvent::Ack { id, data }),
        Err(e) => {
            warn!(error = %e, "unreadable frame dropped");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..6)
            .map(|n| policy.delay_for(n).as_millis() as u64)
            .collect();

        assert_eq!(delays, vec![750, 1500, 3000, 6000, 10_000, 10_000]);
        assert_eq!(policy.delay_for(u32::MAX), DEFAULT_MAX_DELAY);
    }

    #[test]
    fn test_inbound_frames() {
        assert_eq!(
            inbound_event(r#"["game/1/move",{"move":[3,4]}]"#),
            Some(TransportEvent::Message {
                event: "game/1/move".to_string(),
                data: json!({"move": [3, 4]}),
            })
        );
        assert_eq!(
            inbound_event(r#"["ack",4,{"ok":1}]"#),
            Some(TransportEvent::Ack {
                id: 4,
                data: json!({"ok": 1}),
            })
        );
        assert_eq!(inbound_event("not json"), None);
    }

    #[test]
    fn test_emit_before_connect_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = WebSocketTransport::new("ws://127.0.0.1:1", tx);

        assert_eq!(
            transport.emit("net/ping", json!({}), None),
            Err(TransportError::NotConnected)
        );
    }

    #[test]
    fn test_open_outside_runtime_reports_disconnect() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = WebSocketTransport::new("ws://127.0.0.1:1", tx);

        transport.open();

        assert!(matches!(
            rx.try_recv(),
            Ok(TransportEvent::Disconnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_refused_connection_reports_attempt_and_loss() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = WebSocketTransport::new("ws://127.0.0.1:1", tx);

        transport.open();
        transport.open();

        assert_eq!(rx.recv().await, Some(TransportEvent::Connecting));
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Disconnected { .. })
        ));
        assert!(!transport.is_connected());

        transport.close();
    }
}
