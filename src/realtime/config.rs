//! Client configuration.

use std::time::Duration;

use super::game::DEFAULT_BOARD_SIZE;
use super::protocol::events;

/// Interval between `net/ping` drift probes (10 seconds).
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Interval between countdown recomputations (100 ms).
pub const DEFAULT_COUNTDOWN_TICK: Duration = Duration::from_millis(100);

/// Bound on waiting for a `game/move` acknowledgment (3 seconds).
pub const DEFAULT_MOVE_ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Bound on waiting for a `gamelist/query` acknowledgment (10 seconds).
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of the observer broadcast channel.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub probe_interval: Duration,
    pub countdown_tick: Duration,
    pub move_ack_timeout: Duration,
    pub query_timeout: Duration,
    /// Inbound events too frequent to log.
    pub quiet_events: Vec<String>,
    /// Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Board size for matches subscribed before any snapshot arrives.
    pub default_board_size: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            probe_interval: DEFAULT_PROBE_INTERVAL,
            countdown_tick: DEFAULT_COUNTDOWN_TICK,
            move_ack_timeout: DEFAULT_MOVE_ACK_TIMEOUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            quiet_events: vec![events::PONG.to_string()],
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            default_board_size: DEFAULT_BOARD_SIZE,
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    #[must_use]
    pub fn with_countdown_tick(mut self, tick: Duration) -> Self {
        self.countdown_tick = tick;
        self
    }

    #[must_use]
    pub fn with_move_ack_timeout(mut self, timeout: Duration) -> Self {
        self.move_ack_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_quiet_event(mut self, event: impl Into<String>) -> Self {
        self.quiet_events.push(event.into());
        self
    }

    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_default_board_size(mut self, size: u32) -> Self {
        self.default_board_size = size;
        self
    }

    pub fn is_quiet(&self, event: &str) -> bool {
        self.quiet_events.iter().any(|e| e == event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.probe_interval, Duration::from_secs(10));
        assert_eq!(config.move_ack_timeout, Duration::from_secs(3));
        assert!(config.is_quiet("net/pong"));
        assert!(!config.is_quiet("game/1/move"));
    }

    #[test]
    fn test_builder() {
        let config = SyncConfig::new()
            .with_event_channel_capacity(0)
            .with_quiet_event("game/1/clock")
            .with_default_board_size(9);
        assert_eq!(config.event_channel_capacity, 1);
        assert!(config.is_quiet("game/1/clock"));
        assert_eq!(config.default_board_size, 9);
    }
}
