//! Clock drift estimation.
//!
//! Every probe interval the client sends `net/ping` with its current time;
//! the server answers `net/pong` echoing that time next to its own. One
//! reply gives one midpoint estimate, assuming the one-way delay is the same
//! in both directions. That assumption does not always hold, so the estimate
//! can be off by up to the asymmetry of the path.
//!
//! Only the latest sample is kept. A new reply replaces the estimate
//! outright; nothing is averaged.

use std::sync::Arc;

use super::clock::TimeSource;

/// One probe round trip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftSample {
    pub client_send_time: f64,
    pub server_time: f64,
    pub latency: f64,
}

/// Derived drift/latency pair, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DriftEstimate {
    /// Local time minus server time at the midpoint of the round trip.
    pub drift: f64,
    /// Full round-trip time of the last probe.
    pub latency: f64,
}

impl DriftEstimate {
    /// Offset used to map local time onto the server timeline:
    /// `server_now = local_now - offset`.
    pub fn offset(&self) -> f64 {
        self.drift - self.latency
    }
}

#[derive(Debug)]
pub struct DriftEstimator {
    time: Arc<dyn TimeSource>,
    last_sample: Option<DriftSample>,
    estimate: DriftEstimate,
}

impl DriftEstimator {
    pub fn new(time: Arc<dyn TimeSource>) -> Self {
        Self {
            time,
            last_sample: None,
            estimate: DriftEstimate::default(),
        }
    }

    /// Fold in a `net/pong` reply and return the new estimate.
    pub fn record_probe_reply(&mut self, client_send_time: f64, server_time: f64) -> DriftEstimate {
        let now = self.time.now_ms();
        let latency = now - client_send_time;
        let drift = (now - latency / 2.0) - server_time;

        self.last_sample = Some(DriftSample {
            client_send_time,
            server_time,
            latency,
        });
        self.estimate = DriftEstimate { drift, latency };
        self.estimate
    }

    pub fn estimate(&self) -> DriftEstimate {
        self.estimate
    }

    pub fn last_sample(&self) -> Option<DriftSample> {
        self.last_sample
    }

    pub fn now(&self) -> f64 {
        self.time.now_ms()
    }

    /// Best guess at the server's current time.
    pub fn server_now(&self) -> f64 {
        self.time.now_ms() - self.estimate.offset()
    }
}
