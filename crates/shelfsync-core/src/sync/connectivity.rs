//! Connectivity monitor
//!
//! Probes the server's liveness endpoint on a timer and publishes
//! `Online`/`Offline` transitions. A single failed probe is not enough to
//! go offline; the monitor waits for `threshold` consecutive failures. While
//! offline the probe cadence doubles up to a ceiling.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{EventSink, SyncEvent};
use crate::config::SyncTuning;
use crate::transport::{Method, Transport};

/// Liveness path probed against the API base
pub const HEALTH_PATH: &str = "/health";

/// Reachability of the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    /// No verdict yet
    Unknown,
    Online,
    Offline,
}

impl std::fmt::Display for Connectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connectivity::Unknown => f.write_str("unknown"),
            Connectivity::Online => f.write_str("online"),
            Connectivity::Offline => f.write_str("offline"),
        }
    }
}

#[derive(Debug)]
struct ProbeState {
    consecutive_failures: u32,
    interval: Duration,
}

/// Debounced liveness tracker
pub struct ConnectivityMonitor {
    state: Mutex<ProbeState>,
    tx: watch::Sender<Connectivity>,
    threshold: u32,
    probe_interval: Duration,
    max_probe_interval: Duration,
    probe_timeout: Duration,
    events: EventSink,
}

impl ConnectivityMonitor {
    pub fn new(tuning: &SyncTuning, events: EventSink) -> Self {
        let (tx, _) = watch::channel(Connectivity::Unknown);
        let probe_interval = tuning.probe_interval();
        Self {
            state: Mutex::new(ProbeState {
                consecutive_failures: 0,
                interval: probe_interval,
            }),
            tx,
            threshold: tuning.offline_failure_threshold.max(2),
            probe_interval,
            max_probe_interval: tuning.max_probe_interval().max(probe_interval),
            probe_timeout: tuning.request_timeout(),
            events,
        }
    }

    pub fn current(&self) -> Connectivity {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }

    /// Delay before the next probe
    pub fn next_interval(&self) -> Duration {
        self.state.lock().interval
    }

    /// Fold one probe result in; returns the new state on a transition
    pub fn record_probe(&self, ok: bool) -> Option<Connectivity> {
        let current = self.current();
        let next = {
            let mut state = self.state.lock();
            if ok {
                state.consecutive_failures = 0;
                state.interval = self.probe_interval;
                Connectivity::Online
            } else {
                state.consecutive_failures += 1;
                if current == Connectivity::Offline {
                    state.interval = (state.interval * 2).min(self.max_probe_interval);
                    Connectivity::Offline
                } else if state.consecutive_failures >= self.threshold {
                    state.interval = (self.probe_interval * 2).min(self.max_probe_interval);
                    Connectivity::Offline
                } else {
                    debug!(
                        "Probe failed ({}/{})",
                        state.consecutive_failures, self.threshold
                    );
                    current
                }
            }
        };

        self.transition(next)
    }

    /// Override the state (OS connectivity hints, tests)
    pub fn force(&self, connectivity: Connectivity) -> Option<Connectivity> {
        {
            let mut state = self.state.lock();
            state.consecutive_failures = match connectivity {
                Connectivity::Offline => self.threshold,
                _ => 0,
            };
            state.interval = self.probe_interval;
        }
        self.transition(connectivity)
    }

    /// Probe once and record the result
    pub async fn probe(&self, transport: &dyn Transport) -> Option<Connectivity> {
        let result =
            tokio::time::timeout(self.probe_timeout, transport.send(Method::Get, HEALTH_PATH, None))
                .await;
        let ok = match result {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Health probe failed: {}", e);
                false
            }
            Err(_) => {
                debug!("Health probe timed out");
                false
            }
        };
        self.record_probe(ok)
    }

    /// Probe until cancelled
    pub async fn run(self: Arc<Self>, transport: Arc<dyn Transport>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.probe(transport.as_ref()) => {}
            }

            let delay = self.next_interval();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("Connectivity monitor stopped");
    }

    fn transition(&self, next: Connectivity) -> Option<Connectivity> {
        let previous = self.tx.send_replace(next);
        if previous == next {
            return None;
        }
        info!("Connectivity: {} -> {}", previous, next);
        self.events.emit(SyncEvent::ConnectivityChanged(next));
        Some(next)
    }
}
