//! Prometheus counters fed from the event bus.

use std::sync::Arc;

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::DaemonResult;
use crate::event_bus::{EngineEvent, EventBus};

/// Engine counters in a private registry.
pub struct Metrics {
    registry: Registry,
    events: IntCounterVec,
    closures: IntCounterVec,
    lagged: IntCounter,
}

impl Metrics {
    /// Create and register the counters.
    pub fn new() -> DaemonResult<Self> {
        let registry = Registry::new_custom(Some("perpguard".to_string()), None)?;

        let events = IntCounterVec::new(Opts::new("events_total", "Engine events by kind"), &["event"])?;
        let closures = IntCounterVec::new(
            Opts::new("positions_closed_total", "Closed positions by reason"),
            &["reason"],
        )?;
        let lagged = IntCounter::new("events_lagged_total", "Events missed by the metrics recorder")?;

        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(closures.clone()))?;
        registry.register(Box::new(lagged.clone()))?;

        Ok(Self {
            registry,
            events,
            closures,
            lagged,
        })
    }

    /// Count one event.
    pub fn observe(&self, event: &EngineEvent) {
        self.events.with_label_values(&[event.name()]).inc();
        if let EngineEvent::PositionClosed { reason, .. } = event {
            self.closures.with_label_values(&[&reason.to_string()]).inc();
        }
    }

    /// Count for one event kind.
    pub fn event_count(&self, name: &str) -> u64 {
        self.events.with_label_values(&[name]).get()
    }

    /// Text exposition format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Record every bus event until cancelled.
    pub fn spawn_recorder(self: Arc<Self>, bus: &EventBus, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut receiver = bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = receiver.recv() => match next {
                        Some(Ok(event)) => self.observe(&event),
                        Some(Err(lag_msg)) => {
                            self.lagged.inc();
                            warn!(%lag_msg, "Metrics recorder lagged");
                        }
                        None => break,
                    },
                }
            }
            debug!("Metrics recorder stopped");
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
