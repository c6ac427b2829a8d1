//! Event bus for internal daemon communication.
//!
//! The control loops publish lifecycle and safety events; the metrics
//! recorder and tests subscribe. Loops never talk to each other through the
//! bus: they share state only through the store and ledger.
//!
//! Uses tokio broadcast channels for fan-out to multiple receivers.

use std::fmt;

use chrono::{DateTime, Utc};
use perpguard_domain::{PositionId, Price, Quantity, Side, Symbol};
use rust_decimal::Decimal;
use tokio::sync::broadcast;

// =============================================================================
// Event Types
// =============================================================================

/// Why a position left the live set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The trailing stop was hit
    TrailingStop,
    /// SafetyMonitor could not protect it
    Emergency,
    /// Below the minimum viable size
    BelowMinimum,
    /// Gone from the exchange (stop triggered, manual close)
    External,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::TrailingStop => write!(f, "trailing_stop"),
            CloseReason::Emergency => write!(f, "emergency"),
            CloseReason::BelowMinimum => write!(f, "below_minimum"),
            CloseReason::External => write!(f, "external"),
        }
    }
}

/// Events that flow through the daemon event bus.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Entry filled and recorded
    PositionOpened {
        position_id: PositionId,
        symbol: Symbol,
        side: Side,
        entry_price: Price,
        quantity: Quantity,
        margin: Decimal,
        timestamp: DateTime<Utc>,
    },

    /// Unknown exchange position adopted by reconciliation
    PositionImported {
        position_id: PositionId,
        symbol: Symbol,
        side: Side,
        margin: Decimal,
        timestamp: DateTime<Utc>,
    },

    /// Position removed from the live set, margin released
    PositionClosed {
        position_id: PositionId,
        symbol: Symbol,
        side: Side,
        reason: CloseReason,
        exit_price: Option<Price>,
        timestamp: DateTime<Utc>,
    },

    /// Protective stop accepted by the exchange
    StopInstalled {
        position_id: PositionId,
        symbol: Symbol,
        stop_price: Price,
        corrected: bool,
        timestamp: DateTime<Utc>,
    },

    /// Trailing stop armed
    TrailingActivated {
        position_id: PositionId,
        symbol: Symbol,
        stop_price: Price,
        locked_roe: Decimal,
        timestamp: DateTime<Utc>,
    },

    /// Trailing stop ratcheted
    TrailingAdvanced {
        position_id: PositionId,
        symbol: Symbol,
        previous_stop: Price,
        new_stop: Price,
        locked_roe: Decimal,
        timestamp: DateTime<Utc>,
    },

    /// Unprotectable position force-closed
    EmergencyClosure {
        position_id: PositionId,
        symbol: Symbol,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Allocation refused by the capital ceiling
    OverexposureRejected {
        symbol: Symbol,
        requested: Decimal,
        available: Decimal,
        timestamp: DateTime<Utc>,
    },

    /// Transient failures outlasted the retry bound
    RetriesExhausted {
        position_id: Option<PositionId>,
        symbol: Symbol,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Stable name, used as a metrics label
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::PositionOpened { .. } => "position_opened",
            EngineEvent::PositionImported { .. } => "position_imported",
            EngineEvent::PositionClosed { .. } => "position_closed",
            EngineEvent::StopInstalled { .. } => "stop_installed",
            EngineEvent::TrailingActivated { .. } => "trailing_activated",
            EngineEvent::TrailingAdvanced { .. } => "trailing_advanced",
            EngineEvent::EmergencyClosure { .. } => "emergency_closure",
            EngineEvent::OverexposureRejected { .. } => "overexposure_rejected",
            EngineEvent::RetriesExhausted { .. } => "retries_exhausted",
        }
    }
}

// =============================================================================
// Event Bus
// =============================================================================

/// Event bus for daemon-wide communication.
///
/// Multiple producers can send events, and multiple consumers can receive.
/// Uses broadcast channels for fan-out pattern.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a new event bus with specified capacity.
    ///
    /// Capacity determines how many events can be buffered before
    /// slow receivers start missing events (lagging).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send an event to all subscribers.
    ///
    /// Returns the number of receivers that received the event.
    /// Returns 0 if there are no active receivers.
    pub fn send(&self, event: EngineEvent) -> usize {
        // send() returns Err if there are no receivers, but we don't care
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to events.
    ///
    /// Returns a receiver that will receive all events sent after subscription.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Receiver for engine events.
pub struct EventReceiver {
    receiver: broadcast::Receiver<EngineEvent>,
}

impl EventReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` if the sender has been dropped.
    /// Returns error description if the receiver lagged (missed events).
    pub async fn recv(&mut self) -> Option<Result<EngineEvent, String>> {
        match self.receiver.recv().await {
            Ok(event) => Some(Ok(event)),
            Err(broadcast::error::RecvError::Closed) => None,
            Err(broadcast::error::RecvError::Lagged(count)) => {
                Some(Err(format!("Receiver lagged, missed {} events", count)))
            }
        }
    }

    /// Try to receive an event without blocking.
    ///
    /// Returns `None` if no event is immediately available.
    pub fn try_recv(&mut self) -> Option<Result<EngineEvent, String>> {
        match self.receiver.try_recv() {
            Ok(event) => Some(Ok(event)),
            Err(broadcast::error::TryRecvError::Empty) => None,
            Err(broadcast::error::TryRecvError::Closed) => None,
            Err(broadcast::error::TryRecvError::Lagged(count)) => {
                Some(Err(format!("Receiver lagged, missed {} events", count)))
            }
        }
    }

    /// Drain every event currently buffered.
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Some(result) = self.try_recv() {
            if let Ok(event) = result {
                events.push(event);
            }
        }
        events
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn emergency(position_id: PositionId) -> EngineEvent {
        EngineEvent::EmergencyClosure {
            position_id,
            symbol: Symbol::from_pair("BTCUSDT").unwrap(),
            reason: "stop rejected 3 times".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_event_bus_send_recv() {
        let bus = EventBus::new(10);
        let mut receiver = bus.subscribe();
        let position_id = Uuid::now_v7();

        bus.send(emergency(position_id));

        let event = receiver.recv().await.unwrap().unwrap();
        match event {
            EngineEvent::EmergencyClosure { position_id: id, .. } => assert_eq!(id, position_id),
            other => panic!("Expected EmergencyClosure event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_event_bus_multiple_receivers() {
        let bus = EventBus::new(10);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.receiver_count(), 2);

        let delivered = bus.send(EngineEvent::OverexposureRejected {
            symbol: Symbol::from_pair("ETHUSDT").unwrap(),
            requested: dec!(700),
            available: dec!(600),
            timestamp: Utc::now(),
        });

        assert_eq!(delivered, 2);
        assert_eq!(first.recv().await.unwrap().unwrap().name(), "overexposure_rejected");
        assert_eq!(second.recv().await.unwrap().unwrap().name(), "overexposure_rejected");
    }

    #[test]
    fn test_send_without_receivers() {
        let bus = EventBus::new(10);
        assert_eq!(bus.send(emergency(Uuid::now_v7())), 0);
    }

    #[tokio::test]
    async fn test_lagged_receiver_reports_missed_events() {
        let bus = EventBus::new(2);
        let mut receiver = bus.subscribe();

        for _ in 0..4 {
            bus.send(emergency(Uuid::now_v7()));
        }

        let lagged = receiver.try_recv().unwrap();
        assert!(lagged.unwrap_err().contains("missed 2"));
        assert_eq!(receiver.drain().len(), 2);
    }

    #[test]
    fn test_close_reason_display() {
        assert_eq!(CloseReason::TrailingStop.to_string(), "trailing_stop");
        assert_eq!(CloseReason::External.to_string(), "external");
    }
}
