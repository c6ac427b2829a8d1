//! Position exits shared by both loops and the safety sweep.
//!
//! Closing is claimed with a status compare-and-set (`Open → Closing`), so
//! when the fast loop and the safety sweep race on the same position exactly
//! one of them submits the exit, removes the position and releases its
//! margin. A failed exit reverts the claim so the next pass can retry.
//!
//! Recent closes are remembered per symbol and side so reconciliation can
//! tell an exchange snapshot taken before a close from a new position.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{error, info, warn};

use perpguard_domain::{Position, PositionStatus, Price, Side, Symbol};
use perpguard_exec::{CloseOutcome, OrderExecutor};
use perpguard_store::{BalanceLedger, PositionStore};

use crate::error::DaemonResult;
use crate::event_bus::{CloseReason, EngineEvent, EventBus};

/// How long a close is remembered for snapshot comparisons
const RECENT_CLOSE_RETENTION: Duration = Duration::from_secs(600);

/// Result of a close attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ExitOutcome {
    /// This caller closed the position and released its margin
    Closed {
        /// Position as archived
        position: Position,
        /// Fill price, if the exchange filled an exit
        exit_price: Option<Price>,
    },
    /// Another caller owns the close, or the position is already gone
    NotClaimed,
}

impl ExitOutcome {
    /// True for `Closed`
    pub fn is_closed(&self) -> bool {
        matches!(self, ExitOutcome::Closed { .. })
    }
}

/// Closes positions on the exchange and settles local state.
pub struct PositionCloser {
    store: Arc<PositionStore>,
    ledger: Arc<BalanceLedger>,
    executor: Arc<OrderExecutor>,
    event_bus: Arc<EventBus>,
    recent_closes: Mutex<HashMap<(Symbol, Side), Instant>>,
}

impl PositionCloser {
    /// Create a closer.
    pub fn new(
        store: Arc<PositionStore>,
        ledger: Arc<BalanceLedger>,
        executor: Arc<OrderExecutor>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            ledger,
            executor,
            event_bus,
            recent_closes: Mutex::new(HashMap::new()),
        }
    }

    /// Close an open position at market.
    ///
    /// # Errors
    /// Returns the executor error if the exit failed; the position is back to
    /// `Open` so a later pass can retry.
    pub async fn close(&self, position: &Position, reason: CloseReason) -> DaemonResult<ExitOutcome> {
        let position_id = position.id;
        if !self
            .store
            .try_transition(position_id, PositionStatus::Open, PositionStatus::Closing)
            .await?
        {
            return Ok(ExitOutcome::NotClaimed);
        }

        info!(%position_id, symbol = %position.symbol, side = ?position.side, %reason, "Closing position");

        let exit_price = match self.executor.close_position(&position.symbol, position.quantity).await {
            Ok(CloseOutcome::Filled(fill)) => Some(fill.filled_price),
            Ok(CloseOutcome::AlreadyClosed) => None,
            Err(e) => {
                error!(%position_id, symbol = %position.symbol, %reason, error = %e, "Exit failed, position stays open");
                if let Err(revert) = self
                    .store
                    .try_transition(position_id, PositionStatus::Closing, PositionStatus::Open)
                    .await
                {
                    error!(%position_id, error = %revert, "Failed to revert closing claim");
                }
                if matches!(e, perpguard_exec::ExecError::RetriesExhausted { .. }) {
                    self.event_bus.send(EngineEvent::RetriesExhausted {
                        position_id: Some(position_id),
                        symbol: position.symbol.clone(),
                        error: e.to_string(),
                        timestamp: Utc::now(),
                    });
                }
                return Err(e.into());
            },
        };

        Ok(self.settle(position, reason, exit_price).await)
    }

    /// Settle a position the exchange no longer holds.
    ///
    /// Used by reconciliation when a stop triggered on the exchange or the
    /// position was closed by hand.
    pub async fn settle_external(&self, position: &Position) -> DaemonResult<ExitOutcome> {
        if !self
            .store
            .try_transition(position.id, PositionStatus::Open, PositionStatus::Closing)
            .await?
        {
            return Ok(ExitOutcome::NotClaimed);
        }
        Ok(self.settle(position, CloseReason::External, None).await)
    }

    /// Settle a position restored mid-transition that the exchange does not hold.
    ///
    /// No claim is taken: an `Opening` or `Closing` position is never owned by
    /// a running pass after a restart.
    pub async fn settle_unfinished(&self, position: &Position) -> ExitOutcome {
        self.settle(position, CloseReason::External, None).await
    }

    /// True if this symbol and side was closed at or after `since`.
    pub fn closed_since(&self, symbol: &Symbol, side: Side, since: Instant) -> bool {
        self.recent_closes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(symbol.clone(), side))
            .is_some_and(|closed_at| *closed_at >= since)
    }

    fn record_close(&self, symbol: &Symbol, side: Side) {
        let now = Instant::now();
        let mut recent = self.recent_closes.lock().unwrap_or_else(|e| e.into_inner());
        recent.retain(|_, closed_at| now.duration_since(*closed_at) < RECENT_CLOSE_RETENTION);
        recent.insert((symbol.clone(), side), now);
    }

    async fn settle(&self, position: &Position, reason: CloseReason, exit_price: Option<Price>) -> ExitOutcome {
        // Only the caller that removes the position releases its margin
        let Some(removed) = self.store.remove(position.id).await else {
            warn!(position_id = %position.id, "Position vanished while closing");
            return ExitOutcome::NotClaimed;
        };
        self.ledger.release(removed.margin_committed);
        self.record_close(&removed.symbol, removed.side);

        info!(
            position_id = %removed.id,
            symbol = %removed.symbol,
            %reason,
            exit_price = ?exit_price.map(|p| p.as_decimal()),
            released = %removed.margin_committed,
            "Position closed"
        );
        self.event_bus.send(EngineEvent::PositionClosed {
            position_id: removed.id,
            symbol: removed.symbol.clone(),
            side: removed.side,
            reason,
            exit_price,
            timestamp: Utc::now(),
        });

        ExitOutcome::Closed {
            position: removed,
            exit_price,
        }
    }
}
