//! Safety Monitor: every open position carries a protective stop.
//!
//! Each sweep, for every open position:
//!
//! ```text
//! below size floor?          → close (BelowMinimum)
//! trailing level ahead of stop → reinstall at the trailing level
//! stop known and on exchange → nothing to do
//! stop only on exchange      → adopt it
//! otherwise                  → install stop, up to N attempts
//!                              still unprotected → force-close (Emergency)
//! ```
//!
//! Forced closes that fail are retried on the next sweep. The emergency
//! record is published only by the sweep that actually closed the position,
//! so there is never more than one per position.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use perpguard_domain::{
    EngineConfig, Position, PositionPatch, Price, Side, TrailingPhase,
};
use perpguard_exec::{ExchangePosition, ExecError, OrderExecutor, StopKind, StopRequest};
use perpguard_store::PositionStore;

use crate::error::DaemonResult;
use crate::event_bus::{CloseReason, EngineEvent, EventBus};
use crate::exit::{ExitOutcome, PositionCloser};

// =============================================================================
// Configuration
// =============================================================================

/// Safety monitor configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyConfig {
    /// Default stop distance from entry (0.02 = 2%)
    pub initial_stop_pct: Decimal,
    /// Optional take-profit distance from entry
    pub initial_take_profit_pct: Option<Decimal>,
    /// Minimum viable margin
    pub min_position_margin: Decimal,
    /// Minimum viable notional
    pub min_position_notional: Decimal,
    /// Stop installation attempts before a forced close
    pub max_stop_attempts: u32,
    /// Gap between trailing level and stop tolerated before a reinstall
    pub trailing_min_change_pct: Decimal,
}

impl From<&EngineConfig> for SafetyConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            initial_stop_pct: config.initial_stop_pct,
            initial_take_profit_pct: config.initial_take_profit_pct,
            min_position_margin: config.min_position_margin,
            min_position_notional: config.min_position_notional,
            max_stop_attempts: config.max_stop_attempts,
            trailing_min_change_pct: config.trailing_min_change_pct,
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Result of protecting one position
#[derive(Debug, Clone, PartialEq)]
pub enum Protection {
    /// A stop was installed
    Installed {
        /// Stop accepted by the exchange
        stop_price: Price,
    },
    /// Could not be protected; force-closed
    EmergencyClosed,
    /// Could not be protected and the forced close failed or was not ours
    Unprotected,
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Open positions examined
    pub checked: usize,
    /// Stops installed this sweep
    pub protected: usize,
    /// Positions already carrying a stop
    pub already_protected: usize,
    /// Stops adopted from the exchange
    pub adopted: usize,
    /// Closed for falling below the size floor
    pub closed_below_floor: usize,
    /// Force-closed after failing to install a stop
    pub emergency_closed: usize,
    /// Positions left unprotected or failed to close
    pub failures: usize,
}

// =============================================================================
// Safety Monitor
// =============================================================================

/// Guarantees protective stops, force-closing what it cannot protect.
pub struct SafetyMonitor {
    store: Arc<PositionStore>,
    executor: Arc<OrderExecutor>,
    closer: Arc<PositionCloser>,
    event_bus: Arc<EventBus>,
    config: SafetyConfig,
}

impl SafetyMonitor {
    /// Create a safety monitor.
    pub fn new(
        store: Arc<PositionStore>,
        executor: Arc<OrderExecutor>,
        closer: Arc<PositionCloser>,
        event_bus: Arc<EventBus>,
        config: SafetyConfig,
    ) -> Self {
        Self {
            store,
            executor,
            closer,
            event_bus,
            config,
        }
    }

    /// Default stop for a position: `initial_stop_pct` beyond entry
    pub fn default_stop(&self, side: Side, entry: Price) -> Option<Price> {
        let offset = entry.as_decimal() * self.config.initial_stop_pct;
        let raw = match side {
            Side::Long => entry.as_decimal() - offset,
            Side::Short => entry.as_decimal() + offset,
        };
        Price::new(raw).ok()
    }

    fn default_take_profit(&self, side: Side, entry: Price) -> Option<Price> {
        let pct = self.config.initial_take_profit_pct?;
        let offset = entry.as_decimal() * pct;
        let raw = match side {
            Side::Long => entry.as_decimal() + offset,
            Side::Short => entry.as_decimal() - offset,
        };
        Price::new(raw).ok()
    }

    fn is_viable(&self, position: &Position) -> bool {
        position.implied_margin() >= self.config.min_position_margin
            && position.notional() >= self.config.min_position_notional
    }

    /// Check every open position.
    ///
    /// `exchange` is the exchange's position list when a fresh one is
    /// available; without it only positions with no known stop are acted on.
    pub async fn sweep(&self, exchange: Option<&[ExchangePosition]>) -> SweepReport {
        let mut report = SweepReport::default();

        for position in self.store.list_open() {
            report.checked += 1;
            let position_id = position.id;

            if !self.is_viable(&position) {
                warn!(
                    %position_id,
                    symbol = %position.symbol,
                    notional = %position.notional(),
                    margin = %position.implied_margin(),
                    "Position below minimum viable size, closing"
                );
                match self.closer.close(&position, CloseReason::BelowMinimum).await {
                    Ok(ExitOutcome::Closed { .. }) => report.closed_below_floor += 1,
                    Ok(ExitOutcome::NotClaimed) => {},
                    Err(e) => {
                        error!(%position_id, error = %e, "Failed to close undersized position");
                        report.failures += 1;
                    },
                }
                continue;
            }

            let reported = exchange.map(|positions| {
                positions
                    .iter()
                    .find(|p| p.symbol == position.symbol && p.side == position.side)
                    .and_then(|p| p.stop_price)
            });

            let lagging = position.unprotected_trailing_level(self.config.trailing_min_change_pct);

            match (position.protective_stop_price, reported) {
                _ if lagging.is_some() => {
                    warn!(
                        %position_id,
                        symbol = %position.symbol,
                        stop = ?position.protective_stop_price.map(|p| p.as_decimal()),
                        trailing_level = ?lagging.map(|p| p.as_decimal()),
                        "Protective stop behind trailing level, reinstalling"
                    );
                },
                // Known locally and confirmed (or no exchange view this sweep)
                (Some(_), Some(Some(_))) | (Some(_), None) => {
                    report.already_protected += 1;
                    continue;
                },
                // Exchange carries a stop the store does not know about
                (None, Some(Some(stop))) => {
                    match self.store.compound_update(position_id, &PositionPatch::stop(stop, None)).await {
                        Ok(true) => {
                            info!(%position_id, symbol = %position.symbol, %stop, "Adopted stop reported by exchange");
                            report.adopted += 1;
                        },
                        Ok(false) => {},
                        Err(e) => {
                            warn!(%position_id, error = %e, "Failed to adopt exchange stop");
                            report.failures += 1;
                        },
                    }
                    continue;
                },
                (Some(stop), Some(None)) => {
                    warn!(%position_id, symbol = %position.symbol, %stop, "Stop missing on exchange, reinstalling");
                },
                (None, _) => {
                    warn!(%position_id, symbol = %position.symbol, "Position has no protective stop");
                },
            }

            match self.protect(&position).await {
                Ok(Protection::Installed { .. }) => report.protected += 1,
                Ok(Protection::EmergencyClosed) => report.emergency_closed += 1,
                Ok(Protection::Unprotected) => report.failures += 1,
                Err(e) => {
                    error!(%position_id, error = %e, "Protection failed");
                    report.failures += 1;
                },
            }
        }

        if report.failures > 0 || report.emergency_closed > 0 {
            warn!(?report, "Safety sweep finished with interventions");
        } else {
            debug!(?report, "Safety sweep finished");
        }
        report
    }

    /// Install a protective stop, force-closing on repeated failure.
    ///
    /// With trailing active, installs the more favorable of the stored stop
    /// and the trailing level. Otherwise reinstalls the stored stop, or the
    /// default stop from entry.
    pub async fn protect(&self, position: &Position) -> DaemonResult<Protection> {
        let position_id = position.id;
        let trailing = position.trailing.phase == TrailingPhase::Active;
        let trailing_level = position.trailing.current_stop_level.filter(|_| trailing);

        let stored = match (position.protective_stop_price, trailing_level) {
            (Some(stop), Some(level)) => Some(position.side.most_favorable(stop, level)),
            (stop, level) => stop.or(level),
        };
        let Some(stop_price) = stored.or_else(|| self.default_stop(position.side, position.entry_price))
        else {
            return self.emergency_close(position, "no valid default stop".to_string()).await;
        };

        let request = StopRequest {
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            stop_price,
            take_profit: position
                .take_profit_price
                .or_else(|| self.default_take_profit(position.side, position.entry_price)),
            kind: if trailing { StopKind::Trailing } else { StopKind::Initial },
        };

        let max_attempts = self.config.max_stop_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.executor.set_protective_stop(&request).await {
                Ok(placement) => {
                    self.store
                        .compound_update(
                            position_id,
                            &PositionPatch::stop(placement.stop_price, placement.take_profit),
                        )
                        .await?;
                    info!(
                        %position_id,
                        symbol = %position.symbol,
                        stop = %placement.stop_price,
                        corrected = placement.corrected,
                        attempt,
                        "Protective stop installed"
                    );
                    self.event_bus.send(EngineEvent::StopInstalled {
                        position_id,
                        symbol: position.symbol.clone(),
                        stop_price: placement.stop_price,
                        corrected: placement.corrected,
                        timestamp: Utc::now(),
                    });
                    return Ok(Protection::Installed {
                        stop_price: placement.stop_price,
                    });
                },
                Err(e) => {
                    warn!(
                        %position_id,
                        symbol = %position.symbol,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Protective stop attempt failed"
                    );
                    if matches!(e, ExecError::RetriesExhausted { .. }) {
                        self.event_bus.send(EngineEvent::RetriesExhausted {
                            position_id: Some(position_id),
                            symbol: position.symbol.clone(),
                            error: e.to_string(),
                            timestamp: Utc::now(),
                        });
                    }
                    last_error = e.to_string();
                },
            }
        }

        self.emergency_close(
            position,
            format!("stop not accepted after {max_attempts} attempts: {last_error}"),
        )
        .await
    }

    async fn emergency_close(&self, position: &Position, reason: String) -> DaemonResult<Protection> {
        let position_id = position.id;
        error!(%position_id, symbol = %position.symbol, %reason, "Unprotectable position, forcing closure");

        match self.closer.close(position, CloseReason::Emergency).await {
            Ok(ExitOutcome::Closed { .. }) => {
                error!(%position_id, symbol = %position.symbol, %reason, "Emergency closure executed");
                self.event_bus.send(EngineEvent::EmergencyClosure {
                    position_id,
                    symbol: position.symbol.clone(),
                    reason,
                    timestamp: Utc::now(),
                });
                Ok(Protection::EmergencyClosed)
            },
            Ok(ExitOutcome::NotClaimed) => Ok(Protection::Unprotected),
            Err(e) => {
                error!(%position_id, error = %e, "Emergency closure failed, retrying next sweep");
                Ok(Protection::Unprotected)
            },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
