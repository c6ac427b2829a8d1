//! Fast Monitor Loop: the protection loop.
//!
//! Runs on its own short interval, independent of the decision loop. Each
//! tick marks every open position to market, runs the trailing stop engine
//! and exits positions whose trailing stop was hit. It never opens
//! positions.
//!
//! Stale ticker data is only used to mark to market; decisions that compute
//! order prices need a fresh price.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use perpguard_domain::{
    evaluate, EngineConfig, Position, PositionPatch, Price, TrailingDecision, TrailingParams,
};
use perpguard_exec::{OrderExecutor, RateLimitedCache, StopKind, StopRequest};
use perpguard_store::PositionStore;

use crate::error::DaemonResult;
use crate::event_bus::{CloseReason, EngineEvent, EventBus};
use crate::exit::{ExitOutcome, PositionCloser};

/// What happened to one position during a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// Position vanished or is no longer open
    Skipped,
    /// Marked with a stale price only
    MarkedStale,
    /// Marked; trailing state unchanged
    Marked,
    /// Trailing state moved (activated, advanced or new extreme)
    Trailed,
    /// Trailing stop hit and position closed
    Closed,
}

/// Outcome of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Open positions at the start of the tick
    pub checked: usize,
    /// Marked to market (fresh or stale)
    pub marked: usize,
    /// Trailing state changes
    pub trailed: usize,
    /// Positions closed on a trailing hit
    pub closed: usize,
    /// Positions whose handling failed
    pub failures: usize,
}

/// The protection loop.
pub struct FastMonitorLoop {
    store: Arc<PositionStore>,
    cache: Arc<RateLimitedCache>,
    executor: Arc<OrderExecutor>,
    closer: Arc<PositionCloser>,
    event_bus: Arc<EventBus>,
    params: TrailingParams,
    interval: Duration,
}

impl FastMonitorLoop {
    /// Create the loop.
    pub fn new(
        store: Arc<PositionStore>,
        cache: Arc<RateLimitedCache>,
        executor: Arc<OrderExecutor>,
        closer: Arc<PositionCloser>,
        event_bus: Arc<EventBus>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            cache,
            executor,
            closer,
            event_bus,
            params: config.trailing_params(),
            interval: config.fast_monitor_interval,
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// A tick in progress always completes before the loop exits.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "Fast monitor loop started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Fast monitor loop received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    debug!(?report, "Fast monitor tick");
                }
            }
        }

        info!("Fast monitor loop stopped");
    }

    /// Process every open position once.
    ///
    /// A failure on one position is logged and does not affect the others.
    pub async fn tick(&self) -> TickReport {
        let positions = self.store.list_open();
        let mut report = TickReport {
            checked: positions.len(),
            ..Default::default()
        };

        for position in positions {
            match self.monitor_position(&position).await {
                Ok(TickAction::Skipped) => {},
                Ok(TickAction::MarkedStale) | Ok(TickAction::Marked) => report.marked += 1,
                Ok(TickAction::Trailed) => {
                    report.marked += 1;
                    report.trailed += 1;
                },
                Ok(TickAction::Closed) => {
                    report.marked += 1;
                    report.closed += 1;
                },
                Err(e) => {
                    warn!(
                        position_id = %position.id,
                        symbol = %position.symbol,
                        error = %e,
                        "Position monitoring failed"
                    );
                    report.failures += 1;
                },
            }
        }

        report
    }

    /// Mark, trail and possibly exit one position.
    pub async fn monitor_position(&self, position: &Position) -> DaemonResult<TickAction> {
        let position_id = position.id;
        let cached = self.cache.get_ticker(&position.symbol).await?;
        let fresh = cached.is_fresh();
        let ticker = cached.value;

        if !self
            .store
            .compound_update(position_id, &PositionPatch::price(ticker.price))
            .await?
        {
            return Ok(TickAction::Skipped);
        }
        if !fresh {
            debug!(%position_id, symbol = %position.symbol, "Stale price, marked only");
            return Ok(TickAction::MarkedStale);
        }

        // Evaluate against the stored state, which includes this mark
        let current = self.store.get(position_id)?;
        if !current.is_open() {
            return Ok(TickAction::Skipped);
        }
        let decision = evaluate(&current, &ticker.observation(), &self.params);

        if let Some(next) = decision.next_state(&current.trailing) {
            let patch = PositionPatch {
                trailing: Some(next),
                ..Default::default()
            };
            if !self.store.compound_update(position_id, &patch).await? {
                return Ok(TickAction::Skipped);
            }
        }

        match decision {
            TrailingDecision::Unchanged | TrailingDecision::ExtremeUpdated { .. } => {
                // A level whose push failed earlier is retried every fresh tick
                if let Some(level) = current.unprotected_trailing_level(self.params.min_change_pct) {
                    debug!(%position_id, symbol = %current.symbol, %level, "Exchange stop behind trailing level");
                    self.push_stop(&current, level).await;
                }
                Ok(match decision {
                    TrailingDecision::Unchanged => TickAction::Marked,
                    _ => TickAction::Trailed,
                })
            },
            TrailingDecision::Activated {
                stop, locked_roe, ..
            } => {
                info!(%position_id, symbol = %current.symbol, %stop, %locked_roe, "Trailing stop activated");
                self.event_bus.send(EngineEvent::TrailingActivated {
                    position_id,
                    symbol: current.symbol.clone(),
                    stop_price: stop,
                    locked_roe,
                    timestamp: Utc::now(),
                });
                if let Some(stop_price) = decision.stop_to_push() {
                    self.push_stop(&current, stop_price).await;
                }
                Ok(TickAction::Trailed)
            },
            TrailingDecision::Advanced {
                previous_stop,
                new_stop,
                locked_roe,
                ..
            } => {
                info!(%position_id, symbol = %current.symbol, %previous_stop, %new_stop, %locked_roe, "Trailing stop advanced");
                self.event_bus.send(EngineEvent::TrailingAdvanced {
                    position_id,
                    symbol: current.symbol.clone(),
                    previous_stop,
                    new_stop,
                    locked_roe,
                    timestamp: Utc::now(),
                });
                if let Some(stop_price) = decision.stop_to_push() {
                    self.push_stop(&current, stop_price).await;
                }
                Ok(TickAction::Trailed)
            },
            TrailingDecision::Hit { stop, trigger_price } => {
                info!(%position_id, symbol = %current.symbol, %stop, %trigger_price, "Trailing stop hit");
                match self.closer.close(&current, CloseReason::TrailingStop).await? {
                    ExitOutcome::Closed { .. } => Ok(TickAction::Closed),
                    ExitOutcome::NotClaimed => Ok(TickAction::Skipped),
                }
            },
        }
    }

    /// Move the exchange stop to the trailing level.
    ///
    /// The internal level is already stored; a failed push is retried on the
    /// next fresh tick and by the safety sweep.
    async fn push_stop(&self, position: &Position, stop_price: Price) {
        let request = StopRequest {
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            stop_price,
            take_profit: position.take_profit_price,
            kind: StopKind::Trailing,
        };

        match self.executor.set_protective_stop(&request).await {
            Ok(placement) => {
                let patch = PositionPatch::stop(placement.stop_price, None);
                if let Err(e) = self.store.compound_update(position.id, &patch).await {
                    warn!(position_id = %position.id, error = %e, "Failed to record trailing stop");
                }
            },
            Err(e) => {
                warn!(
                    position_id = %position.id,
                    symbol = %position.symbol,
                    %stop_price,
                    error = %e,
                    "Failed to push trailing stop to exchange, keeping internal level"
                );
            },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
