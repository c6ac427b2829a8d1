//! Slow Cycle Orchestrator: the decision loop.
//!
//! Each cycle, in order:
//!
//! 1. Sync the ledger balance with the exchange
//! 2. Reconcile the store against the exchange position list
//! 3. Run the safety sweep
//! 4. Pull signals, size and open new positions, install initial stops
//!
//! This loop owns capital deployment. The shutdown signal is checked between
//! phases; a cancelled cycle stops before the next phase starts.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use perpguard_domain::{
    select_candidates, EngineConfig, Position, PositionId, PositionPatch, PositionStatus,
    Quantity, Signal,
};
use perpguard_exec::{
    ExchangeErrorCode, ExchangePosition, ExecError, OrderExecutor, RateLimitedCache,
};
use perpguard_store::{BalanceLedger, CreateOutcome, PositionStore};

use crate::error::DaemonResult;
use crate::event_bus::{EngineEvent, EventBus};
use crate::exit::PositionCloser;
use crate::safety::{Protection, SafetyMonitor, SweepReport};
use crate::signals::SignalSource;

// =============================================================================
// Reports
// =============================================================================

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Known positions refreshed from the exchange
    pub reconciled: usize,
    /// Unknown exchange positions imported
    pub imported: usize,
    /// Local positions the exchange no longer holds
    pub externally_closed: usize,
    /// Exchange list was stale; nothing was changed
    pub skipped: bool,
}

/// Outcome of one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Reconciliation phase
    pub reconcile: ReconcileReport,
    /// Safety sweep phase
    pub sweep: SweepReport,
    /// Positions opened
    pub opened: usize,
    /// Candidates skipped (capacity, sizing, capital)
    pub skipped: usize,
    /// Candidates whose entry failed
    pub failed: usize,
    /// Exchange unreachable; no new entries this cycle
    pub opening_paused: bool,
    /// Shutdown interrupted the cycle
    pub aborted: bool,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// The decision loop.
pub struct SlowCycleOrchestrator {
    store: Arc<PositionStore>,
    ledger: Arc<BalanceLedger>,
    cache: Arc<RateLimitedCache>,
    executor: Arc<OrderExecutor>,
    safety: Arc<SafetyMonitor>,
    closer: Arc<PositionCloser>,
    signals: Arc<dyn SignalSource>,
    event_bus: Arc<EventBus>,
    config: EngineConfig,
}

impl SlowCycleOrchestrator {
    /// Create the orchestrator.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<PositionStore>,
        ledger: Arc<BalanceLedger>,
        cache: Arc<RateLimitedCache>,
        executor: Arc<OrderExecutor>,
        safety: Arc<SafetyMonitor>,
        closer: Arc<PositionCloser>,
        signals: Arc<dyn SignalSource>,
        event_bus: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            cache,
            executor,
            safety,
            closer,
            signals,
            event_bus,
            config,
        }
    }

    /// Run cycles until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            interval_secs = self.config.slow_cycle_interval.as_secs(),
            "Slow cycle orchestrator started"
        );

        let mut ticker = tokio::time::interval(self.config.slow_cycle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Slow cycle received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_cycle(&shutdown).await;
                }
            }
        }

        info!("Slow cycle orchestrator stopped");
    }

    /// Run one full cycle.
    pub async fn run_cycle(&self, shutdown: &CancellationToken) -> CycleReport {
        let mut report = CycleReport::default();

        // 1. Balance
        let balance_ok = match self.sync_balance().await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Balance sync failed, using last known balance");
                false
            },
        };
        if shutdown.is_cancelled() {
            report.aborted = true;
            return report;
        }

        // 2. Reconciliation
        let exchange = match self.reconcile_with_list().await {
            Ok((reconcile, exchange)) => {
                report.reconcile = reconcile;
                exchange
            },
            Err(e) => {
                warn!(error = %e, "Reconciliation failed, monitoring with last known state");
                None
            },
        };
        if !balance_ok && exchange.is_none() {
            warn!("Exchange unreachable, pausing new entries this cycle");
            report.opening_paused = true;
        }
        if shutdown.is_cancelled() {
            report.aborted = true;
            return report;
        }

        // 3. Safety sweep
        report.sweep = self.safety.sweep(exchange.as_deref()).await;
        if shutdown.is_cancelled() {
            report.aborted = true;
            return report;
        }

        // 4. New entries
        if !report.opening_paused {
            self.open_from_signals(shutdown, &mut report).await;
        }

        info!(
            reconciled = report.reconcile.reconciled,
            imported = report.reconcile.imported,
            externally_closed = report.reconcile.externally_closed,
            protected = report.sweep.protected,
            emergency_closed = report.sweep.emergency_closed,
            opened = report.opened,
            skipped = report.skipped,
            failed = report.failed,
            "Slow cycle complete"
        );
        report
    }

    /// Replace the ledger total with the exchange balance.
    pub async fn sync_balance(&self) -> DaemonResult<Decimal> {
        let balance = self.cache.get_balance().await?;
        self.ledger.sync_total_balance(balance);
        debug!(%balance, "Balance synced");
        Ok(balance)
    }

    /// Reconcile the store against the exchange position list.
    ///
    /// Imports unknown positions (never duplicating), refreshes known ones
    /// and settles local positions the exchange no longer holds. Replaying
    /// the same exchange list is idempotent.
    pub async fn reconcile(&self) -> DaemonResult<ReconcileReport> {
        self.reconcile_with_list().await.map(|(report, _)| report)
    }

    async fn reconcile_with_list(&self) -> DaemonResult<(ReconcileReport, Option<Vec<ExchangePosition>>)> {
        let cached = self.cache.get_positions().await?;
        if !cached.is_fresh() {
            warn!(age_ms = cached.age().as_millis() as u64, "Exchange position list is stale, skipping reconciliation");
            return Ok((
                ReconcileReport {
                    skipped: true,
                    ..Default::default()
                },
                None,
            ));
        }
        let report = self.reconcile_snapshot(&cached.value, cached.fetched_at).await?;
        Ok((report, Some(cached.value)))
    }

    /// Reconcile against an exchange list fetched at `fetched_at`.
    ///
    /// A remote position whose symbol and side was closed locally after the
    /// fetch is the closed position itself, not a new one, and is not imported.
    pub async fn reconcile_snapshot(
        &self,
        exchange: &[ExchangePosition],
        fetched_at: Instant,
    ) -> DaemonResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for remote in exchange {
            match self.store.find_open_by_symbol(&remote.symbol, remote.side) {
                Some(local) if local.is_open() => {
                    let patch = PositionPatch {
                        current_price: Some(remote.mark_price),
                        entry_price: (remote.entry_price != local.entry_price).then_some(remote.entry_price),
                        quantity: (remote.quantity != local.quantity).then_some(remote.quantity),
                        ..Default::default()
                    };
                    if self.store.compound_update(local.id, &patch).await? {
                        report.reconciled += 1;
                    }
                },
                // Entry or exit in flight
                Some(_) => {},
                None if self.closer.closed_since(&remote.symbol, remote.side, fetched_at) => {
                    debug!(symbol = %remote.symbol, side = ?remote.side, "Closed after the exchange list was fetched, not importing");
                },
                None => {
                    if self.import(remote).await? {
                        report.imported += 1;
                    }
                },
            }
        }

        for local in self.store.list_open() {
            let present = exchange
                .iter()
                .any(|remote| remote.symbol == local.symbol && remote.side == local.side);
            if !present {
                info!(position_id = %local.id, symbol = %local.symbol, "Position gone from exchange");
                if self.closer.settle_external(&local).await?.is_closed() {
                    report.externally_closed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Resolve positions restored in `Opening` or `Closing`.
    ///
    /// Those still held by the exchange become `Open` with the exchange's
    /// fill; the rest are settled and their margin released. Returns the
    /// number of positions resolved, or zero if the exchange list is stale.
    pub async fn recover_in_flight(&self) -> DaemonResult<usize> {
        let in_flight: Vec<Position> = self
            .store
            .list_live()
            .into_iter()
            .filter(|p| matches!(p.status, PositionStatus::Opening | PositionStatus::Closing))
            .collect();
        if in_flight.is_empty() {
            return Ok(0);
        }

        let cached = self.cache.get_positions().await?;
        if !cached.is_fresh() {
            warn!(
                in_flight = in_flight.len(),
                "Exchange position list is stale, leaving in-flight positions unresolved"
            );
            return Ok(0);
        }

        let mut resolved = 0;
        for position in in_flight {
            let position_id = position.id;
            let remote = cached
                .value
                .iter()
                .find(|r| r.symbol == position.symbol && r.side == position.side);

            match remote {
                Some(remote) => {
                    let patch = PositionPatch {
                        current_price: Some(remote.mark_price),
                        entry_price: Some(remote.entry_price),
                        quantity: Some(remote.quantity),
                        status: Some(PositionStatus::Open),
                        ..Default::default()
                    };
                    if self.store.compound_update(position_id, &patch).await? {
                        info!(
                            %position_id,
                            symbol = %position.symbol,
                            was = ?position.status,
                            entry = %remote.entry_price,
                            quantity = %remote.quantity,
                            "In-flight position held by exchange, resumed as open"
                        );
                        resolved += 1;
                    }
                },
                None => {
                    info!(
                        %position_id,
                        symbol = %position.symbol,
                        was = ?position.status,
                        "In-flight position not on exchange, settling"
                    );
                    if self.closer.settle_unfinished(&position).await.is_closed() {
                        resolved += 1;
                    }
                },
            }
        }

        Ok(resolved)
    }

    async fn import(&self, remote: &ExchangePosition) -> DaemonResult<bool> {
        let leverage = remote.leverage.unwrap_or(self.config.leverage);
        let margin = remote
            .margin
            .unwrap_or_else(|| remote.quantity.notional_at(remote.entry_price) / leverage.as_decimal());

        let allocated = self.ledger.allocate(margin, &format!("import {}", remote.symbol));
        if !allocated {
            let snapshot = self.ledger.snapshot();
            warn!(
                symbol = %remote.symbol,
                side = ?remote.side,
                %margin,
                available = %snapshot.available,
                "Imported position exceeds allocation ceiling, tracking without committed margin"
            );
            self.event_bus.send(EngineEvent::OverexposureRejected {
                symbol: remote.symbol.clone(),
                requested: margin,
                available: snapshot.available,
                timestamp: Utc::now(),
            });
        }
        let committed = if allocated { margin } else { Decimal::ZERO };

        let mut position = Position::imported(
            remote.symbol.clone(),
            remote.side,
            remote.entry_price,
            remote.quantity,
            leverage,
            committed,
            remote.mark_price,
            remote.stop_price,
        );
        position.take_profit_price = remote.take_profit_price;

        match self.store.create_if_absent(position).await? {
            CreateOutcome::Created(position_id) => {
                info!(
                    %position_id,
                    symbol = %remote.symbol,
                    side = ?remote.side,
                    margin = %committed,
                    has_stop = remote.stop_price.is_some(),
                    "Imported exchange position"
                );
                self.event_bus.send(EngineEvent::PositionImported {
                    position_id,
                    symbol: remote.symbol.clone(),
                    side: remote.side,
                    margin: committed,
                    timestamp: Utc::now(),
                });
                Ok(true)
            },
            CreateOutcome::Existing(_) => {
                self.ledger.release(committed);
                Ok(false)
            },
        }
    }

    // =========================================================================
    // Entries
    // =========================================================================

    /// Margin for one new position: an equal slot of the allocation ceiling,
    /// capped at what is still available
    pub fn slot_margin(&self) -> Decimal {
        let snapshot = self.ledger.snapshot();
        let slots = Decimal::from(self.config.max_concurrent_positions.max(1) as u64);
        (snapshot.total * self.config.max_allocation_fraction / slots).min(snapshot.available)
    }

    async fn open_from_signals(&self, shutdown: &CancellationToken, report: &mut CycleReport) {
        let signals = match self.signals.fetch_signals().await {
            Ok(signals) => signals,
            Err(e) => {
                warn!(error = %e, "Signal source failed, no new entries this cycle");
                return;
            },
        };

        let limit = self
            .config
            .max_concurrent_positions
            .saturating_sub(self.store.open_count());
        let candidates = select_candidates(
            &signals,
            self.config.confidence_threshold,
            &self.store.held_symbols(),
            limit,
        );
        debug!(signals = signals.len(), candidates = candidates.len(), limit, "Signals ranked");

        for signal in candidates {
            if shutdown.is_cancelled() {
                report.aborted = true;
                return;
            }
            match self.open_candidate(&signal).await {
                Ok(Some(_)) => report.opened += 1,
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    warn!(symbol = %signal.symbol, direction = ?signal.direction, error = %e, "Entry failed, moving to next candidate");
                    report.failed += 1;
                },
            }
        }
    }

    /// Size, reserve, enter and protect one candidate.
    ///
    /// Returns `Ok(None)` if the candidate was skipped. On any failure after
    /// the reservation, the reservation is released before returning.
    pub async fn open_candidate(&self, signal: &Signal) -> DaemonResult<Option<PositionId>> {
        let symbol = &signal.symbol;
        let side = signal.direction;
        let leverage = self.config.leverage;

        if self.store.open_count() >= self.config.max_concurrent_positions {
            debug!(symbol = %symbol, "At position capacity");
            return Ok(None);
        }

        let margin = self.slot_margin();
        if margin < self.config.min_position_margin {
            debug!(symbol = %symbol, %margin, "Slot margin below minimum, skipping");
            return Ok(None);
        }

        let price = self.executor.fresh_price(symbol).await?;
        let raw_quantity = (margin * leverage.as_decimal() / price.as_decimal())
            .round_dp_with_strategy(8, RoundingStrategy::ToZero);
        let Ok(quantity) = Quantity::new(raw_quantity) else {
            debug!(symbol = %symbol, %margin, %price, "Sized quantity is zero, skipping");
            return Ok(None);
        };
        if quantity.notional_at(price) < self.config.min_position_notional {
            debug!(symbol = %symbol, %quantity, "Notional below minimum, skipping");
            return Ok(None);
        }

        let Some(reservation) = self.ledger.reserve(margin, &symbol.as_pair()) else {
            let available = self.ledger.snapshot().available;
            warn!(symbol = %symbol, requested = %margin, %available, "Entry rejected: overexposure");
            self.event_bus.send(EngineEvent::OverexposureRejected {
                symbol: symbol.clone(),
                requested: margin,
                available,
                timestamp: Utc::now(),
            });
            return Ok(None);
        };

        let pending = Position::new(symbol.clone(), side, price, quantity, leverage, margin);
        let position_id = pending.id;
        if let Err(e) = self.store.create(pending).await {
            self.ledger.release_reservation(&reservation);
            return Err(e.into());
        }

        let fill = match self.executor.open_position(symbol, side, quantity, leverage).await {
            Ok(fill) => fill,
            Err(e) => {
                self.ledger.release_reservation(&reservation);
                self.store.remove(position_id).await;
                self.report_entry_failure(signal, &e);
                return Err(e.into());
            },
        };

        if !self.ledger.commit_reservation(&reservation) {
            error!(%position_id, reservation_id = %reservation.id, "Reservation already settled at fill");
        }
        let patch = PositionPatch {
            current_price: Some(fill.filled_price),
            entry_price: Some(fill.filled_price),
            quantity: Some(fill.quantity),
            status: Some(PositionStatus::Open),
            ..Default::default()
        };
        self.store.compound_update(position_id, &patch).await?;

        info!(
            %position_id,
            symbol = %symbol,
            ?side,
            entry = %fill.filled_price,
            quantity = %fill.quantity,
            %margin,
            confidence = %signal.confidence,
            "Position opened"
        );
        self.event_bus.send(EngineEvent::PositionOpened {
            position_id,
            symbol: symbol.clone(),
            side,
            entry_price: fill.filled_price,
            quantity: fill.quantity,
            margin,
            timestamp: Utc::now(),
        });

        let position = self.store.get(position_id)?;
        match self.safety.protect(&position).await? {
            Protection::Installed { stop_price } => {
                debug!(%position_id, %stop_price, "Initial stop in place");
            },
            Protection::EmergencyClosed => {
                warn!(%position_id, "New position could not be protected and was closed");
            },
            Protection::Unprotected => {
                error!(%position_id, "New position unprotected, safety sweep will retry");
            },
        }

        Ok(Some(position_id))
    }

    fn report_entry_failure(&self, signal: &Signal, error: &ExecError) {
        match error {
            ExecError::RetriesExhausted { .. } => {
                self.event_bus.send(EngineEvent::RetriesExhausted {
                    position_id: None,
                    symbol: signal.symbol.clone(),
                    error: error.to_string(),
                    timestamp: Utc::now(),
                });
            },
            e if e.code() == Some(ExchangeErrorCode::BelowMinimumSize) => {
                warn!(symbol = %signal.symbol, "Order below exchange minimum size, candidate skipped");
            },
            e if e.code() == Some(ExchangeErrorCode::Timeout) => {
                warn!(symbol = %signal.symbol, "Entry outcome unknown, reconciliation will pick up a fill");
            },
            _ => {},
        }
    }

    /// Cycle interval
    pub fn interval(&self) -> Duration {
        self.config.slow_cycle_interval
    }
}

// =============================================================================
// Tests
// =============================================================================
