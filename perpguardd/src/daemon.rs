//! Daemon: Main runtime orchestrator.
//!
//! The Daemon ties together all components:
//! - Position Store and Balance Ledger (shared state)
//! - Rate-Limited Cache and Order Executor (exchange access)
//! - Safety Monitor and Position Closer (protection, exits)
//! - Fast Monitor Loop and Slow Cycle Orchestrator (the two loops)
//! - Event Bus and Metrics
//!
//! # Lifecycle
//!
//! 1. Load configuration
//! 2. Initialize components
//! 3. Restore live positions from the journal, re-commit their margin
//! 4. Reconcile against the exchange
//! 5. Run both loops concurrently
//! 6. Graceful shutdown on SIGINT: in-flight ticks complete, then exit

use std::sync::Arc;

use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use perpguard_exec::{
    CacheConfig, ExchangeGateway, ExecutorConfig, OrderExecutor, RateLimitedCache, StubGateway,
};
use perpguard_store::{BalanceLedger, FileJournal, MemoryJournal, PositionJournal, PositionStore};

use crate::config::Config;
use crate::error::{DaemonError, DaemonResult};
use crate::event_bus::EventBus;
use crate::exit::PositionCloser;
use crate::fast_loop::FastMonitorLoop;
use crate::metrics::Metrics;
use crate::safety::{SafetyConfig, SafetyMonitor};
use crate::signals::{SignalSource, StaticSignalSource};
use crate::slow_cycle::SlowCycleOrchestrator;

// =============================================================================
// Daemon
// =============================================================================

/// The main perpguard daemon.
pub struct Daemon {
    /// Configuration
    config: Config,
    /// Durable position snapshots
    journal: Arc<dyn PositionJournal>,
    /// Live positions
    store: Arc<PositionStore>,
    /// Capital accounting
    ledger: Arc<BalanceLedger>,
    /// Exchange reads and writes
    cache: Arc<RateLimitedCache>,
    /// Event bus
    event_bus: Arc<EventBus>,
    /// Prometheus counters fed from the bus
    metrics: Arc<Metrics>,
    /// Protective stops and forced closes
    safety: Arc<SafetyMonitor>,
    /// Protection loop
    fast_loop: Arc<FastMonitorLoop>,
    /// Decision loop
    slow_cycle: Arc<SlowCycleOrchestrator>,
}

impl Daemon {
    /// Create a daemon against the stub exchange (for testing/development).
    pub fn new_stub(config: Config, journal: Arc<dyn PositionJournal>) -> DaemonResult<Self> {
        let gateway = Arc::new(StubGateway::new(config.stub_balance));
        Self::new(config, gateway, journal, Arc::new(StaticSignalSource::empty()))
    }

    /// Create a daemon with the provided exchange, journal and signal source.
    ///
    /// # Errors
    /// - `Config` if the engine configuration is invalid
    pub fn new(
        config: Config,
        gateway: Arc<dyn ExchangeGateway>,
        journal: Arc<dyn PositionJournal>,
        signals: Arc<dyn SignalSource>,
    ) -> DaemonResult<Self> {
        config
            .engine
            .validate()
            .map_err(|e| DaemonError::Config(e.to_string()))?;
        let engine = &config.engine;

        let cache = Arc::new(RateLimitedCache::new(gateway, CacheConfig::from(engine)));
        let executor = Arc::new(OrderExecutor::new(cache.clone(), ExecutorConfig::from(engine)));
        let store = Arc::new(PositionStore::new(journal.clone()));
        // Total is synced from the exchange during restore
        let ledger = Arc::new(BalanceLedger::new(Decimal::ZERO, engine.max_allocation_fraction));
        let event_bus = Arc::new(EventBus::default());
        let metrics = Arc::new(Metrics::new()?);

        let closer = Arc::new(PositionCloser::new(
            store.clone(),
            ledger.clone(),
            executor.clone(),
            event_bus.clone(),
        ));
        let safety = Arc::new(SafetyMonitor::new(
            store.clone(),
            executor.clone(),
            closer.clone(),
            event_bus.clone(),
            SafetyConfig::from(engine),
        ));
        let fast_loop = Arc::new(FastMonitorLoop::new(
            store.clone(),
            cache.clone(),
            executor.clone(),
            closer.clone(),
            event_bus.clone(),
            engine,
        ));
        let slow_cycle = Arc::new(SlowCycleOrchestrator::new(
            store.clone(),
            ledger.clone(),
            cache.clone(),
            executor,
            safety.clone(),
            closer,
            signals,
            event_bus.clone(),
            engine.clone(),
        ));

        Ok(Self {
            config,
            journal,
            store,
            ledger,
            cache,
            event_bus,
            metrics,
            safety,
            fast_loop,
            slow_cycle,
        })
    }

    /// Open the journal the configuration asks for.
    ///
    /// Postgres when built with the `postgres` feature and a database URL is
    /// set, otherwise a JSON-lines file if a path is set, otherwise memory.
    pub async fn open_journal(config: &Config) -> DaemonResult<Arc<dyn PositionJournal>> {
        #[cfg(feature = "postgres")]
        {
            if let Some(url) = &config.database_url {
                let journal = perpguard_store::PgJournal::connect(url).await?;
                info!("Using Postgres journal");
                return Ok(Arc::new(journal));
            }
        }

        #[cfg(not(feature = "postgres"))]
        {
            if config.database_url.is_some() {
                warn!("PERPGUARD_DATABASE_URL set but built without the postgres feature, ignoring");
            }
        }

        match &config.journal_path {
            Some(path) => {
                info!(path = %path.display(), "Using file journal");
                Ok(Arc::new(FileJournal::new(path.clone())))
            },
            None => {
                warn!("No journal configured, positions will not survive a restart");
                Ok(Arc::new(MemoryJournal::new()))
            },
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Position store
    pub fn store(&self) -> &Arc<PositionStore> {
        &self.store
    }

    /// Balance ledger
    pub fn ledger(&self) -> &Arc<BalanceLedger> {
        &self.ledger
    }

    /// Rate-limited cache
    pub fn cache(&self) -> &Arc<RateLimitedCache> {
        &self.cache
    }

    /// Event bus
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Metrics
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Safety monitor
    pub fn safety(&self) -> &Arc<SafetyMonitor> {
        &self.safety
    }

    /// Fast monitor loop
    pub fn fast_loop(&self) -> &Arc<FastMonitorLoop> {
        &self.fast_loop
    }

    /// Slow cycle orchestrator
    pub fn slow_cycle(&self) -> &Arc<SlowCycleOrchestrator> {
        &self.slow_cycle
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Restore live positions from the journal and reconcile.
    ///
    /// Returns how many positions were restored. A failed first reconcile is
    /// logged; the next slow cycle retries it.
    pub async fn restore(&self) -> DaemonResult<usize> {
        let snapshots = self.journal.load_live().await?;
        let restored = self.store.restore(snapshots);

        if let Err(e) = self.slow_cycle.sync_balance().await {
            warn!(error = %e, "Initial balance sync failed");
        }

        for position in &restored {
            if position.margin_committed.is_zero() {
                continue;
            }
            if !self.ledger.allocate(position.margin_committed, "restore") {
                warn!(
                    position_id = %position.id,
                    symbol = %position.symbol,
                    margin = %position.margin_committed,
                    "Restored margin exceeds allocation ceiling"
                );
            }
        }

        if restored.is_empty() {
            info!("No live positions to restore");
        } else {
            info!(count = restored.len(), "Restored live positions from journal");
        }

        match self.slow_cycle.recover_in_flight().await {
            Ok(0) => {},
            Ok(resolved) => info!(resolved, "Resolved positions restored mid-transition"),
            Err(e) => warn!(error = %e, "In-flight recovery failed"),
        }

        match self.slow_cycle.reconcile().await {
            Ok(report) => info!(
                reconciled = report.reconciled,
                imported = report.imported,
                externally_closed = report.externally_closed,
                "Startup reconciliation complete"
            ),
            Err(e) => warn!(error = %e, "Startup reconciliation failed"),
        }

        Ok(restored.len())
    }

    /// Run the daemon.
    ///
    /// This method blocks until shutdown is requested (SIGINT).
    pub async fn run(self) -> DaemonResult<()> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            environment = %self.config.environment,
            "Starting perpguard daemon"
        );

        self.restore().await?;

        let shutdown = CancellationToken::new();
        let watcher = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("Received shutdown signal");
                        shutdown.cancel();
                    },
                    Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
                }
            })
        };

        let result = self.run_until(shutdown).await;
        watcher.abort();
        result
    }

    /// Run both loops until `shutdown` is cancelled, then wait for them.
    pub async fn run_until(&self, shutdown: CancellationToken) -> DaemonResult<()> {
        let recorder = self.metrics.clone().spawn_recorder(&self.event_bus, shutdown.clone());
        let fast = tokio::spawn(self.fast_loop.clone().run(shutdown.clone()));
        let slow = tokio::spawn(self.slow_cycle.clone().run(shutdown.clone()));
        info!("Loops started");

        shutdown.cancelled().await;
        info!("Shutting down, waiting for loops to finish");

        for (task, handle) in [("fast_loop", fast), ("slow_cycle", slow), ("metrics", recorder)] {
            handle
                .await
                .map_err(|e| DaemonError::Task(format!("{task}: {e}")))?;
        }

        let snapshot = self.ledger.snapshot();
        info!(
            live_positions = self.store.list_live().len(),
            allocated = %snapshot.allocated,
            total = %snapshot.total,
            "Shutdown complete"
        );
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use perpguard_domain::{OrderSide, Position, PositionStatus, Price, Quantity, Side, Symbol};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = Config::test();
        config.engine.max_allocation_fraction = dec!(1.5);
        let result = Daemon::new_stub(config, Arc::new(MemoryJournal::new()));
        assert!(matches!(result, Err(DaemonError::Config(_))));
    }

    #[tokio::test]
    async fn test_open_journal_defaults_to_memory() {
        let journal = Daemon::open_journal(&Config::test()).await.unwrap();
        assert!(journal.load_live().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_recommits_margin() {
        let symbol = Symbol::from_pair("BTCUSDT").unwrap();
        let gateway = Arc::new(StubGateway::new(dec!(1000)));
        gateway.set_price(&symbol, dec!(45000));
        gateway
            .place_market_order(&symbol, OrderSide::Buy, Quantity::new(dec!(0.02)).unwrap())
            .await
            .unwrap();

        let journal = Arc::new(MemoryJournal::new());
        let mut position = Position::new(
            symbol,
            Side::Long,
            Price::new(dec!(45000)).unwrap(),
            Quantity::new(dec!(0.02)).unwrap(),
            Config::test().engine.leverage,
            dec!(112.5),
        );
        position.status = PositionStatus::Open;
        journal.record(&position).await.unwrap();

        let daemon = Daemon::new(
            Config::test(),
            gateway,
            journal,
            Arc::new(StaticSignalSource::empty()),
        )
        .unwrap();
        let restored = daemon.restore().await.unwrap();

        assert_eq!(restored, 1);
        let snapshot = daemon.ledger().snapshot();
        assert_eq!(snapshot.total, dec!(1000));
        assert_eq!(snapshot.allocated, dec!(112.5));
        // Still on the exchange, so reconciliation keeps it
        let live = daemon.store().list_live();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, position.id);
    }

    #[tokio::test]
    async fn test_restore_settles_positions_missing_on_exchange() {
        let journal = Arc::new(MemoryJournal::new());
        let mut position = Position::new(
            Symbol::from_pair("ETHUSDT").unwrap(),
            Side::Long,
            Price::new(dec!(3000)).unwrap(),
            Quantity::new(dec!(0.3)).unwrap(),
            Config::test().engine.leverage,
            dec!(112.5),
        );
        position.status = PositionStatus::Open;
        journal.record(&position).await.unwrap();

        let daemon = Daemon::new_stub(Config::test(), journal.clone()).unwrap();
        daemon.restore().await.unwrap();

        assert!(daemon.store().list_live().is_empty());
        assert_eq!(daemon.ledger().snapshot().allocated, dec!(0));
        assert!(journal.is_archived(position.id));
    }

    #[tokio::test]
    async fn test_restore_resumes_filled_opening_position() {
        let symbol = Symbol::from_pair("BTCUSDT").unwrap();
        let gateway = Arc::new(StubGateway::new(dec!(1000)));
        gateway.set_price(&symbol, dec!(45000));
        gateway
            .place_market_order(&symbol, OrderSide::Buy, Quantity::new(dec!(0.02)).unwrap())
            .await
            .unwrap();

        // Stopped between the entry fill and the status change
        let journal = Arc::new(MemoryJournal::new());
        let position = Position::new(
            symbol.clone(),
            Side::Long,
            Price::new(dec!(45000)).unwrap(),
            Quantity::new(dec!(0.02)).unwrap(),
            Config::test().engine.leverage,
            dec!(112.5),
        );
        journal.record(&position).await.unwrap();

        let daemon = Daemon::new(
            Config::test(),
            gateway.clone(),
            journal,
            Arc::new(StaticSignalSource::empty()),
        )
        .unwrap();
        daemon.restore().await.unwrap();
        let report = daemon.safety().sweep(None).await;

        let live = daemon.store().list_live();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, position.id);
        assert_eq!(live[0].status, PositionStatus::Open);
        assert_eq!(report.protected, 1);
        assert!(gateway.position(&symbol).unwrap().stop_price.is_some());
        assert_eq!(daemon.ledger().snapshot().allocated, dec!(112.5));
    }

    #[tokio::test]
    async fn test_restore_settles_unfinished_close() {
        // Stopped after the exit filled but before the position was removed
        let journal = Arc::new(MemoryJournal::new());
        let mut position = Position::new(
            Symbol::from_pair("ETHUSDT").unwrap(),
            Side::Long,
            Price::new(dec!(3000)).unwrap(),
            Quantity::new(dec!(0.3)).unwrap(),
            Config::test().engine.leverage,
            dec!(112.5),
        );
        position.status = PositionStatus::Closing;
        journal.record(&position).await.unwrap();

        let daemon = Daemon::new_stub(Config::test(), journal.clone()).unwrap();
        daemon.restore().await.unwrap();

        assert!(daemon.store().list_live().is_empty());
        assert_eq!(daemon.ledger().snapshot().allocated, dec!(0));
        assert!(journal.is_archived(position.id));
    }

    #[tokio::test]
    async fn test_run_until_stops_on_cancel() {
        let daemon = Daemon::new_stub(Config::test(), Arc::new(MemoryJournal::new())).unwrap();
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), daemon.run_until(shutdown))
            .await
            .expect("daemon did not stop")
            .unwrap();
    }
}
