//! Unit-test wiring: every manager against one stub exchange.

use std::sync::Arc;

use rust_decimal::Decimal;

use perpguard_domain::{
    EngineConfig, OrderSide, Position, PositionStatus, Price, Quantity, Side, Symbol,
};
use perpguard_exec::{
    CacheConfig, ExchangeGateway, ExchangePosition, ExecutorConfig, OrderExecutor, RateLimitedCache,
    StubGateway,
};
use perpguard_store::{BalanceLedger, MemoryJournal, PositionStore};

use crate::config::Config;
use crate::event_bus::EventBus;
use crate::exit::PositionCloser;
use crate::safety::{SafetyConfig, SafetyMonitor};

pub(crate) struct Harness {
    pub config: EngineConfig,
    pub gateway: Arc<StubGateway>,
    pub cache: Arc<RateLimitedCache>,
    pub executor: Arc<OrderExecutor>,
    pub store: Arc<PositionStore>,
    pub ledger: Arc<BalanceLedger>,
    pub bus: Arc<EventBus>,
    pub closer: Arc<PositionCloser>,
    pub safety: Arc<SafetyMonitor>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::test().engine)
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let gateway = Arc::new(StubGateway::new(Decimal::new(1000, 0)));
        let cache = Arc::new(RateLimitedCache::new(gateway.clone(), CacheConfig::from(&config)));
        let executor = Arc::new(OrderExecutor::new(cache.clone(), ExecutorConfig::from(&config)));
        let store = Arc::new(PositionStore::new(Arc::new(MemoryJournal::new())));
        let ledger = Arc::new(BalanceLedger::new(Decimal::new(1000, 0), config.max_allocation_fraction));
        let bus = Arc::new(EventBus::new(256));
        let closer = Arc::new(PositionCloser::new(
            store.clone(),
            ledger.clone(),
            executor.clone(),
            bus.clone(),
        ));
        let safety = Arc::new(SafetyMonitor::new(
            store.clone(),
            executor.clone(),
            closer.clone(),
            bus.clone(),
            SafetyConfig::from(&config),
        ));

        Self {
            config,
            gateway,
            cache,
            executor,
            store,
            ledger,
            bus,
            closer,
            safety,
        }
    }

    /// Fill a long on the stub and record it as an open, unprotected position.
    pub async fn open_long(&self, pair: &str, price: Decimal, quantity: Decimal) -> Position {
        let symbol = Symbol::from_pair(pair).unwrap();
        let quantity = Quantity::new(quantity).unwrap();
        self.gateway.set_price(&symbol, price);
        self.gateway
            .place_market_order(&symbol, OrderSide::Buy, quantity)
            .await
            .unwrap();

        let mut position = Position::new(
            symbol,
            Side::Long,
            Price::new(price).unwrap(),
            quantity,
            self.config.leverage,
            Decimal::ZERO,
        );
        position.margin_committed = position.implied_margin();
        position.status = PositionStatus::Open;
        assert!(self.ledger.allocate(position.margin_committed, "test"));
        self.store.create(position.clone()).await.unwrap();
        position
    }

    pub async fn exchange_positions(&self) -> Vec<ExchangePosition> {
        self.gateway.list_positions().await.unwrap()
    }
}
