//! Rate-limited exchange cache
//!
//! Wraps the gateway with a sliding-window call budget and short-TTL read
//! caches. When the budget is exhausted, reads return the last known value
//! flagged as stale instead of blocking. Gateway failures never poison an
//! entry: the previous value is kept and a failure counter increments.
//!
//! The internal lock only guards bookkeeping. It is released before any
//! gateway call and re-taken to record the result.

use crate::error::{ExchangeErrorCode, ExecError, ExecResult, GatewayError};
use crate::ports::{ExchangeGateway, ExchangePosition, OrderFill, Ticker};
use perpguard_domain::{EngineConfig, Leverage, OrderSide, Price, Quantity, Symbol};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Cache TTLs and rate budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Ticker TTL
    pub ticker_ttl: Duration,
    /// Position list TTL
    pub positions_ttl: Duration,
    /// Calls allowed per window
    pub max_calls_per_window: usize,
    /// Window length
    pub rate_window: Duration,
}

impl From<&EngineConfig> for CacheConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            ticker_ttl: config.ticker_ttl,
            positions_ttl: config.positions_ttl,
            max_calls_per_window: config.max_calls_per_window,
            rate_window: config.rate_window,
        }
    }
}

// =============================================================================
// Cached values
// =============================================================================

/// Whether a returned value is within its TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Younger than its TTL when returned
    Fresh,
    /// Older than its TTL (served because the budget ran out or the call failed)
    Stale,
}

/// A value returned by the cache with its provenance
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    /// The value
    pub value: T,
    /// When the value was fetched from the gateway
    pub fetched_at: Instant,
    /// TTL the entry was cached with
    pub ttl: Duration,
    /// Freshness at the time it was returned
    pub freshness: Freshness,
}

impl<T> Cached<T> {
    /// Fresh when returned and still within its TTL now
    pub fn is_fresh(&self) -> bool {
        self.freshness == Freshness::Fresh && self.fetched_at.elapsed() < self.ttl
    }

    /// Age of the value
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    /// Unwrap the value only if it is fresh.
    ///
    /// Use before computing an order price from a cached read.
    ///
    /// # Errors
    /// - `Stale` if the value is older than its TTL
    pub fn require_fresh(self, what: &str) -> ExecResult<T> {
        if self.is_fresh() {
            Ok(self.value)
        } else {
            Err(ExecError::Stale(format!("{what} ({}ms old)", self.age().as_millis())))
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    fetched_at: Instant,
    ttl: Duration,
}

impl<T: Clone> CacheEntry<T> {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) < self.ttl
    }

    fn serve(&self, freshness: Freshness) -> Cached<T> {
        Cached {
            value: self.value.clone(),
            fetched_at: self.fetched_at,
            ttl: self.ttl,
            freshness,
        }
    }
}

// =============================================================================
// Rate window
// =============================================================================

/// Timestamps of outbound calls inside the trailing window
#[derive(Debug)]
struct RateWindow {
    calls: VecDeque<Instant>,
    limit: usize,
    window: Duration,
}

impl RateWindow {
    fn new(limit: usize, window: Duration) -> Self {
        Self {
            calls: VecDeque::with_capacity(limit),
            limit,
            window,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.calls.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record a call if the budget allows it
    fn try_acquire(&mut self, now: Instant) -> bool {
        self.prune(now);
        if self.calls.len() >= self.limit {
            return false;
        }
        self.calls.push_back(now);
        true
    }

    fn remaining(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.limit.saturating_sub(self.calls.len())
    }
}

// =============================================================================
// Stats
// =============================================================================

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Calls forwarded to the gateway
    pub gateway_calls: u64,
    /// Gateway calls that failed
    pub failures: u64,
    /// Reads answered from a fresh entry
    pub hits: u64,
    /// Reads answered with a stale entry
    pub stale_serves: u64,
    /// Calls refused for lack of budget with nothing to serve
    pub rate_limited: u64,
}

// =============================================================================
// Cache
// =============================================================================

struct CacheState {
    tickers: HashMap<Symbol, CacheEntry<Ticker>>,
    positions: Option<CacheEntry<Vec<ExchangePosition>>>,
    window: RateWindow,
    stats: CacheStats,
}

enum Plan<T> {
    Serve(Cached<T>),
    Fetch,
    Refuse,
}

/// Rate-limited, caching front for an [`ExchangeGateway`]
pub struct RateLimitedCache {
    gateway: Arc<dyn ExchangeGateway>,
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl RateLimitedCache {
    /// Wrap a gateway
    pub fn new(gateway: Arc<dyn ExchangeGateway>, config: CacheConfig) -> Self {
        Self {
            gateway,
            state: Mutex::new(CacheState {
                tickers: HashMap::new(),
                positions: None,
                window: RateWindow::new(config.max_calls_per_window, config.rate_window),
                stats: CacheStats::default(),
            }),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn plan<T: Clone>(
        entry: Option<&CacheEntry<T>>,
        window: &mut RateWindow,
        stats: &mut CacheStats,
        now: Instant,
    ) -> Plan<T> {
        if let Some(entry) = entry {
            if entry.is_fresh(now) {
                stats.hits += 1;
                return Plan::Serve(entry.serve(Freshness::Fresh));
            }
        }
        if window.try_acquire(now) {
            stats.gateway_calls += 1;
            return Plan::Fetch;
        }
        match entry {
            Some(entry) => {
                stats.stale_serves += 1;
                Plan::Serve(entry.serve(Freshness::Stale))
            },
            None => {
                stats.rate_limited += 1;
                Plan::Refuse
            },
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Ticker for `symbol`, fresh if possible, otherwise flagged stale.
    ///
    /// # Errors
    /// - `RateLimited` if there is no budget and nothing cached
    /// - `Gateway` if the call failed and nothing cached
    pub async fn get_ticker(&self, symbol: &Symbol) -> ExecResult<Cached<Ticker>> {
        let plan = {
            let mut guard = self.lock();
            let state = &mut *guard;
            Self::plan(state.tickers.get(symbol), &mut state.window, &mut state.stats, Instant::now())
        };
        match plan {
            Plan::Serve(cached) => return Ok(cached),
            Plan::Refuse => return Err(ExecError::RateLimited(format!("ticker {symbol}"))),
            Plan::Fetch => {},
        }

        let result = self.gateway.get_ticker(symbol).await;

        let mut guard = self.lock();
        let state = &mut *guard;
        match result {
            Ok(ticker) => {
                let entry = CacheEntry {
                    value: ticker,
                    fetched_at: Instant::now(),
                    ttl: self.config.ticker_ttl,
                };
                let cached = entry.serve(Freshness::Fresh);
                state.tickers.insert(symbol.clone(), entry);
                Ok(cached)
            },
            Err(e) => {
                state.stats.failures += 1;
                warn!(symbol = %symbol, error = %e, "Ticker fetch failed");
                match state.tickers.get(symbol) {
                    Some(entry) if entry.is_fresh(Instant::now()) => Ok(entry.serve(Freshness::Fresh)),
                    Some(entry) => {
                        let cached = entry.serve(Freshness::Stale);
                        state.stats.stale_serves += 1;
                        Ok(cached)
                    },
                    None => Err(e.into()),
                }
            },
        }
    }

    /// Exchange position list, fresh if possible, otherwise flagged stale.
    ///
    /// # Errors
    /// - `RateLimited` if there is no budget and nothing cached
    /// - `Gateway` if the call failed and nothing cached
    pub async fn get_positions(&self) -> ExecResult<Cached<Vec<ExchangePosition>>> {
        let plan = {
            let mut guard = self.lock();
            let state = &mut *guard;
            Self::plan(state.positions.as_ref(), &mut state.window, &mut state.stats, Instant::now())
        };
        match plan {
            Plan::Serve(cached) => return Ok(cached),
            Plan::Refuse => return Err(ExecError::RateLimited("positions".to_string())),
            Plan::Fetch => {},
        }

        let result = self.gateway.list_positions().await;

        let mut guard = self.lock();
        let state = &mut *guard;
        match result {
            Ok(positions) => {
                let entry = CacheEntry {
                    value: positions,
                    fetched_at: Instant::now(),
                    ttl: self.config.positions_ttl,
                };
                let cached = entry.serve(Freshness::Fresh);
                state.positions = Some(entry);
                Ok(cached)
            },
            Err(e) => {
                state.stats.failures += 1;
                warn!(error = %e, "Position list fetch failed");
                match state.positions.as_ref() {
                    Some(entry) => {
                        state.stats.stale_serves += 1;
                        Ok(entry.serve(Freshness::Stale))
                    },
                    None => Err(e.into()),
                }
            },
        }
    }

    /// Account balance (not cached; consumes budget).
    pub async fn get_balance(&self) -> ExecResult<Decimal> {
        self.acquire("get_balance")?;
        let result = self.gateway.get_balance().await;
        self.record_outcome(&result, false);
        result.map_err(ExecError::from)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    fn acquire(&self, operation: &str) -> ExecResult<()> {
        let mut state = self.lock();
        if state.window.try_acquire(Instant::now()) {
            state.stats.gateway_calls += 1;
            return Ok(());
        }
        state.stats.rate_limited += 1;
        debug!(operation, "Local rate budget exhausted");
        Err(GatewayError::new(
            ExchangeErrorCode::RateLimited,
            format!("local rate budget exhausted for {operation}"),
        )
        .into())
    }

    fn record_outcome<T>(&self, result: &Result<T, GatewayError>, invalidates_positions: bool) {
        let mut state = self.lock();
        match result {
            Ok(_) if invalidates_positions => state.positions = None,
            Ok(_) => {},
            Err(_) => state.stats.failures += 1,
        }
    }

    /// Set leverage through the rate window.
    pub async fn set_leverage(&self, symbol: &Symbol, leverage: Leverage) -> ExecResult<()> {
        self.acquire("set_leverage")?;
        let result = self.gateway.set_leverage(symbol, leverage).await;
        self.record_outcome(&result, false);
        result.map_err(ExecError::from)
    }

    /// Place a market order through the rate window.
    pub async fn place_market_order(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Quantity,
    ) -> ExecResult<OrderFill> {
        self.acquire("place_market_order")?;
        let result = self.gateway.place_market_order(symbol, side, quantity).await;
        self.record_outcome(&result, true);
        result.map_err(ExecError::from)
    }

    /// Set a protective stop through the rate window.
    pub async fn set_stop(
        &self,
        symbol: &Symbol,
        stop_price: Price,
        take_profit: Option<Price>,
    ) -> ExecResult<()> {
        self.acquire("set_stop")?;
        let result = self.gateway.set_stop(symbol, stop_price, take_profit).await;
        self.record_outcome(&result, true);
        result.map_err(ExecError::from)
    }

    /// Close a position through the rate window.
    pub async fn close_position(&self, symbol: &Symbol, quantity: Quantity) -> ExecResult<OrderFill> {
        self.acquire("close_position")?;
        let result = self.gateway.close_position(symbol, quantity).await;
        self.record_outcome(&result, true);
        result.map_err(ExecError::from)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Drop a cached ticker so the next read goes to the gateway
    pub fn invalidate_ticker(&self, symbol: &Symbol) {
        self.lock().tickers.remove(symbol);
    }

    /// Drop the cached position list
    pub fn invalidate_positions(&self) {
        self.lock().positions = None;
    }

    /// Counters snapshot
    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    /// Calls left in the current window
    pub fn remaining_budget(&self) -> usize {
        self.lock().window.remaining(Instant::now())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::{Operation, StubGateway};
    use rust_decimal_macros::dec;

    fn config(limit: usize) -> CacheConfig {
        CacheConfig {
            ticker_ttl: Duration::from_secs(15),
            positions_ttl: Duration::from_secs(20),
            max_calls_per_window: limit,
            rate_window: Duration::from_secs(10),
        }
    }

    fn setup(limit: usize) -> (Arc<StubGateway>, RateLimitedCache, Symbol) {
        let stub = Arc::new(StubGateway::new(dec!(1000)));
        let btc = Symbol::from_pair("BTCUSDT").unwrap();
        stub.set_price(&btc, dec!(95000));
        let cache = RateLimitedCache::new(stub.clone(), config(limit));
        (stub, cache, btc)
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_reads_within_ttl_hit_gateway_once() {
        let (stub, cache, btc) = setup(10);

        let first = cache.get_ticker(&btc).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        let second = cache.get_ticker(&btc).await.unwrap();

        assert_eq!(stub.calls(Operation::GetTicker), 1);
        assert!(first.is_fresh() && second.is_fresh());
        assert_eq!(second.value.price.as_decimal(), dec!(95000));
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_refetched() {
        let (stub, cache, btc) = setup(10);

        cache.get_ticker(&btc).await.unwrap();
        stub.set_price(&btc, dec!(96000));
        tokio::time::advance(Duration::from_secs(16)).await;
        let refreshed = cache.get_ticker(&btc).await.unwrap();

        assert_eq!(stub.calls(Operation::GetTicker), 2);
        assert_eq!(refreshed.value.price.as_decimal(), dec!(96000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_serves_stale() {
        let (stub, cache, btc) = setup(1);

        cache.get_ticker(&btc).await.unwrap();
        tokio::time::advance(Duration::from_secs(16)).await;

        // Window is 10s so the first call has aged out; spend the budget
        cache.get_balance().await.unwrap();
        let stale = cache.get_ticker(&btc).await.unwrap();

        assert_eq!(stale.freshness, Freshness::Stale);
        assert!(!stale.is_fresh());
        assert!(stale.clone().require_fresh("ticker").is_err());
        assert_eq!(stub.calls(Operation::GetTicker), 1);
        assert_eq!(cache.stats().stale_serves, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_budget_and_nothing_cached_is_rate_limited() {
        let (_stub, cache, btc) = setup(1);

        cache.get_balance().await.unwrap();
        let result = cache.get_ticker(&btc).await;

        assert!(matches!(result, Err(ExecError::RateLimited(_))));
        assert_eq!(cache.stats().rate_limited, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_recovers_after_window() {
        let (_stub, cache, _btc) = setup(2);

        cache.get_balance().await.unwrap();
        cache.get_balance().await.unwrap();
        assert_eq!(cache.remaining_budget(), 0);
        assert!(cache.get_balance().await.is_err());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.remaining_budget(), 2);
        assert!(cache.get_balance().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_previous_value() {
        let (stub, cache, btc) = setup(10);

        cache.get_ticker(&btc).await.unwrap();
        tokio::time::advance(Duration::from_secs(16)).await;
        stub.fail_next(Operation::GetTicker, ExchangeErrorCode::ServerError);

        let served = cache.get_ticker(&btc).await.unwrap();

        assert_eq!(served.freshness, Freshness::Stale);
        assert_eq!(served.value.price.as_decimal(), dec!(95000));
        assert_eq!(cache.stats().failures, 1);

        // Next read succeeds and refreshes
        let fresh = cache.get_ticker(&btc).await.unwrap();
        assert!(fresh.is_fresh());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_with_nothing_cached_is_surfaced() {
        let (stub, cache, btc) = setup(10);
        stub.fail_next(Operation::GetTicker, ExchangeErrorCode::Timeout);

        let result = cache.get_ticker(&btc).await;
        assert_eq!(result.unwrap_err().code(), Some(ExchangeErrorCode::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_without_budget_fails_fast_as_transient() {
        let (stub, cache, btc) = setup(1);
        cache.get_ticker(&btc).await.unwrap();

        let result = cache.close_position(&btc, Quantity::new(dec!(0.1)).unwrap()).await;

        let err = result.unwrap_err();
        assert_eq!(err.code(), Some(ExchangeErrorCode::RateLimited));
        assert_eq!(stub.calls(Operation::ClosePosition), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_write_invalidates_positions() {
        let (stub, cache, btc) = setup(10);

        cache.get_positions().await.unwrap();
        cache
            .place_market_order(&btc, OrderSide::Buy, Quantity::new(dec!(0.01)).unwrap())
            .await
            .unwrap();
        let positions = cache.get_positions().await.unwrap();

        assert_eq!(stub.calls(Operation::ListPositions), 2);
        assert_eq!(positions.value.len(), 1);
    }
}
