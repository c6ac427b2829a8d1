//! Order executor: the single write path to the exchange.
//!
//! Validates and submits entries, protective stops and exits through the
//! rate-limited cache, with retry driven by the error taxonomy:
//!
//! ```text
//! Transient  -> retry with exponential backoff, bounded
//! Validation -> auto-correct once, retry; second failure is permanent
//! Permanent  -> surface immediately
//! NoOp       -> success ("already set", "already closed")
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use perpguard_domain::{EngineConfig, Leverage, Price, Quantity, Side, Symbol};

use crate::cache::RateLimitedCache;
use crate::error::{ErrorClass, ExchangeErrorCode, ExecError, ExecResult};
use crate::ports::OrderFill;

// =============================================================================
// Configuration
// =============================================================================

/// Executor configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Minimum fractional distance between a stop and the current price
    pub min_stop_distance_pct: Decimal,
    /// Exchange price tick, if known
    pub price_tick: Option<Decimal>,
    /// Attempts per submission
    pub max_order_attempts: u32,
    /// Backoff base; attempt n waits `base × 2^(n-1)`
    pub retry_base_delay: Duration,
}

impl From<&EngineConfig> for ExecutorConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            min_stop_distance_pct: config.min_stop_distance_pct,
            price_tick: config.price_tick,
            max_order_attempts: config.max_order_attempts,
            retry_base_delay: config.retry_base_delay,
        }
    }
}

// =============================================================================
// Requests and outcomes
// =============================================================================

/// Which rules a stop is validated against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// Loss-limiting stop: must sit beyond entry and away from price
    Initial,
    /// Profit-locking trailing stop: validated against current price only,
    /// since it sits on the profitable side of entry
    Trailing,
}

/// A protective stop to install or replace
#[derive(Debug, Clone, PartialEq)]
pub struct StopRequest {
    /// Trading pair
    pub symbol: Symbol,
    /// Position side
    pub side: Side,
    /// Position entry
    pub entry_price: Price,
    /// Requested stop level
    pub stop_price: Price,
    /// Optional take-profit
    pub take_profit: Option<Price>,
    /// Validation rules
    pub kind: StopKind,
}

/// Result of a successful stop submission
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopPlacement {
    /// Stop actually installed (possibly corrected)
    pub stop_price: Price,
    /// Take-profit actually installed
    pub take_profit: Option<Price>,
    /// Price the stop was validated against
    pub reference_price: Price,
    /// True if the stop differs from the requested one
    pub corrected: bool,
    /// True if the exchange reported the stop was already set
    pub already_set: bool,
}

/// Result of a close request
#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    /// The exchange filled the exit
    Filled(OrderFill),
    /// The exchange reports no position (closed already)
    AlreadyClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryPolicy {
    /// Retry every transient failure
    AllTransient,
    /// Retry only failures that guarantee the request was not executed
    UnsentOnly,
}

fn retryable(policy: RetryPolicy, err: &ExecError) -> bool {
    if err.class() != ErrorClass::Transient {
        return false;
    }
    match policy {
        RetryPolicy::AllTransient => true,
        RetryPolicy::UnsentOnly => matches!(
            err,
            ExecError::RateLimited(_) | ExecError::Stale(_)
        ) || err.code() == Some(ExchangeErrorCode::RateLimited),
    }
}

// =============================================================================
// Stop validation
// =============================================================================

/// Snap a requested stop to the nearest compliant price.
///
/// ```text
/// LONG:  stop <= current × (1 - d)   (Initial also: stop <= entry × (1 - d))
/// SHORT: stop >= current × (1 + d)   (Initial also: stop >= entry × (1 + d))
/// ```
///
/// The result is rounded to the tick away from price (down for long, up for
/// short). Returns the stop and whether it was snapped.
///
/// # Errors
/// - `Domain` if the compliant price is not positive
pub fn compliant_stop(
    side: Side,
    kind: StopKind,
    entry: Price,
    current: Price,
    requested: Price,
    min_distance_pct: Decimal,
    tick: Option<Decimal>,
) -> ExecResult<(Price, bool)> {
    let tick = tick.unwrap_or(Decimal::ZERO);
    let current = current.as_decimal();
    let entry = entry.as_decimal();
    let requested_raw = requested.as_decimal();

    match side {
        Side::Long => {
            let mut ceiling = current * (Decimal::ONE - min_distance_pct);
            if kind == StopKind::Initial {
                ceiling = ceiling.min(entry * (Decimal::ONE - min_distance_pct));
            }
            if requested_raw > ceiling {
                Ok((Price::new(ceiling)?.floor_to_tick(tick), true))
            } else {
                Ok((requested.floor_to_tick(tick), false))
            }
        },
        Side::Short => {
            let mut floor = current * (Decimal::ONE + min_distance_pct);
            if kind == StopKind::Initial {
                floor = floor.max(entry * (Decimal::ONE + min_distance_pct));
            }
            if requested_raw < floor {
                Ok((Price::new(floor)?.ceil_to_tick(tick), true))
            } else {
                Ok((requested.ceil_to_tick(tick), false))
            }
        },
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Validates and submits orders with retry and error classification.
pub struct OrderExecutor {
    cache: Arc<RateLimitedCache>,
    config: ExecutorConfig,
}

impl OrderExecutor {
    /// Create a new executor.
    pub fn new(cache: Arc<RateLimitedCache>, config: ExecutorConfig) -> Self {
        Self { cache, config }
    }

    /// The cache this executor submits through.
    pub fn cache(&self) -> &Arc<RateLimitedCache> {
        &self.cache
    }

    /// Run `call` with the retry policy.
    ///
    /// Returns `Ok(None)` when the exchange answered with a no-op code.
    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        symbol: &Symbol,
        policy: RetryPolicy,
        mut call: F,
    ) -> ExecResult<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ExecResult<T>>,
    {
        let max_attempts = self.config.max_order_attempts.max(1);

        for attempt in 0..max_attempts {
            // Exponential backoff: 0, base, 2×base, 4×base...
            if attempt > 0 {
                let delay = self.config.retry_base_delay * (1u32 << (attempt - 1).min(16));
                tokio::time::sleep(delay).await;
            }

            let err = match call().await {
                Ok(value) => return Ok(Some(value)),
                Err(err) => err,
            };

            if err.class() == ErrorClass::NoOp {
                debug!(operation, symbol = %symbol, error = %err, "Exchange reports no change needed");
                return Ok(None);
            }
            if !retryable(policy, &err) {
                return Err(err);
            }
            if attempt + 1 == max_attempts {
                error!(
                    operation,
                    symbol = %symbol,
                    attempts = max_attempts,
                    error = %err,
                    "Retries exhausted"
                );
                return Err(ExecError::RetriesExhausted {
                    operation,
                    symbol: symbol.as_pair(),
                    attempts: max_attempts,
                    last_error: err.to_string(),
                });
            }

            warn!(
                operation,
                symbol = %symbol,
                attempt = attempt + 1,
                max_attempts,
                error = %err,
                "Transient error, retrying"
            );
        }

        Err(ExecError::InvalidRequest(format!("{operation}: no attempts made")))
    }

    /// Current price, required to be within the ticker TTL.
    ///
    /// # Errors
    /// - `Stale` if only a stale value is available
    pub async fn fresh_price(&self, symbol: &Symbol) -> ExecResult<Price> {
        let price = self
            .with_retry("get_ticker", symbol, RetryPolicy::AllTransient, || async {
                let cached = self.cache.get_ticker(symbol).await?;
                cached.require_fresh(&symbol.as_pair()).map(|ticker| ticker.price)
            })
            .await?;
        price.ok_or_else(|| ExecError::InvalidRequest(format!("no ticker for {symbol}")))
    }

    /// Open a position at market.
    ///
    /// Leverage is set first (unchanged leverage counts as success). The
    /// market order is only retried on failures that guarantee it was not
    /// sent; an ambiguous failure (timeout) is surfaced so reconciliation can
    /// pick up a fill that did happen rather than risk a double entry.
    ///
    /// # Errors
    /// - Permanent gateway errors (`InsufficientFunds`, `ReduceOnly`,
    ///   `BelowMinimumSize`) without retry
    pub async fn open_position(
        &self,
        symbol: &Symbol,
        side: Side,
        quantity: Quantity,
        leverage: Leverage,
    ) -> ExecResult<OrderFill> {
        self.with_retry("set_leverage", symbol, RetryPolicy::AllTransient, || {
            self.cache.set_leverage(symbol, leverage)
        })
        .await?;

        let fill = self
            .with_retry("place_market_order", symbol, RetryPolicy::UnsentOnly, || {
                self.cache.place_market_order(symbol, side.entry_action(), quantity)
            })
            .await?
            .ok_or_else(|| ExecError::InvalidRequest(format!("entry on {symbol} reported no-op")))?;

        info!(
            symbol = %symbol,
            ?side,
            %quantity,
            %leverage,
            fill_price = %fill.filled_price,
            order_id = %fill.order_id,
            "Position opened"
        );
        Ok(fill)
    }

    /// Install or replace a protective stop.
    ///
    /// The stop is snapped to a compliant price before submission. If the
    /// exchange still rejects it as invalid, the price is refreshed, the
    /// minimum distance widened, and the stop submitted once more.
    ///
    /// # Errors
    /// - `ValidationFailed` on a second validation rejection
    /// - `RetriesExhausted` when transient failures persist
    /// - Permanent gateway errors without retry
    pub async fn set_protective_stop(&self, request: &StopRequest) -> ExecResult<StopPlacement> {
        let symbol = &request.symbol;
        let mut current = self.fresh_price(symbol).await?;
        let mut distance = self.config.min_stop_distance_pct;
        let mut recorrected = false;

        loop {
            let (stop, snapped) = compliant_stop(
                request.side,
                request.kind,
                request.entry_price,
                current,
                request.stop_price,
                distance,
                self.config.price_tick,
            )?;
            if snapped {
                info!(
                    symbol = %symbol,
                    requested = %request.stop_price,
                    corrected = %stop,
                    reference = %current,
                    "Stop auto-corrected to compliant price"
                );
            }

            let take_profit = request.take_profit.filter(|tp| {
                let valid = request.side.is_more_favorable(*tp, current);
                if !valid {
                    warn!(symbol = %symbol, take_profit = %tp, reference = %current, "Dropping take-profit on wrong side of price");
                }
                valid
            });

            let result = self
                .with_retry("set_stop", symbol, RetryPolicy::AllTransient, || {
                    self.cache.set_stop(symbol, stop, take_profit)
                })
                .await;

            match result {
                Ok(outcome) => {
                    info!(symbol = %symbol, %stop, kind = ?request.kind, "Protective stop set");
                    return Ok(StopPlacement {
                        stop_price: stop,
                        take_profit,
                        reference_price: current,
                        corrected: stop != request.stop_price,
                        already_set: outcome.is_none(),
                    });
                },
                Err(err) if err.class() == ErrorClass::Validation && !recorrected => {
                    warn!(symbol = %symbol, %stop, error = %err, "Stop rejected by exchange, correcting once");
                    recorrected = true;
                    distance = (distance * Decimal::TWO).max(Decimal::new(1, 3));
                    self.cache.invalidate_ticker(symbol);
                    current = self.fresh_price(symbol).await?;
                },
                Err(err) if err.class() == ErrorClass::Validation => {
                    error!(symbol = %symbol, %stop, error = %err, "Stop rejected again after correction");
                    return Err(ExecError::ValidationFailed {
                        symbol: symbol.as_pair(),
                        reason: err.to_string(),
                    });
                },
                Err(err) => return Err(err),
            }
        }
    }

    /// Close `quantity` of the position on `symbol` at market.
    ///
    /// "Already closed" counts as success.
    pub async fn close_position(&self, symbol: &Symbol, quantity: Quantity) -> ExecResult<CloseOutcome> {
        let fill = self
            .with_retry("close_position", symbol, RetryPolicy::AllTransient, || {
                self.cache.close_position(symbol, quantity)
            })
            .await?;

        match fill {
            Some(fill) => {
                info!(symbol = %symbol, %quantity, exit_price = %fill.filled_price, "Position closed on exchange");
                Ok(CloseOutcome::Filled(fill))
            },
            None => {
                info!(symbol = %symbol, "Position already closed on exchange");
                Ok(CloseOutcome::AlreadyClosed)
            },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::ports::ExchangeGateway;
    use crate::stub::{Operation, StubGateway};
    use perpguard_domain::OrderSide;
    use rust_decimal_macros::dec;

    fn price(value: Decimal) -> Price {
        Price::new(value).unwrap()
    }

    fn btc() -> Symbol {
        Symbol::from_pair("BTCUSDT").unwrap()
    }

    async fn setup() -> (Arc<StubGateway>, OrderExecutor) {
        let stub = Arc::new(StubGateway::new(dec!(1000)));
        stub.set_price(&btc(), dec!(45000));
        stub.place_market_order(&btc(), OrderSide::Buy, Quantity::new(dec!(0.1)).unwrap())
            .await
            .unwrap();

        let cache = Arc::new(RateLimitedCache::new(
            stub.clone(),
            CacheConfig {
                ticker_ttl: Duration::from_secs(15),
                positions_ttl: Duration::from_secs(20),
                max_calls_per_window: 100,
                rate_window: Duration::from_secs(10),
            },
        ));
        let executor = OrderExecutor::new(
            cache,
            ExecutorConfig {
                min_stop_distance_pct: dec!(0.002),
                price_tick: Some(dec!(0.1)),
                max_order_attempts: 3,
                retry_base_delay: Duration::from_millis(100),
            },
        );
        (stub, executor)
    }

    fn initial_stop(stop: Decimal) -> StopRequest {
        StopRequest {
            symbol: btc(),
            side: Side::Long,
            entry_price: price(dec!(45000)),
            stop_price: price(stop),
            take_profit: None,
            kind: StopKind::Initial,
        }
    }

    #[test]
    fn test_compliant_stop_keeps_valid_long() {
        let (stop, snapped) = compliant_stop(
            Side::Long,
            StopKind::Initial,
            price(dec!(45000)),
            price(dec!(45000)),
            price(dec!(44100)),
            dec!(0.002),
            None,
        )
        .unwrap();
        assert_eq!(stop, price(dec!(44100)));
        assert!(!snapped);
    }

    #[test]
    fn test_compliant_stop_snaps_long_above_entry() {
        let (stop, snapped) = compliant_stop(
            Side::Long,
            StopKind::Initial,
            price(dec!(45000)),
            price(dec!(46000)),
            price(dec!(45100)),
            dec!(0.002),
            Some(dec!(0.1)),
        )
        .unwrap();
        // Entry bound 45000 × 0.998 is tighter than 46000 × 0.998
        assert_eq!(stop, price(dec!(44910)));
        assert!(snapped);
    }

    #[test]
    fn test_trailing_stop_may_sit_above_entry() {
        let (stop, snapped) = compliant_stop(
            Side::Long,
            StopKind::Trailing,
            price(dec!(45000)),
            price(dec!(49500)),
            price(dec!(48937.5)),
            dec!(0.002),
            Some(dec!(0.1)),
        )
        .unwrap();
        assert_eq!(stop, price(dec!(48937.5)));
        assert!(!snapped);
    }

    #[test]
    fn test_trailing_stop_too_close_is_snapped() {
        let (stop, snapped) = compliant_stop(
            Side::Long,
            StopKind::Trailing,
            price(dec!(45000)),
            price(dec!(49000)),
            price(dec!(48950)),
            dec!(0.002),
            None,
        )
        .unwrap();
        assert_eq!(stop, price(dec!(48902)));
        assert!(snapped);
    }

    #[test]
    fn test_short_stop_rounds_up_and_respects_entry() {
        let (stop, snapped) = compliant_stop(
            Side::Short,
            StopKind::Initial,
            price(dec!(3000)),
            price(dec!(2950)),
            price(dec!(2990)),
            dec!(0.002),
            Some(dec!(0.5)),
        )
        .unwrap();
        // max(2950 × 1.002, 3000 × 1.002) = 3006, already on tick
        assert_eq!(stop, price(dec!(3006)));
        assert!(snapped);

        let (stop, snapped) = compliant_stop(
            Side::Short,
            StopKind::Initial,
            price(dec!(3000)),
            price(dec!(2950)),
            price(dec!(3060.2)),
            dec!(0.002),
            Some(dec!(0.5)),
        )
        .unwrap();
        assert_eq!(stop, price(dec!(3060.5)));
        assert!(!snapped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_stop_failures_are_retried() {
        let (stub, executor) = setup().await;
        stub.fail_next(Operation::SetStop, ExchangeErrorCode::Timeout);
        stub.fail_next(Operation::SetStop, ExchangeErrorCode::RateLimited);

        let placement = executor.set_protective_stop(&initial_stop(dec!(44100))).await.unwrap();

        assert_eq!(placement.stop_price, price(dec!(44100)));
        assert!(!placement.corrected);
        assert_eq!(stub.calls(Operation::SetStop), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_transient_failure_exhausts_retries() {
        let (stub, executor) = setup().await;
        stub.fail_always(Operation::SetStop, ExchangeErrorCode::ServerError);

        let err = executor.set_protective_stop(&initial_stop(dec!(44100))).await.unwrap_err();

        assert!(matches!(err, ExecError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(stub.calls(Operation::SetStop), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_modified_is_success() {
        let (stub, executor) = setup().await;
        executor.set_protective_stop(&initial_stop(dec!(44100))).await.unwrap();

        let again = executor.set_protective_stop(&initial_stop(dec!(44100))).await.unwrap();

        assert!(again.already_set);
        assert_eq!(stub.calls(Operation::SetStop), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_rejection_is_corrected_once() {
        let (stub, executor) = setup().await;
        stub.fail_next(Operation::SetStop, ExchangeErrorCode::StopTooClose);

        let placement = executor.set_protective_stop(&initial_stop(dec!(44980))).await.unwrap();

        // First snap at 0.2% → 44910, rejected; widened to 0.4% → 44820
        assert_eq!(placement.stop_price, price(dec!(44820)));
        assert!(placement.corrected);
        assert_eq!(stub.calls(Operation::SetStop), 2);
        assert_eq!(stub.position(&btc()).unwrap().stop_price, Some(price(dec!(44820))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_validation_rejection_is_permanent() {
        let (stub, executor) = setup().await;
        stub.fail_always(Operation::SetStop, ExchangeErrorCode::InvalidStopDirection);

        let err = executor.set_protective_stop(&initial_stop(dec!(44100))).await.unwrap_err();

        assert!(matches!(err, ExecError::ValidationFailed { .. }));
        assert_eq!(err.class(), ErrorClass::Permanent);
        assert_eq!(stub.calls(Operation::SetStop), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let (stub, executor) = setup().await;
        stub.fail_next(Operation::SetStop, ExchangeErrorCode::ReduceOnly);

        let err = executor.set_protective_stop(&initial_stop(dec!(44100))).await.unwrap_err();

        assert_eq!(err.code(), Some(ExchangeErrorCode::ReduceOnly));
        assert_eq!(stub.calls(Operation::SetStop), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_market_order_timeout_is_not_retried() {
        let (stub, executor) = setup().await;
        let eth = Symbol::from_pair("ETHUSDT").unwrap();
        stub.set_price(&eth, dec!(3000));
        stub.fail_next(Operation::PlaceOrder, ExchangeErrorCode::Timeout);

        let err = executor
            .open_position(&eth, Side::Long, Quantity::new(dec!(1)).unwrap(), Leverage::new(8).unwrap())
            .await
            .unwrap_err();

        assert_eq!(err.code(), Some(ExchangeErrorCode::Timeout));
        assert_eq!(stub.calls(Operation::PlaceOrder), 2); // setup order + this one
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_below_minimum_is_permanent() {
        let (stub, executor) = setup().await;
        stub.set_min_quantity(dec!(0.01));

        let err = executor
            .open_position(&btc(), Side::Long, Quantity::new(dec!(0.001)).unwrap(), Leverage::new(8).unwrap())
            .await
            .unwrap_err();

        assert_eq!(err.code(), Some(ExchangeErrorCode::BelowMinimumSize));
        assert_eq!(err.class(), ErrorClass::Permanent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_already_closed_is_success() {
        let (stub, executor) = setup().await;
        stub.remove_position(&btc());

        let outcome = executor.close_position(&btc(), Quantity::new(dec!(0.1)).unwrap()).await.unwrap();
        assert_eq!(outcome, CloseOutcome::AlreadyClosed);
    }
}
