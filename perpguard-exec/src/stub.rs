//! Stub exchange for testing.
//!
//! An in-memory venue in one-way mode (one position per symbol) with
//! settable prices and balance, scripted per-operation failures, and call
//! counters so tests can assert how many requests reached the "exchange".

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use perpguard_domain::{Leverage, OrderSide, Price, Quantity, Side, Symbol};

use crate::error::{ExchangeErrorCode, GatewayError};
use crate::ports::{ExchangeGateway, ExchangePosition, OrderFill, Ticker};

/// Gateway operations, for scripting failures and counting calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `get_ticker`
    GetTicker,
    /// `list_positions`
    ListPositions,
    /// `set_leverage`
    SetLeverage,
    /// `place_market_order`
    PlaceOrder,
    /// `set_stop`
    SetStop,
    /// `close_position`
    ClosePosition,
    /// `get_balance`
    GetBalance,
}

#[derive(Debug, Clone, Copy)]
struct StubTicker {
    price: Price,
    low: Option<Price>,
    high: Option<Price>,
}

#[derive(Default)]
struct FailureScript {
    queued: VecDeque<ExchangeErrorCode>,
    always: Option<ExchangeErrorCode>,
}

/// Stub exchange for testing.
///
/// Market orders fill immediately at the current ticker price.
pub struct StubGateway {
    tickers: RwLock<HashMap<Symbol, StubTicker>>,
    positions: RwLock<HashMap<Symbol, ExchangePosition>>,
    leverage: RwLock<HashMap<Symbol, Leverage>>,
    balance: RwLock<Decimal>,
    failures: Mutex<HashMap<Operation, FailureScript>>,
    calls: Mutex<HashMap<Operation, u64>>,
    order_counter: AtomicU64,
    /// Orders below this quantity are rejected with `BelowMinimumSize`
    min_quantity: RwLock<Decimal>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn guard<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|e| e.into_inner())
}

impl StubGateway {
    /// Create a stub with an account balance and no prices.
    pub fn new(balance: Decimal) -> Self {
        Self {
            tickers: RwLock::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
            leverage: RwLock::new(HashMap::new()),
            balance: RwLock::new(balance),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            order_counter: AtomicU64::new(0),
            min_quantity: RwLock::new(Decimal::ZERO),
        }
    }

    // =========================================================================
    // Scenario setup
    // =========================================================================

    /// Set the last price (clears any range) and re-mark the open position.
    ///
    /// Non-positive prices are ignored.
    pub fn set_price(&self, symbol: &Symbol, price: Decimal) {
        let Ok(price) = Price::new(price) else {
            return;
        };
        write(&self.tickers).insert(
            symbol.clone(),
            StubTicker {
                price,
                low: None,
                high: None,
            },
        );
        if let Some(position) = write(&self.positions).get_mut(symbol) {
            position.mark_price = price;
        }
    }

    /// Set last price with the low/high seen since the previous ticker.
    pub fn set_range(&self, symbol: &Symbol, last: Decimal, low: Decimal, high: Decimal) {
        self.set_price(symbol, last);
        if let Some(ticker) = write(&self.tickers).get_mut(symbol) {
            ticker.low = Price::new(low).ok();
            ticker.high = Price::new(high).ok();
        }
    }

    /// Set the account balance.
    pub fn set_balance(&self, balance: Decimal) {
        *write(&self.balance) = balance;
    }

    /// Reject orders below `quantity` with `BelowMinimumSize`.
    pub fn set_min_quantity(&self, quantity: Decimal) {
        *write(&self.min_quantity) = quantity;
    }

    /// Put a position on the exchange directly (opened elsewhere).
    pub fn insert_position(&self, position: ExchangePosition) {
        write(&self.positions).insert(position.symbol.clone(), position);
    }

    /// Remove a position directly (closed elsewhere, e.g. stop triggered).
    pub fn remove_position(&self, symbol: &Symbol) -> Option<ExchangePosition> {
        write(&self.positions).remove(symbol)
    }

    /// Current exchange view of a position.
    pub fn position(&self, symbol: &Symbol) -> Option<ExchangePosition> {
        read(&self.positions).get(symbol).cloned()
    }

    /// Fail the next call of `operation` with `code` (queued, FIFO).
    pub fn fail_next(&self, operation: Operation, code: ExchangeErrorCode) {
        guard(&self.failures).entry(operation).or_default().queued.push_back(code);
    }

    /// Fail every call of `operation` with `code` until cleared.
    pub fn fail_always(&self, operation: Operation, code: ExchangeErrorCode) {
        guard(&self.failures).entry(operation).or_default().always = Some(code);
    }

    /// Remove scripted failures for `operation`.
    pub fn clear_failures(&self, operation: Operation) {
        guard(&self.failures).remove(&operation);
    }

    /// Number of calls made to `operation`.
    pub fn calls(&self, operation: Operation) -> u64 {
        guard(&self.calls).get(&operation).copied().unwrap_or(0)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn enter(&self, operation: Operation) -> Result<(), GatewayError> {
        *guard(&self.calls).entry(operation).or_insert(0) += 1;

        let mut failures = guard(&self.failures);
        let Some(script) = failures.get_mut(&operation) else {
            return Ok(());
        };
        if let Some(code) = script.queued.pop_front().or(script.always) {
            return Err(GatewayError::new(code, format!("Simulated {:?} failure", operation)));
        }
        Ok(())
    }

    fn price_of(&self, symbol: &Symbol) -> Result<Price, GatewayError> {
        read(&self.tickers)
            .get(symbol)
            .map(|t| t.price)
            .ok_or_else(|| GatewayError::new(ExchangeErrorCode::UnknownSymbol, symbol.as_pair()))
    }

    fn next_order_id(&self) -> String {
        format!("STUB-{}", self.order_counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn fill(&self, symbol: &Symbol, side: OrderSide, price: Price, quantity: Quantity) -> OrderFill {
        OrderFill {
            order_id: self.next_order_id(),
            symbol: symbol.clone(),
            side,
            filled_price: price,
            quantity,
            filled_at: Utc::now(),
        }
    }
}

#[async_trait]
impl ExchangeGateway for StubGateway {
    async fn get_ticker(&self, symbol: &Symbol) -> Result<Ticker, GatewayError> {
        self.enter(Operation::GetTicker)?;
        let ticker = read(&self.tickers)
            .get(symbol)
            .copied()
            .ok_or_else(|| GatewayError::new(ExchangeErrorCode::UnknownSymbol, symbol.as_pair()))?;
        Ok(Ticker {
            symbol: symbol.clone(),
            price: ticker.price,
            low: ticker.low,
            high: ticker.high,
            volume: Decimal::ZERO,
            timestamp: Utc::now(),
        })
    }

    async fn list_positions(&self) -> Result<Vec<ExchangePosition>, GatewayError> {
        self.enter(Operation::ListPositions)?;
        let mut positions: Vec<ExchangePosition> = read(&self.positions).values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn set_leverage(&self, symbol: &Symbol, leverage: Leverage) -> Result<(), GatewayError> {
        self.enter(Operation::SetLeverage)?;
        let previous = write(&self.leverage).insert(symbol.clone(), leverage);
        if previous == Some(leverage) {
            return Err(GatewayError::new(ExchangeErrorCode::NotModified, "leverage unchanged"));
        }
        Ok(())
    }

    async fn place_market_order(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Quantity,
    ) -> Result<OrderFill, GatewayError> {
        self.enter(Operation::PlaceOrder)?;
        if quantity.as_decimal() < *read(&self.min_quantity) {
            return Err(GatewayError::new(
                ExchangeErrorCode::BelowMinimumSize,
                format!("quantity {quantity} below minimum"),
            ));
        }
        let price = self.price_of(symbol)?;
        let leverage = read(&self.leverage).get(symbol).copied();
        let position_side = match side {
            OrderSide::Buy => Side::Long,
            OrderSide::Sell => Side::Short,
        };

        let mut positions = write(&self.positions);
        match positions.get_mut(symbol) {
            Some(existing) if existing.side == position_side => {
                let old_qty = existing.quantity.as_decimal();
                let new_qty = old_qty + quantity.as_decimal();
                let avg = (existing.entry_price.as_decimal() * old_qty
                    + price.as_decimal() * quantity.as_decimal())
                    / new_qty;
                existing.entry_price = Price::new(avg).unwrap_or(price);
                existing.quantity = Quantity::new(new_qty).unwrap_or(existing.quantity);
            },
            Some(existing) => {
                let remaining = existing.quantity.as_decimal() - quantity.as_decimal();
                if remaining <= Decimal::ZERO {
                    positions.remove(symbol);
                } else {
                    existing.quantity = Quantity::new(remaining).unwrap_or(existing.quantity);
                }
            },
            None => {
                let margin = leverage.map(|l| quantity.notional_at(price) / l.as_decimal());
                positions.insert(
                    symbol.clone(),
                    ExchangePosition {
                        symbol: symbol.clone(),
                        side: position_side,
                        entry_price: price,
                        quantity,
                        mark_price: price,
                        leverage,
                        margin,
                        stop_price: None,
                        take_profit_price: None,
                    },
                );
            },
        }
        drop(positions);

        tracing::debug!(symbol = %symbol, %side, %quantity, %price, "Stub: market order filled");
        Ok(self.fill(symbol, side, price, quantity))
    }

    async fn set_stop(
        &self,
        symbol: &Symbol,
        stop_price: Price,
        take_profit: Option<Price>,
    ) -> Result<(), GatewayError> {
        self.enter(Operation::SetStop)?;
        let mut positions = write(&self.positions);
        let position = positions
            .get_mut(symbol)
            .ok_or_else(|| GatewayError::new(ExchangeErrorCode::NoPosition, symbol.as_pair()))?;

        let wrong_side = match position.side {
            Side::Long => stop_price >= position.mark_price,
            Side::Short => stop_price <= position.mark_price,
        };
        if wrong_side {
            return Err(GatewayError::new(
                ExchangeErrorCode::InvalidStopDirection,
                format!("stop {stop_price} vs mark {}", position.mark_price),
            ));
        }
        if position.stop_price == Some(stop_price) && position.take_profit_price == take_profit {
            return Err(GatewayError::new(ExchangeErrorCode::NotModified, "stop unchanged"));
        }

        position.stop_price = Some(stop_price);
        if take_profit.is_some() {
            position.take_profit_price = take_profit;
        }
        Ok(())
    }

    async fn close_position(&self, symbol: &Symbol, quantity: Quantity) -> Result<OrderFill, GatewayError> {
        self.enter(Operation::ClosePosition)?;
        let mut positions = write(&self.positions);
        let Some(position) = positions.get_mut(symbol) else {
            return Err(GatewayError::new(ExchangeErrorCode::AlreadyClosed, symbol.as_pair()));
        };

        let price = position.mark_price;
        let side = position.side.exit_action();
        let remaining = position.quantity.as_decimal() - quantity.as_decimal();
        let filled = if remaining <= Decimal::ZERO {
            let filled = position.quantity;
            positions.remove(symbol);
            filled
        } else {
            position.quantity = Quantity::new(remaining).unwrap_or(position.quantity);
            quantity
        };
        drop(positions);

        Ok(self.fill(symbol, side, price, filled))
    }

    async fn get_balance(&self) -> Result<Decimal, GatewayError> {
        self.enter(Operation::GetBalance)?;
        Ok(*read(&self.balance))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn btc() -> Symbol {
        Symbol::from_pair("BTCUSDT").unwrap()
    }

    #[tokio::test]
    async fn test_market_order_opens_position_at_price() {
        let stub = StubGateway::new(dec!(1000));
        stub.set_price(&btc(), dec!(95000));
        stub.set_leverage(&btc(), Leverage::new(10).unwrap()).await.unwrap();

        let fill = stub
            .place_market_order(&btc(), OrderSide::Buy, Quantity::new(dec!(0.01)).unwrap())
            .await
            .unwrap();

        assert_eq!(fill.filled_price.as_decimal(), dec!(95000));
        assert_eq!(fill.order_id, "STUB-1");
        let position = stub.position(&btc()).unwrap();
        assert_eq!(position.side, Side::Long);
        assert_eq!(position.margin, Some(dec!(95)));
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let stub = StubGateway::new(dec!(1000));
        stub.set_price(&btc(), dec!(95000));

        stub.fail_next(Operation::GetTicker, ExchangeErrorCode::Timeout);
        let err = stub.get_ticker(&btc()).await.unwrap_err();
        assert_eq!(err.code, ExchangeErrorCode::Timeout);
        assert!(stub.get_ticker(&btc()).await.is_ok());

        stub.fail_always(Operation::GetBalance, ExchangeErrorCode::ServerError);
        assert!(stub.get_balance().await.is_err());
        assert!(stub.get_balance().await.is_err());
        stub.clear_failures(Operation::GetBalance);
        assert_eq!(stub.get_balance().await.unwrap(), dec!(1000));

        assert_eq!(stub.calls(Operation::GetTicker), 2);
        assert_eq!(stub.calls(Operation::GetBalance), 3);
    }

    #[tokio::test]
    async fn test_set_stop_validates_direction_and_reports_not_modified() {
        let stub = StubGateway::new(dec!(1000));
        stub.set_price(&btc(), dec!(95000));
        stub.place_market_order(&btc(), OrderSide::Buy, Quantity::new(dec!(0.01)).unwrap())
            .await
            .unwrap();

        let above = Price::new(dec!(96000)).unwrap();
        let below = Price::new(dec!(93000)).unwrap();

        let err = stub.set_stop(&btc(), above, None).await.unwrap_err();
        assert_eq!(err.code, ExchangeErrorCode::InvalidStopDirection);

        stub.set_stop(&btc(), below, None).await.unwrap();
        let err = stub.set_stop(&btc(), below, None).await.unwrap_err();
        assert_eq!(err.code, ExchangeErrorCode::NotModified);
        assert_eq!(stub.position(&btc()).unwrap().stop_price, Some(below));
    }

    #[tokio::test]
    async fn test_close_twice_reports_already_closed() {
        let stub = StubGateway::new(dec!(1000));
        stub.set_price(&btc(), dec!(95000));
        let qty = Quantity::new(dec!(0.01)).unwrap();
        stub.place_market_order(&btc(), OrderSide::Sell, qty).await.unwrap();

        let fill = stub.close_position(&btc(), qty).await.unwrap();
        assert_eq!(fill.side, OrderSide::Buy);
        assert!(stub.position(&btc()).is_none());

        let err = stub.close_position(&btc(), qty).await.unwrap_err();
        assert_eq!(err.code, ExchangeErrorCode::AlreadyClosed);
    }

    #[tokio::test]
    async fn test_below_minimum_size() {
        let stub = StubGateway::new(dec!(1000));
        stub.set_price(&btc(), dec!(95000));
        stub.set_min_quantity(dec!(0.001));

        let err = stub
            .place_market_order(&btc(), OrderSide::Buy, Quantity::new(dec!(0.0001)).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.code, ExchangeErrorCode::BelowMinimumSize);
    }
}
