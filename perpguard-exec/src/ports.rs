//! Execution layer port definitions.
//!
//! The exchange gateway is the only component that talks to the venue.
//! Adapters normalize venue errors into [`GatewayError`] codes; wire formats
//! stay inside the adapter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use perpguard_domain::{Leverage, OrderSide, Price, PriceObservation, Quantity, Side, Symbol};

use crate::error::GatewayError;

// =============================================================================
// Exchange Gateway Port
// =============================================================================

/// Port for exchange operations.
///
/// Implementations:
/// - `StubGateway` - In-memory exchange for tests and stub mode
///
/// Every call may fail transiently and counts against the venue's rate
/// limit; callers go through `RateLimitedCache` rather than using this
/// directly.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Current ticker for a symbol.
    async fn get_ticker(&self, symbol: &Symbol) -> Result<Ticker, GatewayError>;

    /// Authoritative list of open positions.
    async fn list_positions(&self) -> Result<Vec<ExchangePosition>, GatewayError>;

    /// Set leverage for a symbol. `NotModified` if already set.
    async fn set_leverage(&self, symbol: &Symbol, leverage: Leverage) -> Result<(), GatewayError>;

    /// Place a market order.
    async fn place_market_order(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Quantity,
    ) -> Result<OrderFill, GatewayError>;

    /// Set or replace the protective stop (and optional target) of a position.
    async fn set_stop(
        &self,
        symbol: &Symbol,
        stop_price: Price,
        take_profit: Option<Price>,
    ) -> Result<(), GatewayError>;

    /// Close `quantity` of the position on `symbol` at market.
    async fn close_position(&self, symbol: &Symbol, quantity: Quantity) -> Result<OrderFill, GatewayError>;

    /// Total account balance in quote currency.
    async fn get_balance(&self) -> Result<Decimal, GatewayError>;
}

// =============================================================================
// Gateway Types
// =============================================================================

/// Ticker snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    /// Trading pair
    pub symbol: Symbol,
    /// Last price
    pub price: Price,
    /// Lowest price since the previous snapshot, if the venue reports it
    pub low: Option<Price>,
    /// Highest price since the previous snapshot, if the venue reports it
    pub high: Option<Price>,
    /// Traded volume
    pub volume: Decimal,
    /// Exchange timestamp
    pub timestamp: DateTime<Utc>,
}

impl Ticker {
    /// Price observation for the trailing engine.
    ///
    /// Falls back to a point observation if the range is missing or
    /// inconsistent with the last price.
    pub fn observation(&self) -> PriceObservation {
        let low = self.low.unwrap_or(self.price);
        let high = self.high.unwrap_or(self.price);
        PriceObservation::with_range(self.price, low, high)
            .unwrap_or_else(|_| PriceObservation::point(self.price))
    }
}

/// Position as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    /// Trading pair
    pub symbol: Symbol,
    /// Position side
    pub side: Side,
    /// Average entry price
    pub entry_price: Price,
    /// Size in base units
    pub quantity: Quantity,
    /// Mark price
    pub mark_price: Price,
    /// Leverage, if reported
    pub leverage: Option<Leverage>,
    /// Isolated margin, if reported
    pub margin: Option<Decimal>,
    /// Resting protective stop, if any
    pub stop_price: Option<Price>,
    /// Resting take-profit, if any
    pub take_profit_price: Option<Price>,
}

/// Result of a filled market order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    /// Exchange-assigned order ID
    pub order_id: String,
    /// Trading pair
    pub symbol: Symbol,
    /// Order side
    pub side: OrderSide,
    /// Average fill price
    pub filled_price: Price,
    /// Filled quantity
    pub quantity: Quantity,
    /// Fill time
    pub filled_at: DateTime<Utc>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ticker(price: Decimal, low: Option<Decimal>, high: Option<Decimal>) -> Ticker {
        Ticker {
            symbol: Symbol::from_pair("BTCUSDT").unwrap(),
            price: Price::new(price).unwrap(),
            low: low.map(|p| Price::new(p).unwrap()),
            high: high.map(|p| Price::new(p).unwrap()),
            volume: dec!(1200),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_ticker_observation_uses_range() {
        let observation = ticker(dec!(95000), Some(dec!(94000)), Some(dec!(96000))).observation();

        assert_eq!(observation.adverse(Side::Long).as_decimal(), dec!(94000));
        assert_eq!(observation.adverse(Side::Short).as_decimal(), dec!(96000));
    }

    #[test]
    fn test_ticker_observation_falls_back_to_point() {
        let observation = ticker(dec!(95000), Some(dec!(95500)), None).observation();
        assert_eq!(observation, PriceObservation::point(Price::new(dec!(95000)).unwrap()));

        let observation = ticker(dec!(95000), None, None).observation();
        assert_eq!(observation.low, observation.high);
    }

    #[test]
    fn test_order_fill_serialization() {
        let fill = OrderFill {
            order_id: "12345".to_string(),
            symbol: Symbol::from_pair("BTCUSDT").unwrap(),
            side: OrderSide::Buy,
            filled_price: Price::new(dec!(95000)).unwrap(),
            quantity: Quantity::new(dec!(0.1)).unwrap(),
            filled_at: Utc::now(),
        };

        let json = serde_json::to_string(&fill).unwrap();
        let parsed: OrderFill = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, fill);
    }
}
