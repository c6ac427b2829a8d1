//! Value Objects for the Perpguard domain
//!
//! Immutable, validated domain primitives.
//! All value objects enforce invariants at construction time.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Domain errors for value object validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    /// Price must be positive
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    /// Quantity must be positive
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    /// Symbol must be valid trading pair
    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    /// Leverage outside the supported range
    #[error("Invalid leverage: {0}")]
    InvalidLeverage(String),

    /// Signal confidence outside [0, 1]
    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    /// Engine configuration rejected by validation
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Invalid status transition
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),
}

// =============================================================================
// Price
// =============================================================================

/// Price represents a positive decimal price
///
/// # Invariants
/// - Must be > 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Price(Decimal);

impl Price {
    /// Create a new Price with validation
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPrice` if value <= 0
    pub fn new(value: Decimal) -> Result<Self, DomainError> {
        if value <= Decimal::ZERO {
            return Err(DomainError::InvalidPrice(format!("Price must be positive, got {value}")));
        }
        Ok(Self(value))
    }

    /// Get the underlying Decimal value
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Round down to a multiple of `tick` (no-op for non-positive ticks).
    ///
    /// Falls back to the unrounded price if rounding would reach zero.
    pub fn floor_to_tick(self, tick: Decimal) -> Self {
        if tick <= Decimal::ZERO {
            return self;
        }
        let rounded = (self.0 / tick).floor() * tick;
        Self::new(rounded).unwrap_or(self)
    }

    /// Round up to a multiple of `tick` (no-op for non-positive ticks).
    pub fn ceil_to_tick(self, tick: Decimal) -> Self {
        if tick <= Decimal::ZERO {
            return self;
        }
        let rounded = (self.0 / tick).ceil() * tick;
        Self::new(rounded).unwrap_or(self)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Quantity
// =============================================================================

/// Quantity represents a positive decimal quantity (base asset units)
///
/// # Invariants
/// - Must be > 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Quantity(Decimal);

impl Quantity {
    /// Create a new Quantity with validation
    ///
    /// # Errors
    /// Returns `DomainError::InvalidQuantity` if value <= 0
    pub fn new(value: Decimal) -> Result<Self, DomainError> {
        if value <= Decimal::ZERO {
            return Err(DomainError::InvalidQuantity(format!(
                "Quantity must be positive, got {value}"
            )));
        }
        Ok(Self(value))
    }

    /// Get the underlying Decimal value
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Notional value of this quantity at `price`
    pub fn notional_at(&self, price: Price) -> Decimal {
        self.0 * price.as_decimal()
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Leverage
// =============================================================================

/// Leverage multiplier applied to committed margin
///
/// # Invariants
/// - 1 <= leverage <= 125
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Leverage(u8);

impl Leverage {
    /// Highest leverage any supported venue offers
    pub const MAX: u8 = 125;

    /// Create a new Leverage with validation
    ///
    /// # Errors
    /// Returns `DomainError::InvalidLeverage` if outside 1..=125
    pub fn new(value: u8) -> Result<Self, DomainError> {
        if value == 0 || value > Self::MAX {
            return Err(DomainError::InvalidLeverage(format!(
                "Leverage must be between 1 and {}, got {value}",
                Self::MAX
            )));
        }
        Ok(Self(value))
    }

    /// Build from a value already known to be in range (crate-internal defaults)
    pub(crate) const fn from_static(value: u8) -> Self {
        Self(value)
    }

    /// Get the raw multiplier
    pub fn value(&self) -> u8 {
        self.0
    }

    /// Get the multiplier as a Decimal
    pub fn as_decimal(&self) -> Decimal {
        Decimal::from(self.0)
    }
}

impl fmt::Display for Leverage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x", self.0)
    }
}

// =============================================================================
// Symbol
// =============================================================================

/// Symbol represents a trading pair (e.g., BTCUSDT)
///
/// # Invariants
/// - Must be valid format (base + quote)
/// - Base and quote must be non-empty
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol {
    base: String,
    quote: String,
}

impl Symbol {
    /// Create a Symbol from a trading pair string
    ///
    /// # Examples
    /// ```
    /// # use perpguard_domain::value_objects::Symbol;
    /// let symbol = Symbol::from_pair("BTCUSDT").unwrap();
    /// assert_eq!(symbol.base(), "BTC");
    /// assert_eq!(symbol.quote(), "USDT");
    /// ```
    ///
    /// # Errors
    /// Returns `DomainError::InvalidSymbol` if format is invalid
    pub fn from_pair(pair: &str) -> Result<Self, DomainError> {
        // Longest suffixes first so USDT is not parsed as USD + "T"
        const QUOTE_CURRENCIES: &[&str] = &["USDT", "USDC", "BUSD", "USD", "BTC", "ETH"];

        let pair = pair.trim().to_ascii_uppercase();
        for quote in QUOTE_CURRENCIES {
            if let Some(base) = pair.strip_suffix(quote) {
                if !base.is_empty() {
                    return Ok(Self {
                        base: base.to_string(),
                        quote: quote.to_string(),
                    });
                }
            }
        }

        Err(DomainError::InvalidSymbol(format!("Cannot parse trading pair: {}", pair)))
    }

    /// Create a Symbol from explicit base and quote
    pub fn new(base: String, quote: String) -> Result<Self, DomainError> {
        if base.is_empty() || quote.is_empty() {
            return Err(DomainError::InvalidSymbol("Base and quote must be non-empty".to_string()));
        }
        Ok(Self { base, quote })
    }

    /// Get the base currency
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Get the quote currency
    pub fn quote(&self) -> &str {
        &self.quote
    }

    /// Get the trading pair as string (e.g., "BTCUSDT")
    pub fn as_pair(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_pair())
    }
}

// =============================================================================
// Side
// =============================================================================

/// Side represents the position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Long position (buy low, sell high)
    Long,
    /// Short position (sell high, buy low)
    Short,
}

impl Side {
    /// Get the entry action for this side
    ///
    /// Long → Buy, Short → Sell
    pub fn entry_action(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Get the exit action for this side
    ///
    /// Long → Sell, Short → Buy
    pub fn exit_action(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        }
    }

    /// True when `candidate` is strictly better for this side than `reference`
    /// (higher for Long, lower for Short).
    pub fn is_more_favorable(&self, candidate: Price, reference: Price) -> bool {
        match self {
            Side::Long => candidate > reference,
            Side::Short => candidate < reference,
        }
    }

    /// The more favorable of two prices for this side
    pub fn most_favorable(&self, a: Price, b: Price) -> Price {
        if self.is_more_favorable(a, b) {
            a
        } else {
            b
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// OrderSide represents the order direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    /// Buy order
    Buy,
    /// Sell order
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_rejects_non_positive() {
        assert!(Price::new(dec!(0)).is_err());
        assert!(Price::new(dec!(-1)).is_err());
        assert_eq!(Price::new(dec!(95000)).unwrap().as_decimal(), dec!(95000));
    }

    #[test]
    fn test_price_tick_rounding() {
        let price = Price::new(dec!(48937.56)).unwrap();

        assert_eq!(price.floor_to_tick(dec!(0.1)).as_decimal(), dec!(48937.5));
        assert_eq!(price.ceil_to_tick(dec!(0.1)).as_decimal(), dec!(48937.6));
        assert_eq!(price.floor_to_tick(Decimal::ZERO), price);
    }

    #[test]
    fn test_leverage_bounds() {
        assert!(Leverage::new(0).is_err());
        assert!(Leverage::new(126).is_err());
        assert_eq!(Leverage::new(8).unwrap().as_decimal(), dec!(8));
        assert_eq!(Leverage::new(8).unwrap().to_string(), "8x");
    }

    #[test]
    fn test_symbol_parsing_prefers_longest_quote() {
        let symbol = Symbol::from_pair("btcusdt").unwrap();
        assert_eq!(symbol.base(), "BTC");
        assert_eq!(symbol.quote(), "USDT");

        let symbol = Symbol::from_pair("ETHUSD").unwrap();
        assert_eq!(symbol.quote(), "USD");

        assert!(Symbol::from_pair("USDT").is_err());
        assert!(Symbol::from_pair("FOOBAR").is_err());
    }

    #[test]
    fn test_side_favorability() {
        let low = Price::new(dec!(100)).unwrap();
        let high = Price::new(dec!(110)).unwrap();

        assert!(Side::Long.is_more_favorable(high, low));
        assert!(!Side::Long.is_more_favorable(low, high));
        assert!(Side::Short.is_more_favorable(low, high));
        assert_eq!(Side::Long.most_favorable(low, high), high);
        assert_eq!(Side::Short.most_favorable(low, high), low);
        assert!(!Side::Long.is_more_favorable(low, low));
    }

    #[test]
    fn test_side_actions() {
        assert_eq!(Side::Long.entry_action(), OrderSide::Buy);
        assert_eq!(Side::Long.exit_action(), OrderSide::Sell);
        assert_eq!(Side::Short.entry_action(), OrderSide::Sell);
        assert_eq!(Side::Short.exit_action(), OrderSide::Buy);
    }
}
