//! Engine configuration.
//!
//! One struct carrying every threshold the engine uses. It is injected into
//! each component at construction; no component reads undeclared constants.

use crate::trailing::TrailingParams;
use crate::value_objects::{DomainError, Leverage};
use rust_decimal::Decimal;
use std::time::Duration;

// =============================================================================
// Engine Configuration
// =============================================================================

/// Engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Leverage applied to committed margin
    pub leverage: Leverage,
    /// Cap on simultaneously open positions
    pub max_concurrent_positions: usize,
    /// Fractional distance from entry for the default protective stop
    pub initial_stop_pct: Decimal,
    /// Fractional distance from entry for the default take-profit, if any
    pub initial_take_profit_pct: Option<Decimal>,
    /// ROE at which trailing activates
    pub trailing_activation_roe: Decimal,
    /// ROE cushion kept below the current ROE when trailing
    pub trailing_protection_margin_roe: Decimal,
    /// Minimum fractional stop move for a trailing advance
    pub trailing_min_change_pct: Decimal,
    /// Ceiling on total capital at risk, as a fraction of balance
    pub max_allocation_fraction: Decimal,
    /// Slow decision loop cadence
    pub slow_cycle_interval: Duration,
    /// Fast protection loop cadence
    pub fast_monitor_interval: Duration,
    /// Minimum signal confidence to act on
    pub confidence_threshold: Decimal,
    /// Minimum fractional distance between a stop and the current price
    pub min_stop_distance_pct: Decimal,
    /// Exchange price tick, if known
    pub price_tick: Option<Decimal>,
    /// Positions with less margin than this are closed by the safety sweep
    pub min_position_margin: Decimal,
    /// Positions with less notional than this are closed by the safety sweep
    pub min_position_notional: Decimal,
    /// Protective stop attempts before a forced close
    pub max_stop_attempts: u32,
    /// Attempts per order submission (transient retries)
    pub max_order_attempts: u32,
    /// Backoff base; attempt n waits `base × 2^(n-1)`
    pub retry_base_delay: Duration,
    /// Ticker cache TTL
    pub ticker_ttl: Duration,
    /// Exchange position list cache TTL
    pub positions_ttl: Duration,
    /// Outbound call budget per rate window
    pub max_calls_per_window: usize,
    /// Sliding rate window length
    pub rate_window: Duration,
}

impl EngineConfig {
    /// Thresholds for the trailing stop engine
    pub fn trailing_params(&self) -> TrailingParams {
        TrailingParams {
            activation_roe: self.trailing_activation_roe,
            protection_margin_roe: self.trailing_protection_margin_roe,
            min_change_pct: self.trailing_min_change_pct,
        }
    }

    /// Reject inconsistent values.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidConfig` naming the first offending field
    pub fn validate(&self) -> Result<(), DomainError> {
        fn fraction(name: &str, value: Decimal) -> Result<(), DomainError> {
            if value <= Decimal::ZERO || value > Decimal::ONE {
                return Err(DomainError::InvalidConfig(format!(
                    "{name} must be in (0, 1], got {value}"
                )));
            }
            Ok(())
        }
        fn non_zero(name: &str, value: Duration) -> Result<(), DomainError> {
            if value.is_zero() {
                return Err(DomainError::InvalidConfig(format!("{name} must be non-zero")));
            }
            Ok(())
        }
        fn invalid(message: String) -> Result<(), DomainError> {
            Err(DomainError::InvalidConfig(message))
        }

        fraction("max_allocation_fraction", self.max_allocation_fraction)?;
        fraction("initial_stop_pct", self.initial_stop_pct)?;
        if let Some(take_profit) = self.initial_take_profit_pct {
            fraction("initial_take_profit_pct", take_profit)?;
        }

        // A default stop at or beyond 1/leverage would sit past liquidation
        if self.initial_stop_pct * self.leverage.as_decimal() >= Decimal::ONE {
            return invalid(format!(
                "initial_stop_pct {} is beyond liquidation at {}",
                self.initial_stop_pct, self.leverage
            ));
        }

        if self.confidence_threshold < Decimal::ZERO || self.confidence_threshold > Decimal::ONE {
            return invalid(format!(
                "confidence_threshold must be in [0, 1], got {}",
                self.confidence_threshold
            ));
        }
        if self.trailing_activation_roe <= Decimal::ZERO {
            return invalid("trailing_activation_roe must be positive".to_string());
        }
        if self.trailing_protection_margin_roe < Decimal::ZERO
            || self.trailing_protection_margin_roe >= self.trailing_activation_roe
        {
            return invalid(format!(
                "trailing_protection_margin_roe must be in [0, {}), got {}",
                self.trailing_activation_roe, self.trailing_protection_margin_roe
            ));
        }
        if self.trailing_min_change_pct < Decimal::ZERO {
            return invalid("trailing_min_change_pct must not be negative".to_string());
        }
        if self.min_stop_distance_pct < Decimal::ZERO || self.min_stop_distance_pct >= Decimal::ONE {
            return invalid(format!(
                "min_stop_distance_pct must be in [0, 1), got {}",
                self.min_stop_distance_pct
            ));
        }
        if matches!(self.price_tick, Some(tick) if tick <= Decimal::ZERO) {
            return invalid("price_tick must be positive".to_string());
        }
        if self.min_position_margin < Decimal::ZERO || self.min_position_notional < Decimal::ZERO {
            return invalid("viability floors must not be negative".to_string());
        }
        if self.max_concurrent_positions == 0 {
            return invalid("max_concurrent_positions must be at least 1".to_string());
        }
        if self.max_stop_attempts == 0 || self.max_order_attempts == 0 {
            return invalid("attempt bounds must be at least 1".to_string());
        }
        if self.max_calls_per_window == 0 {
            return invalid("max_calls_per_window must be at least 1".to_string());
        }

        non_zero("slow_cycle_interval", self.slow_cycle_interval)?;
        non_zero("fast_monitor_interval", self.fast_monitor_interval)?;
        non_zero("ticker_ttl", self.ticker_ttl)?;
        non_zero("positions_ttl", self.positions_ttl)?;
        non_zero("rate_window", self.rate_window)?;
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            leverage: Leverage::from_static(8),
            max_concurrent_positions: 3,
            initial_stop_pct: Decimal::new(2, 2), // 2%
            initial_take_profit_pct: None,
            trailing_activation_roe: Decimal::new(40, 2), // +40% ROE
            trailing_protection_margin_roe: Decimal::new(10, 2), // 10% ROE cushion
            trailing_min_change_pct: Decimal::new(1, 3), // 0.1%
            max_allocation_fraction: Decimal::new(80, 2), // 80%
            slow_cycle_interval: Duration::from_secs(300),
            fast_monitor_interval: Duration::from_secs(5),
            confidence_threshold: Decimal::new(60, 2),
            min_stop_distance_pct: Decimal::new(2, 3), // 0.2%
            price_tick: None,
            min_position_margin: Decimal::new(5, 0),
            min_position_notional: Decimal::new(10, 0),
            max_stop_attempts: 3,
            max_order_attempts: 3,
            retry_base_delay: Duration::from_millis(1000),
            ticker_ttl: Duration::from_secs(15),
            positions_ttl: Duration::from_secs(20),
            max_calls_per_window: 20,
            rate_window: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
