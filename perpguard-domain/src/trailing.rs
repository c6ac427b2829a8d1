//! Trailing Stop Engine (Pure Functions)
//!
//! Pure state machine deciding, for one position and one price observation,
//! whether the trailing stop activates, advances, or has been hit.
//! All functions are deterministic and perform no I/O.
//!
//! # ROE-locked trailing
//!
//! ROE is the price move as a fraction of entry, multiplied by leverage:
//!
//! ```text
//! LONG:  roe = (price - entry) / entry × leverage
//! SHORT: roe = (entry - price) / entry × leverage
//! ```
//!
//! Once ROE reaches `activation_roe` the stop is placed at the price that
//! locks `roe - protection_margin_roe`:
//!
//! ```text
//! LONG:  stop = entry × (1 + locked_roe / leverage)
//! SHORT: stop = entry × (1 - locked_roe / leverage)
//! ```
//!
//! Key invariants:
//! - `inactive -> active -> hit`, `hit` is terminal
//! - The stop level is a ratchet: it only moves in the position's favor
//! - The favorable extreme is monotonic (peak only rises, trough only falls)

use crate::entities::{Position, TrailingPhase, TrailingState};
use crate::value_objects::{DomainError, Leverage, Price, Side};
use rust_decimal::Decimal;

// =============================================================================
// Parameters
// =============================================================================

/// Trailing thresholds, taken from the engine configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailingParams {
    /// ROE at which trailing activates (e.g. 0.40)
    pub activation_roe: Decimal,
    /// ROE cushion left below the current ROE (e.g. 0.10)
    pub protection_margin_roe: Decimal,
    /// Minimum fractional stop move for an advance (e.g. 0.001)
    pub min_change_pct: Decimal,
}

// =============================================================================
// Price Observation
// =============================================================================

/// A price sample: last trade plus the range seen since the previous sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceObservation {
    /// Last traded / marked price
    pub last: Price,
    /// Lowest price in the interval
    pub low: Price,
    /// Highest price in the interval
    pub high: Price,
}

impl PriceObservation {
    /// Observation with no range (low == high == last)
    pub fn point(price: Price) -> Self {
        Self {
            last: price,
            low: price,
            high: price,
        }
    }

    /// Observation with an explicit range
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPrice` unless `low <= last <= high`
    pub fn with_range(last: Price, low: Price, high: Price) -> Result<Self, DomainError> {
        if low > last || last > high {
            return Err(DomainError::InvalidPrice(format!(
                "range must satisfy low <= last <= high, got {low} / {last} / {high}"
            )));
        }
        Ok(Self { last, low, high })
    }

    /// Price that could trigger a stop (low for long, high for short)
    pub fn adverse(&self, side: Side) -> Price {
        match side {
            Side::Long => self.low,
            Side::Short => self.high,
        }
    }

    /// Price that could set a new extreme (high for long, low for short)
    pub fn favorable(&self, side: Side) -> Price {
        match side {
            Side::Long => self.high,
            Side::Short => self.low,
        }
    }
}

// =============================================================================
// Decision
// =============================================================================

/// Outcome of evaluating one observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrailingDecision {
    /// Nothing to do
    Unchanged,
    /// ROE crossed the activation threshold
    Activated {
        /// Initial trailing stop
        stop: Price,
        /// Price recorded as the first extreme
        extreme: Price,
        /// ROE locked by `stop`
        locked_roe: Decimal,
    },
    /// New favorable extreme, but the stop move is below the minimum change
    ExtremeUpdated {
        /// New extreme
        extreme: Price,
    },
    /// Stop ratcheted in the position's favor
    Advanced {
        /// Level before the advance
        previous_stop: Price,
        /// Level after the advance
        new_stop: Price,
        /// New extreme
        extreme: Price,
        /// ROE locked by `new_stop`
        locked_roe: Decimal,
    },
    /// Adverse price crossed the stop
    Hit {
        /// Stop level that was crossed
        stop: Price,
        /// Adverse price that crossed it
        trigger_price: Price,
    },
}

impl TrailingDecision {
    /// True for `Hit`
    pub fn is_hit(&self) -> bool {
        matches!(self, TrailingDecision::Hit { .. })
    }

    /// Stop level the exchange should carry after this decision, if it moved
    pub fn stop_to_push(&self) -> Option<Price> {
        match self {
            TrailingDecision::Activated { stop, .. } => Some(*stop),
            TrailingDecision::Advanced { new_stop, .. } => Some(*new_stop),
            _ => None,
        }
    }

    /// State after applying this decision to `state`; `None` if unchanged
    pub fn next_state(&self, state: &TrailingState) -> Option<TrailingState> {
        match *self {
            TrailingDecision::Unchanged => None,
            TrailingDecision::Activated { stop, extreme, .. } => Some(TrailingState {
                phase: TrailingPhase::Active,
                extreme_price_seen: Some(extreme),
                current_stop_level: Some(stop),
            }),
            TrailingDecision::ExtremeUpdated { extreme } => Some(TrailingState {
                extreme_price_seen: Some(extreme),
                ..*state
            }),
            TrailingDecision::Advanced {
                new_stop, extreme, ..
            } => Some(TrailingState {
                phase: TrailingPhase::Active,
                extreme_price_seen: Some(extreme),
                current_stop_level: Some(new_stop),
            }),
            TrailingDecision::Hit { stop, .. } => {
                if state.phase == TrailingPhase::Hit {
                    return None;
                }
                Some(TrailingState {
                    phase: TrailingPhase::Hit,
                    current_stop_level: Some(stop),
                    ..*state
                })
            },
        }
    }
}

// =============================================================================
// ROE Math
// =============================================================================

/// Return on equity of a position at `price`
///
/// # Examples
///
/// ```
/// # use perpguard_domain::trailing::roe_at;
/// # use perpguard_domain::value_objects::{Leverage, Price, Side};
/// # use rust_decimal_macros::dec;
/// let entry = Price::new(dec!(45000)).unwrap();
/// let price = Price::new(dec!(49500)).unwrap();
/// let roe = roe_at(Side::Long, entry, price, Leverage::new(8).unwrap());
/// assert_eq!(roe, dec!(0.8)); // +10% move × 8
/// ```
pub fn roe_at(side: Side, entry: Price, price: Price, leverage: Leverage) -> Decimal {
    let entry = entry.as_decimal();
    let moved = match side {
        Side::Long => price.as_decimal() - entry,
        Side::Short => entry - price.as_decimal(),
    };
    moved / entry * leverage.as_decimal()
}

/// Price at which a position reaches `roe`
///
/// Returns `None` when that price would be non-positive (deep short ROE).
pub fn price_for_roe(side: Side, entry: Price, roe: Decimal, leverage: Leverage) -> Option<Price> {
    let fraction = roe / leverage.as_decimal();
    let factor = match side {
        Side::Long => Decimal::ONE + fraction,
        Side::Short => Decimal::ONE - fraction,
    };
    Price::new(entry.as_decimal() * factor).ok()
}

/// Check if a stop is hit by an adverse price
///
/// Long exits when price drops TO or BELOW the stop, short when it rises
/// TO or ABOVE it.
pub fn is_stop_hit(side: Side, adverse_price: Price, stop: Price) -> bool {
    match side {
        Side::Long => adverse_price <= stop,
        Side::Short => adverse_price >= stop,
    }
}

// =============================================================================
// Evaluation
// =============================================================================

/// Evaluate one price observation against a position's trailing state
///
/// # Algorithm
///
/// ```text
/// hit:      stays hit (caller keeps retrying the exit)
/// inactive: roe(last) >= activation  -> Activated at roe(last) - margin
/// active:   adverse crosses stop     -> Hit
///           favorable is new extreme -> candidate = roe(favorable) - margin
///               candidate strictly better and moves >= min_change -> Advanced
///               otherwise                                        -> ExtremeUpdated
/// ```
///
/// # Examples
///
/// ```
/// # use perpguard_domain::trailing::*;
/// # use perpguard_domain::entities::Position;
/// # use perpguard_domain::value_objects::{Leverage, Price, Quantity, Side, Symbol};
/// # use rust_decimal_macros::dec;
/// let position = Position::new(
///     Symbol::from_pair("BTCUSDT").unwrap(),
///     Side::Long,
///     Price::new(dec!(45000)).unwrap(),
///     Quantity::new(dec!(0.1)).unwrap(),
///     Leverage::new(8).unwrap(),
///     dec!(562.5),
/// );
/// let params = TrailingParams {
///     activation_roe: dec!(0.40),
///     protection_margin_roe: dec!(0.10),
///     min_change_pct: dec!(0.001),
/// };
///
/// let observation = PriceObservation::point(Price::new(dec!(49500)).unwrap());
/// match evaluate(&position, &observation, &params) {
///     TrailingDecision::Activated { stop, locked_roe, .. } => {
///         assert_eq!(locked_roe, dec!(0.70));
///         assert_eq!(stop.as_decimal(), dec!(48937.5));
///     },
///     other => panic!("expected activation, got {other:?}"),
/// }
/// ```
pub fn evaluate(
    position: &Position,
    observation: &PriceObservation,
    params: &TrailingParams,
) -> TrailingDecision {
    let side = position.side;
    let entry = position.entry_price;
    let leverage = position.leverage;
    let state = &position.trailing;

    match state.phase {
        TrailingPhase::Hit => match state.current_stop_level {
            Some(stop) => TrailingDecision::Hit {
                stop,
                trigger_price: observation.adverse(side),
            },
            None => TrailingDecision::Unchanged,
        },
        TrailingPhase::Inactive => {
            let roe = roe_at(side, entry, observation.last, leverage);
            if roe < params.activation_roe {
                return TrailingDecision::Unchanged;
            }
            let locked_roe = roe - params.protection_margin_roe;
            match price_for_roe(side, entry, locked_roe, leverage) {
                Some(stop) => TrailingDecision::Activated {
                    stop,
                    extreme: observation.last,
                    locked_roe,
                },
                None => TrailingDecision::Unchanged,
            }
        },
        TrailingPhase::Active => {
            let Some(stop) = state.current_stop_level else {
                return TrailingDecision::Unchanged;
            };

            // Hit is checked against the existing level before any advance
            let adverse = observation.adverse(side);
            if is_stop_hit(side, adverse, stop) {
                return TrailingDecision::Hit {
                    stop,
                    trigger_price: adverse,
                };
            }

            let favorable = observation.favorable(side);
            let extreme = state.extreme_price_seen.unwrap_or(observation.last);
            if !side.is_more_favorable(favorable, extreme) {
                return TrailingDecision::Unchanged;
            }

            let locked_roe = roe_at(side, entry, favorable, leverage) - params.protection_margin_roe;
            let candidate = price_for_roe(side, entry, locked_roe, leverage);

            match candidate {
                Some(candidate)
                    if side.is_more_favorable(candidate, stop)
                        && moves_enough(stop, candidate, params.min_change_pct) =>
                {
                    TrailingDecision::Advanced {
                        previous_stop: stop,
                        new_stop: candidate,
                        extreme: favorable,
                        locked_roe,
                    }
                },
                _ => TrailingDecision::ExtremeUpdated { extreme: favorable },
            }
        },
    }
}

fn moves_enough(from: Price, to: Price, min_change_pct: Decimal) -> bool {
    let from = from.as_decimal();
    (to.as_decimal() - from).abs() / from >= min_change_pct
}

// =============================================================================
// Tests
// =============================================================================
