//! Trade signals and candidate selection.
//!
//! Signals arrive from an external source once per slow cycle. Confidence is
//! an opaque ranking input; nothing here inspects how it was produced.

use crate::value_objects::{DomainError, Side, Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A directional opinion on one symbol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    /// Trading pair
    pub symbol: Symbol,
    /// Suggested side
    pub direction: Side,
    /// Confidence in [0, 1]
    pub confidence: Decimal,
}

impl Signal {
    /// Create a signal with validated confidence
    ///
    /// # Errors
    /// Returns `DomainError::InvalidSignal` if confidence is outside [0, 1]
    pub fn new(symbol: Symbol, direction: Side, confidence: Decimal) -> Result<Self, DomainError> {
        if confidence < Decimal::ZERO || confidence > Decimal::ONE {
            return Err(DomainError::InvalidSignal(format!(
                "confidence must be in [0, 1], got {confidence}"
            )));
        }
        Ok(Self {
            symbol,
            direction,
            confidence,
        })
    }
}

/// Pick the signals worth acting on.
///
/// Keeps signals at or above `threshold`, ranks them by confidence
/// (descending, stable for ties), keeps the first signal per symbol, skips
/// symbols in `excluded` (already held), and returns at most `limit`.
pub fn select_candidates(
    signals: &[Signal],
    threshold: Decimal,
    excluded: &HashSet<Symbol>,
    limit: usize,
) -> Vec<Signal> {
    let mut ranked: Vec<&Signal> = signals.iter().filter(|s| s.confidence >= threshold).collect();
    ranked.sort_by(|a, b| b.confidence.cmp(&a.confidence));

    let mut seen: HashSet<&Symbol> = HashSet::new();
    ranked
        .into_iter()
        .filter(|s| !excluded.contains(&s.symbol))
        .filter(|s| seen.insert(&s.symbol))
        .take(limit)
        .cloned()
        .collect()
}
