//! Domain Entities for Perpguard
//!
//! The [`Position`] entity and the [`PositionPatch`] used to mutate it.
//! Positions are never mutated field by field from outside this module:
//! every change is expressed as a patch and applied in one step by
//! [`Position::apply`], which keeps derived fields (PnL, high-water mark)
//! consistent with the inputs they are computed from.

use crate::trailing::roe_at;
use crate::value_objects::{DomainError, Leverage, Price, Quantity, Side, Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Position ID
// =============================================================================

/// Unique identifier for a Position
pub type PositionId = Uuid;

// =============================================================================
// Status
// =============================================================================

/// Lifecycle status of a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    /// Entry order in flight, not yet confirmed by the exchange
    Opening,
    /// Live on the exchange and monitored
    Open,
    /// A close has been claimed by one loop and is being executed
    Closing,
    /// Exchange confirmed closure
    Closed,
}

impl PositionStatus {
    /// Closed positions accept no further updates
    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionStatus::Closed)
    }

    /// Allowed status transitions
    ///
    /// ```text
    /// opening -> open | closed
    /// open    -> closing
    /// closing -> open (close failed) | closed
    /// ```
    pub fn can_transition_to(&self, next: PositionStatus) -> bool {
        use PositionStatus::*;
        matches!(
            (self, next),
            (Opening, Open) | (Opening, Closed) | (Open, Closing) | (Closing, Open) | (Closing, Closed)
        )
    }

    /// Get the name of the status for display
    pub fn name(&self) -> &'static str {
        match self {
            PositionStatus::Opening => "opening",
            PositionStatus::Open => "open",
            PositionStatus::Closing => "closing",
            PositionStatus::Closed => "closed",
        }
    }
}

/// Where a tracked position came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionOrigin {
    /// Opened by the slow cycle
    Engine,
    /// Found on the exchange during reconciliation
    Imported,
}

// =============================================================================
// Trailing State
// =============================================================================

/// Trailing stop phase: `inactive -> active -> hit`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrailingPhase {
    /// ROE has not yet reached the activation threshold
    Inactive,
    /// Stop level is being ratcheted
    Active,
    /// Adverse price crossed the stop level (terminal)
    Hit,
}

/// Trailing stop state embedded in a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailingState {
    /// Current phase
    pub phase: TrailingPhase,
    /// Most favorable price seen since activation
    pub extreme_price_seen: Option<Price>,
    /// Current trailing stop level (ratchet)
    pub current_stop_level: Option<Price>,
}

impl TrailingState {
    /// Fresh state for a new position
    pub fn inactive() -> Self {
        Self {
            phase: TrailingPhase::Inactive,
            extreme_price_seen: None,
            current_stop_level: None,
        }
    }

    /// Combine a stored state with an incoming one.
    ///
    /// The phase never regresses; extreme and stop keep whichever value is
    /// more favorable for `side`. Two writers racing with states computed
    /// from different snapshots therefore converge on the tighter ratchet.
    pub fn merge(self, side: Side, incoming: TrailingState) -> Self {
        fn favorable(side: Side, a: Option<Price>, b: Option<Price>) -> Option<Price> {
            match (a, b) {
                (Some(a), Some(b)) => Some(side.most_favorable(a, b)),
                (a, None) => a,
                (None, b) => b,
            }
        }

        Self {
            phase: self.phase.max(incoming.phase),
            extreme_price_seen: favorable(side, self.extreme_price_seen, incoming.extreme_price_seen),
            current_stop_level: favorable(side, self.current_stop_level, incoming.current_stop_level),
        }
    }
}

impl Default for TrailingState {
    fn default() -> Self {
        Self::inactive()
    }
}

// =============================================================================
// Position
// =============================================================================

/// Position represents one open perpetual-futures trade
///
/// Owned exclusively by the position store. Derived fields
/// (`unrealized_pnl_*`, `max_favorable_pnl_pct`) are recomputed whenever a
/// patch touches price, entry or quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Unique id (UUID v7)
    pub id: PositionId,
    /// Trading pair
    pub symbol: Symbol,
    /// Long or short
    pub side: Side,
    /// Average entry price
    pub entry_price: Price,
    /// Size in base units
    pub quantity: Quantity,
    /// Leverage multiplier
    pub leverage: Leverage,
    /// Margin allocated from the balance ledger
    pub margin_committed: Decimal,
    /// Last marked price
    pub current_price: Price,
    /// Unrealized return on equity (price move × leverage)
    pub unrealized_pnl_pct: Decimal,
    /// Unrealized PnL in quote currency
    pub unrealized_pnl_usd: Decimal,
    /// High-water mark of `unrealized_pnl_pct`
    pub max_favorable_pnl_pct: Decimal,
    /// Protective stop installed on the exchange
    pub protective_stop_price: Option<Price>,
    /// Take-profit installed alongside the stop
    pub take_profit_price: Option<Price>,
    /// Trailing stop state machine
    pub trailing: TrailingState,
    /// Lifecycle status
    pub status: PositionStatus,
    /// Opened by the engine or imported from the exchange
    pub origin: PositionOrigin,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time of the last applied patch
    pub last_updated_at: DateTime<Utc>,
    /// Incremented on every mutation; journals keep the highest version
    pub version: u64,
}

impl Position {
    /// Create a position for an entry the engine is about to submit
    pub fn new(
        symbol: Symbol,
        side: Side,
        entry_price: Price,
        quantity: Quantity,
        leverage: Leverage,
        margin_committed: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            symbol,
            side,
            entry_price,
            quantity,
            leverage,
            margin_committed,
            current_price: entry_price,
            unrealized_pnl_pct: Decimal::ZERO,
            unrealized_pnl_usd: Decimal::ZERO,
            max_favorable_pnl_pct: Decimal::ZERO,
            protective_stop_price: None,
            take_profit_price: None,
            trailing: TrailingState::inactive(),
            status: PositionStatus::Opening,
            origin: PositionOrigin::Engine,
            created_at: now,
            last_updated_at: now,
            version: 1,
        }
    }

    /// Create a position discovered on the exchange (already open)
    #[allow(clippy::too_many_arguments)]
    pub fn imported(
        symbol: Symbol,
        side: Side,
        entry_price: Price,
        quantity: Quantity,
        leverage: Leverage,
        margin_committed: Decimal,
        mark_price: Price,
        stop_price: Option<Price>,
    ) -> Self {
        let mut position = Self::new(symbol, side, entry_price, quantity, leverage, margin_committed);
        position.status = PositionStatus::Open;
        position.origin = PositionOrigin::Imported;
        position.protective_stop_price = stop_price;
        position.current_price = mark_price;
        position.recompute_pnl();
        position
    }

    /// Status is `Open`
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Notional value at the last marked price
    pub fn notional(&self) -> Decimal {
        self.quantity.notional_at(self.current_price)
    }

    /// Margin implied by quantity, entry and leverage
    pub fn implied_margin(&self) -> Decimal {
        self.quantity.notional_at(self.entry_price) / self.leverage.as_decimal()
    }

    /// Active trailing level the protective stop has not caught up with.
    ///
    /// `None` unless trailing is active and the level is more favorable than
    /// the protective stop by more than `tolerance_pct` (or there is no stop).
    pub fn unprotected_trailing_level(&self, tolerance_pct: Decimal) -> Option<Price> {
        if self.trailing.phase != TrailingPhase::Active {
            return None;
        }
        let level = self.trailing.current_stop_level?;
        let Some(stop) = self.protective_stop_price else {
            return Some(level);
        };
        if !self.side.is_more_favorable(level, stop) {
            return None;
        }
        let gap = (level.as_decimal() - stop.as_decimal()).abs() / stop.as_decimal();
        (gap > tolerance_pct).then_some(level)
    }

    /// Apply a patch as one atomic step.
    ///
    /// Either every field in the patch is applied or none is: the status
    /// transition is validated before anything is written.
    ///
    /// # Errors
    /// - `InvalidStateTransition` if the position is closed or the requested
    ///   status change is not allowed
    pub fn apply(&mut self, patch: &PositionPatch, now: DateTime<Utc>) -> Result<(), DomainError> {
        if self.status.is_terminal() {
            return Err(DomainError::InvalidStateTransition(format!(
                "position {} is closed",
                self.id
            )));
        }
        if let Some(next) = patch.status {
            if next != self.status && !self.status.can_transition_to(next) {
                return Err(DomainError::InvalidStateTransition(format!(
                    "{} -> {}",
                    self.status.name(),
                    next.name()
                )));
            }
        }

        let reprice =
            patch.current_price.is_some() || patch.entry_price.is_some() || patch.quantity.is_some();

        if let Some(price) = patch.current_price {
            self.current_price = price;
        }
        if let Some(entry) = patch.entry_price {
            self.entry_price = entry;
        }
        if let Some(quantity) = patch.quantity {
            self.quantity = quantity;
        }
        if let Some(trailing) = patch.trailing {
            self.trailing = self.trailing.merge(self.side, trailing);
        }
        if let Some(stop) = patch.protective_stop {
            // Once trailing is active the stop only ratchets
            self.protective_stop_price = match (self.trailing.phase, self.protective_stop_price) {
                (TrailingPhase::Active, Some(current)) => Some(self.side.most_favorable(current, stop)),
                _ => Some(stop),
            };
        }
        if let Some(take_profit) = patch.take_profit {
            self.take_profit_price = Some(take_profit);
        }
        if let Some(status) = patch.status {
            self.status = status;
        }

        if reprice {
            self.recompute_pnl();
        }

        self.last_updated_at = now;
        self.version += 1;
        Ok(())
    }

    fn recompute_pnl(&mut self) {
        let entry = self.entry_price.as_decimal();
        let price = self.current_price.as_decimal();
        let quantity = self.quantity.as_decimal();

        self.unrealized_pnl_usd = match self.side {
            Side::Long => (price - entry) * quantity,
            Side::Short => (entry - price) * quantity,
        };
        self.unrealized_pnl_pct = roe_at(self.side, self.entry_price, self.current_price, self.leverage);
        self.max_favorable_pnl_pct = self.max_favorable_pnl_pct.max(self.unrealized_pnl_pct);
    }
}

// =============================================================================
// Position Patch
// =============================================================================

/// Partial field set for a compound update
///
/// `None` means "leave unchanged". Derived fields are not part of the patch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionPatch {
    /// New marked price
    pub current_price: Option<Price>,
    /// New average entry (exchange reconciliation)
    pub entry_price: Option<Price>,
    /// New quantity (exchange reconciliation)
    pub quantity: Option<Quantity>,
    /// New protective stop
    pub protective_stop: Option<Price>,
    /// New take-profit
    pub take_profit: Option<Price>,
    /// Trailing state, merged with the stored one
    pub trailing: Option<TrailingState>,
    /// Status change, validated against the transition table
    pub status: Option<PositionStatus>,
}

impl PositionPatch {
    /// Mark-to-market patch
    pub fn price(price: Price) -> Self {
        Self {
            current_price: Some(price),
            ..Default::default()
        }
    }

    /// Protective stop patch
    pub fn stop(stop: Price, take_profit: Option<Price>) -> Self {
        Self {
            protective_stop: Some(stop),
            take_profit,
            ..Default::default()
        }
    }

    /// Status change patch
    pub fn status(status: PositionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// True when the patch changes nothing
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

// =============================================================================
// Tests
// =============================================================================
