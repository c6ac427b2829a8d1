//! Balance ledger
//!
//! Single source of truth for capital allocation. One lock guards all
//! fields; every mutation checks the capital-safety invariant before it
//! writes:
//!
//! ```text
//! allocated_margin + reserved_margin <= total_balance × max_allocation_fraction
//! ```
//!
//! `sync_total_balance` is the one operation that can shrink the ceiling
//! under existing allocations. It never invalidates them; the snapshot
//! reports the condition and further allocations fail until it clears.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

/// Margin held for an order in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// Reservation id
    pub id: Uuid,
    /// Reserved amount
    pub amount: Decimal,
}

/// Point-in-time view of the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerSnapshot {
    /// Last synced exchange balance
    pub total: Decimal,
    /// Margin committed to live positions
    pub allocated: Decimal,
    /// Margin held for orders in flight
    pub reserved: Decimal,
    /// Remaining capacity under the allocation ceiling
    pub available: Decimal,
    /// `total - session_start_balance`
    pub session_pnl: Decimal,
    /// Allocations rejected for overexposure so far
    pub overexposure_prevented: u64,
    /// True if a balance sync left commitments above the ceiling
    pub over_ceiling: bool,
}

#[derive(Debug)]
struct LedgerState {
    total_balance: Decimal,
    allocated_margin: Decimal,
    reserved_margin: Decimal,
    session_start_balance: Option<Decimal>,
    overexposure_prevented: u64,
    reservations: HashMap<Uuid, Decimal>,
}

impl LedgerState {
    fn ceiling(&self, fraction: Decimal) -> Decimal {
        self.total_balance * fraction
    }

    fn committed(&self) -> Decimal {
        self.allocated_margin + self.reserved_margin
    }

    fn fits(&self, amount: Decimal, fraction: Decimal) -> bool {
        self.committed() + amount <= self.ceiling(fraction)
    }
}

/// Thread-safe capital ledger shared by both loops
pub struct BalanceLedger {
    state: Mutex<LedgerState>,
    max_allocation_fraction: Decimal,
}

impl BalanceLedger {
    /// Create a ledger with a starting balance
    ///
    /// A positive starting balance also becomes the session start; otherwise
    /// the first `sync_total_balance` sets it.
    pub fn new(total_balance: Decimal, max_allocation_fraction: Decimal) -> Self {
        let total_balance = total_balance.max(Decimal::ZERO);
        Self {
            state: Mutex::new(LedgerState {
                total_balance,
                allocated_margin: Decimal::ZERO,
                reserved_margin: Decimal::ZERO,
                session_start_balance: (total_balance > Decimal::ZERO).then_some(total_balance),
                overexposure_prevented: 0,
                reservations: HashMap::new(),
            }),
            max_allocation_fraction,
        }
    }

    // Every mutation checks before it writes, so a poisoned guard still
    // holds a state satisfying the invariant.
    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocation ceiling fraction this ledger enforces
    pub fn max_allocation_fraction(&self) -> Decimal {
        self.max_allocation_fraction
    }

    /// Commit margin to a live position.
    ///
    /// Succeeds iff `allocated + reserved + amount <= total × fraction`.
    /// A rejection changes nothing except the overexposure counter.
    pub fn allocate(&self, amount: Decimal, reason: &str) -> bool {
        if amount < Decimal::ZERO {
            warn!(%amount, reason, "Rejected negative allocation");
            return false;
        }
        let mut state = self.lock();
        if !state.fits(amount, self.max_allocation_fraction) {
            state.overexposure_prevented += 1;
            warn!(
                %amount,
                reason,
                allocated = %state.allocated_margin,
                reserved = %state.reserved_margin,
                ceiling = %state.ceiling(self.max_allocation_fraction),
                "Overexposure prevented"
            );
            return false;
        }
        state.allocated_margin += amount;
        debug!(%amount, reason, allocated = %state.allocated_margin, "Margin allocated");
        true
    }

    /// Credit margin back; clamps at zero and never fails
    pub fn release(&self, amount: Decimal) {
        if amount <= Decimal::ZERO {
            return;
        }
        let mut state = self.lock();
        if amount > state.allocated_margin {
            warn!(%amount, allocated = %state.allocated_margin, "Release exceeds allocation, clamping to zero");
        }
        state.allocated_margin = (state.allocated_margin - amount).max(Decimal::ZERO);
        debug!(%amount, allocated = %state.allocated_margin, "Margin released");
    }

    /// Hold margin for an order that is about to be submitted.
    ///
    /// Reserved margin counts against the same ceiling as allocations.
    pub fn reserve(&self, amount: Decimal, reason: &str) -> Option<Reservation> {
        if amount <= Decimal::ZERO {
            return None;
        }
        let mut state = self.lock();
        if !state.fits(amount, self.max_allocation_fraction) {
            state.overexposure_prevented += 1;
            warn!(%amount, reason, "Overexposure prevented (reservation)");
            return None;
        }
        let reservation = Reservation {
            id: Uuid::now_v7(),
            amount,
        };
        state.reserved_margin += amount;
        state.reservations.insert(reservation.id, amount);
        debug!(%amount, reason, reservation_id = %reservation.id, "Margin reserved");
        Some(reservation)
    }

    /// Turn a reservation into an allocation (order filled).
    ///
    /// Moving margin from reserved to allocated leaves the committed total
    /// unchanged. Returns `false` if the reservation was already settled.
    pub fn commit_reservation(&self, reservation: &Reservation) -> bool {
        let mut state = self.lock();
        let Some(amount) = state.reservations.remove(&reservation.id) else {
            return false;
        };
        state.reserved_margin = (state.reserved_margin - amount).max(Decimal::ZERO);
        state.allocated_margin += amount;
        true
    }

    /// Drop a reservation (order failed). Returns `false` if already settled.
    pub fn release_reservation(&self, reservation: &Reservation) -> bool {
        let mut state = self.lock();
        let Some(amount) = state.reservations.remove(&reservation.id) else {
            return false;
        };
        state.reserved_margin = (state.reserved_margin - amount).max(Decimal::ZERO);
        true
    }

    /// Replace the total from an authoritative exchange read
    pub fn sync_total_balance(&self, new_total: Decimal) {
        if new_total < Decimal::ZERO {
            warn!(%new_total, "Ignoring negative balance from exchange");
            return;
        }
        let mut state = self.lock();
        state.total_balance = new_total;
        if state.session_start_balance.is_none() && new_total > Decimal::ZERO {
            state.session_start_balance = Some(new_total);
        }
        if state.committed() > state.ceiling(self.max_allocation_fraction) {
            warn!(
                total = %new_total,
                committed = %state.committed(),
                "Balance sync left commitments above the allocation ceiling"
            );
        }
    }

    /// Reporting view
    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.lock();
        let ceiling = state.ceiling(self.max_allocation_fraction);
        LedgerSnapshot {
            total: state.total_balance,
            allocated: state.allocated_margin,
            reserved: state.reserved_margin,
            available: (ceiling - state.committed()).max(Decimal::ZERO),
            session_pnl: state.total_balance - state.session_start_balance.unwrap_or(state.total_balance),
            overexposure_prevented: state.overexposure_prevented,
            over_ceiling: state.committed() > ceiling,
        }
    }

    /// Allocations rejected for overexposure so far
    pub fn overexposure_prevented(&self) -> u64 {
        self.lock().overexposure_prevented
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    #[test]
    fn test_allocation_respects_ceiling() {
        let ledger = BalanceLedger::new(dec!(1000), dec!(0.8));

        assert!(ledger.allocate(dec!(200), "BTCUSDT"));
        assert_eq!(ledger.snapshot().available, dec!(600));

        let before = ledger.snapshot();
        assert!(!ledger.allocate(dec!(700), "ETHUSDT"));
        let after = ledger.snapshot();

        assert_eq!(after.allocated, before.allocated);
        assert_eq!(after.available, before.available);
        assert_eq!(after.overexposure_prevented, 1);
    }

    #[test]
    fn test_allocation_exactly_at_ceiling() {
        let ledger = BalanceLedger::new(dec!(1000), dec!(0.8));
        assert!(ledger.allocate(dec!(800), "full"));
        assert!(!ledger.allocate(dec!(0.01), "over"));
        assert_eq!(ledger.snapshot().available, Decimal::ZERO);
    }

    #[test]
    fn test_release_clamps_at_zero() {
        let ledger = BalanceLedger::new(dec!(1000), dec!(0.8));
        ledger.allocate(dec!(100), "a");

        ledger.release(dec!(250));
        assert_eq!(ledger.snapshot().allocated, Decimal::ZERO);
    }

    #[test]
    fn test_reservation_counts_against_ceiling() {
        let ledger = BalanceLedger::new(dec!(1000), dec!(0.8));

        let reservation = ledger.reserve(dec!(500), "BTCUSDT").unwrap();
        assert!(!ledger.allocate(dec!(400), "ETHUSDT"));
        assert_eq!(ledger.snapshot().reserved, dec!(500));

        assert!(ledger.commit_reservation(&reservation));
        assert!(!ledger.commit_reservation(&reservation));
        assert!(!ledger.release_reservation(&reservation));

        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.reserved, Decimal::ZERO);
        assert_eq!(snapshot.allocated, dec!(500));
    }

    #[test]
    fn test_released_reservation_frees_capacity() {
        let ledger = BalanceLedger::new(dec!(1000), dec!(0.8));

        let reservation = ledger.reserve(dec!(800), "BTCUSDT").unwrap();
        assert!(ledger.reserve(dec!(1), "ETHUSDT").is_none());
        assert!(ledger.release_reservation(&reservation));
        assert!(ledger.allocate(dec!(800), "ETHUSDT"));
    }

    #[test]
    fn test_sync_sets_session_start_and_reports_over_ceiling() {
        let ledger = BalanceLedger::new(Decimal::ZERO, dec!(0.5));
        ledger.sync_total_balance(dec!(1000));
        assert!(ledger.allocate(dec!(500), "a"));

        ledger.sync_total_balance(dec!(800));
        let snapshot = ledger.snapshot();

        assert_eq!(snapshot.session_pnl, dec!(-200));
        assert_eq!(snapshot.allocated, dec!(500));
        assert!(snapshot.over_ceiling);
        assert_eq!(snapshot.available, Decimal::ZERO);
        assert!(!ledger.allocate(dec!(1), "b"));
    }

    #[test]
    fn test_concurrent_allocations_never_exceed_ceiling() {
        let ledger = Arc::new(BalanceLedger::new(dec!(1000), dec!(0.8)));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let ledger = ledger.clone();
                std::thread::spawn(move || ledger.allocate(dec!(100), &format!("t{i}")))
            })
            .collect();
        let granted = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();

        assert_eq!(granted, 8);
        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.allocated, dec!(800));
        assert_eq!(snapshot.overexposure_prevented, 8);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate(i64),
        Release(i64),
        Reserve(i64),
        Commit,
        Cancel,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1i64..500).prop_map(Op::Allocate),
            (1i64..500).prop_map(Op::Release),
            (1i64..500).prop_map(Op::Reserve),
            Just(Op::Commit),
            Just(Op::Cancel),
        ]
    }

    proptest! {
        /// Committed capital never exceeds the ceiling for any sequence of calls.
        #[test]
        fn capital_never_exceeds_ceiling(ops in proptest::collection::vec(op(), 1..100)) {
            let ledger = BalanceLedger::new(dec!(1000), dec!(0.8));
            let mut pending: Vec<Reservation> = Vec::new();

            for op in ops {
                match op {
                    Op::Allocate(n) => { ledger.allocate(Decimal::from(n), "prop"); },
                    Op::Release(n) => ledger.release(Decimal::from(n)),
                    Op::Reserve(n) => {
                        if let Some(r) = ledger.reserve(Decimal::from(n), "prop") {
                            pending.push(r);
                        }
                    },
                    Op::Commit => {
                        if let Some(r) = pending.pop() {
                            ledger.commit_reservation(&r);
                        }
                    },
                    Op::Cancel => {
                        if let Some(r) = pending.pop() {
                            ledger.release_reservation(&r);
                        }
                    },
                }

                let s = ledger.snapshot();
                prop_assert!(s.allocated + s.reserved <= s.total * dec!(0.8));
                prop_assert!(s.allocated >= Decimal::ZERO && s.reserved >= Decimal::ZERO);
                prop_assert!(!s.over_ceiling);
            }
        }
    }
}
