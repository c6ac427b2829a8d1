//! Perpguard Storage Layer
//!
//! Shared mutable state managers and their persistence.
//!
//! # Architecture
//!
//! - **PositionStore**: live positions behind one lock, compound updates only
//! - **BalanceLedger**: capital allocation behind one lock
//! - **PositionJournal**: durable snapshots (memory, JSON lines, PostgreSQL
//!   with feature `postgres`)
//!
//! # Usage
//!
//! ```rust
//! use perpguard_store::{BalanceLedger, MemoryJournal, PositionStore};
//! use perpguard_domain::{Leverage, Position, Price, Quantity, Side, Symbol};
//! use rust_decimal_macros::dec;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = PositionStore::new(Arc::new(MemoryJournal::new()));
//!     let ledger = BalanceLedger::new(dec!(1000), dec!(0.8));
//!
//!     assert!(ledger.allocate(dec!(100), "BTCUSDT"));
//!     let position = Position::new(
//!         Symbol::from_pair("BTCUSDT").unwrap(),
//!         Side::Long,
//!         Price::new(dec!(95000)).unwrap(),
//!         Quantity::new(dec!(0.0084)).unwrap(),
//!         Leverage::new(8).unwrap(),
//!         dec!(100),
//!     );
//!     let id = store.create(position).await.unwrap();
//!     assert_eq!(store.get(id).unwrap().margin_committed, dec!(100));
//! }
//! ```

#![warn(clippy::all)]

// Modules
mod error;
mod journal;
mod ledger;
mod position_store;
#[cfg(feature = "postgres")]
mod postgres;

// Re-exports
pub use error::{StoreError, StoreResult};
pub use journal::{FileJournal, MemoryJournal, PositionJournal};
pub use ledger::{BalanceLedger, LedgerSnapshot, Reservation};
pub use position_store::{CreateOutcome, PositionStore};
#[cfg(feature = "postgres")]
pub use postgres::PgJournal;
