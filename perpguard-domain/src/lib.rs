//! Perpguard Domain Layer
//!
//! Pure domain logic with zero I/O dependencies.
//! Contains the position entity, value objects, the trailing stop state
//! machine and the engine configuration.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Public modules
pub mod config;
pub mod entities;
pub mod signal;
pub mod trailing;
pub mod value_objects;

// Re-export commonly used types
pub use config::EngineConfig;
pub use entities::{
    Position, PositionId, PositionOrigin, PositionPatch, PositionStatus, TrailingPhase,
    TrailingState,
};
pub use signal::{select_candidates, Signal};
pub use trailing::{
    evaluate, is_stop_hit, price_for_roe, roe_at, PriceObservation, TrailingDecision,
    TrailingParams,
};
pub use value_objects::{DomainError, Leverage, OrderSide, Price, Quantity, Side, Symbol};
