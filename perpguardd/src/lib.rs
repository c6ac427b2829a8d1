//! perpguard Daemon Library
//!
//! Runtime for the perpetual-futures position and risk engine.
//!
//! # Architecture
//!
//! ```text
//!   Signal Source ──► Slow Cycle ──► Order Executor ──► Rate-Limited Cache ──► Exchange
//!                      │    │                ▲
//!                      │    └► Safety Monitor┤
//!                      ▼                     │
//!   Balance Ledger ◄── Position Store ◄── Fast Monitor Loop (trailing stops)
//!                            │
//!                        Journal
//! ```
//!
//! # Components
//!
//! - **Daemon**: Wires components, restores state, runs both loops
//! - **Slow Cycle**: Balance sync, reconciliation, safety sweep, new entries
//! - **Fast Loop**: Marks positions and advances trailing stops
//! - **Safety Monitor**: Protective stops with bounded retries, forced closes
//! - **Position Closer**: Single-winner exits shared by every caller
//! - **Event Bus / Metrics**: Engine events and Prometheus counters
//! - **Config**: Environment-based configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use perpguardd::{Config, Daemon};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let journal = Daemon::open_journal(&config).await?;
//!     Daemon::new_stub(config, journal)?.run().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod daemon;
pub mod error;
pub mod event_bus;
pub mod exit;
pub mod fast_loop;
pub mod metrics;
pub mod safety;
pub mod signals;
pub mod slow_cycle;

#[cfg(test)]
mod test_support;

// Re-exports for convenience
pub use config::{Config, Environment};
pub use daemon::Daemon;
pub use error::{DaemonError, DaemonResult};
pub use event_bus::{CloseReason, EngineEvent, EventBus, EventReceiver};
pub use exit::{ExitOutcome, PositionCloser};
pub use fast_loop::{FastMonitorLoop, TickAction, TickReport};
pub use metrics::Metrics;
pub use safety::{Protection, SafetyConfig, SafetyMonitor, SweepReport};
pub use signals::{SignalSource, StaticSignalSource};
pub use slow_cycle::{CycleReport, ReconcileReport, SlowCycleOrchestrator};
