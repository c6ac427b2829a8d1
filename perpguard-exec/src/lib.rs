//! Perpguard Execution Layer
//!
//! Everything that talks to the exchange.
//!
//! # Architecture
//!
//! ```text
//! Loops → OrderExecutor → RateLimitedCache → ExchangeGateway → Exchange
//!           (retry,          (TTL cache,
//!            validation)      rate window)
//! ```
//!
//! # Components
//!
//! - **Ports**: the `ExchangeGateway` trait and its data types
//! - **Cache**: TTL cache and call-rate budget in front of the gateway
//! - **Executor**: stop validation, error taxonomy and bounded retry
//! - **Stub**: in-memory exchange for tests and stub mode
//!
//! # Example
//!
//! ```rust,ignore
//! use perpguard_exec::{CacheConfig, ExecutorConfig, OrderExecutor, RateLimitedCache, StubGateway};
//! use std::sync::Arc;
//!
//! let gateway = Arc::new(StubGateway::new(dec!(1000)));
//! let cache = Arc::new(RateLimitedCache::new(gateway, CacheConfig::from(&config)));
//! let executor = OrderExecutor::new(cache, ExecutorConfig::from(&config));
//!
//! let fill = executor.open_position(&symbol, Side::Long, quantity, leverage).await?;
//! ```

#![warn(clippy::all)]

pub mod cache;
pub mod error;
pub mod executor;
pub mod ports;
pub mod stub;

// Re-exports for convenience
pub use cache::{CacheConfig, CacheStats, Cached, Freshness, RateLimitedCache};
pub use error::{ErrorClass, ExchangeErrorCode, ExecError, ExecResult, GatewayError};
pub use executor::{
    compliant_stop, CloseOutcome, ExecutorConfig, OrderExecutor, StopKind, StopPlacement,
    StopRequest,
};
pub use ports::{ExchangeGateway, ExchangePosition, OrderFill, Ticker};
pub use stub::{Operation, StubGateway};
