//! Execution layer error types.
//!
//! Exchange failures carry a code; each code maps to one class of the
//! error taxonomy, which drives the executor's retry policy.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// Classification
// =============================================================================

/// How a failure should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Retry with bounded exponential backoff
    Transient,
    /// Auto-correct once and retry; a second failure is permanent
    Validation,
    /// Surface immediately, no retry
    Permanent,
    /// The requested state already holds; treat as success
    NoOp,
}

/// Exchange error codes the gateway normalizes into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeErrorCode {
    /// Request timed out
    Timeout,
    /// Exchange (or local budget) rejected the call for rate
    RateLimited,
    /// Exchange 5xx
    ServerError,
    /// Connection-level failure
    Network,
    /// Stop on the wrong side of entry/price
    InvalidStopDirection,
    /// Stop closer to price than the exchange allows
    StopTooClose,
    /// Price not a multiple of the tick size
    InvalidTickSize,
    /// Stop/target already set to this value
    NotModified,
    /// Position already closed
    AlreadyClosed,
    /// Not enough margin
    InsufficientFunds,
    /// Account in reduce-only mode
    ReduceOnly,
    /// Quantity below the exchange minimum
    BelowMinimumSize,
    /// Symbol not listed
    UnknownSymbol,
    /// No position to attach a stop to
    NoPosition,
    /// Any other rejection
    Rejected,
}

impl ExchangeErrorCode {
    /// Taxonomy class for this code
    pub fn class(&self) -> ErrorClass {
        use ExchangeErrorCode::*;
        match self {
            Timeout | RateLimited | ServerError | Network => ErrorClass::Transient,
            InvalidStopDirection | StopTooClose | InvalidTickSize => ErrorClass::Validation,
            NotModified | AlreadyClosed => ErrorClass::NoOp,
            InsufficientFunds | ReduceOnly | BelowMinimumSize | UnknownSymbol | NoPosition
            | Rejected => ErrorClass::Permanent,
        }
    }
}

impl fmt::Display for ExchangeErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Error returned by an exchange gateway
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct GatewayError {
    /// Normalized exchange code
    pub code: ExchangeErrorCode,
    /// Exchange-provided message
    pub message: String,
}

impl GatewayError {
    /// Create a gateway error
    pub fn new(code: ExchangeErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Taxonomy class of this error
    pub fn class(&self) -> ErrorClass {
        self.code.class()
    }
}

// =============================================================================
// Execution Errors
// =============================================================================

/// Errors that can occur during execution operations.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Exchange rejected or failed the call
    #[error("Exchange error: {0}")]
    Gateway(#[from] GatewayError),

    /// Transient failures persisted past the retry bound
    #[error("Retries exhausted for {operation} on {symbol} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Operation name (set_stop, place_order, close_position)
        operation: &'static str,
        /// Trading pair
        symbol: String,
        /// Attempts made
        attempts: u32,
        /// Last error seen
        last_error: String,
    },

    /// Validation error persisted after one auto-correction
    #[error("Validation failed for {symbol} after correction: {reason}")]
    ValidationFailed {
        /// Trading pair
        symbol: String,
        /// Last rejection
        reason: String,
    },

    /// No cached value and no rate budget left
    #[error("Rate budget exhausted for {0} and nothing cached")]
    RateLimited(String),

    /// A fresh value was required but only stale data is available
    #[error("Stale data for {0}")]
    Stale(String),

    /// Request cannot be built from the given inputs
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Domain error
    #[error("Domain error: {0}")]
    Domain(#[from] perpguard_domain::DomainError),
}

impl ExecError {
    /// Taxonomy class of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            ExecError::Gateway(e) => e.class(),
            ExecError::RetriesExhausted { .. } | ExecError::RateLimited(_) | ExecError::Stale(_) => {
                ErrorClass::Transient
            },
            ExecError::ValidationFailed { .. }
            | ExecError::InvalidRequest(_)
            | ExecError::Domain(_) => ErrorClass::Permanent,
        }
    }

    /// Exchange code, if this error came from the exchange
    pub fn code(&self) -> Option<ExchangeErrorCode> {
        match self {
            ExecError::Gateway(e) => Some(e.code),
            _ => None,
        }
    }
}

/// Result type for execution operations.
pub type ExecResult<T> = Result<T, ExecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_classes() {
        assert_eq!(ExchangeErrorCode::Timeout.class(), ErrorClass::Transient);
        assert_eq!(ExchangeErrorCode::RateLimited.class(), ErrorClass::Transient);
        assert_eq!(ExchangeErrorCode::StopTooClose.class(), ErrorClass::Validation);
        assert_eq!(ExchangeErrorCode::NotModified.class(), ErrorClass::NoOp);
        assert_eq!(ExchangeErrorCode::InsufficientFunds.class(), ErrorClass::Permanent);
        assert_eq!(ExchangeErrorCode::BelowMinimumSize.class(), ErrorClass::Permanent);
    }

    #[test]
    fn test_exec_error_classes() {
        let gateway: ExecError = GatewayError::new(ExchangeErrorCode::ReduceOnly, "reduce only").into();
        assert_eq!(gateway.class(), ErrorClass::Permanent);
        assert_eq!(gateway.code(), Some(ExchangeErrorCode::ReduceOnly));

        let exhausted = ExecError::RetriesExhausted {
            operation: "set_stop",
            symbol: "BTCUSDT".to_string(),
            attempts: 3,
            last_error: "Timeout".to_string(),
        };
        assert_eq!(exhausted.class(), ErrorClass::Transient);

        let failed = ExecError::ValidationFailed {
            symbol: "BTCUSDT".to_string(),
            reason: "StopTooClose".to_string(),
        };
        assert_eq!(failed.class(), ErrorClass::Permanent);
    }

    #[test]
    fn test_gateway_error_display() {
        let err = GatewayError::new(ExchangeErrorCode::StopTooClose, "min distance 0.1%");
        assert_eq!(err.to_string(), "StopTooClose: min distance 0.1%");
    }
}
