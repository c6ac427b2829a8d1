//! Signal source port.
//!
//! The decision loop pulls ranked trade signals from an external source;
//! how they are produced is outside the engine.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use perpguard_domain::Signal;

use crate::error::DaemonResult;

/// External producer of trade signals.
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Current batch of signals, not necessarily ranked.
    async fn fetch_signals(&self) -> DaemonResult<Vec<Signal>>;
}

/// Scripted signal source for tests and stub mode.
///
/// Returns queued batches in order, then keeps returning the fallback batch.
pub struct StaticSignalSource {
    batches: Mutex<VecDeque<Vec<Signal>>>,
    fallback: Vec<Signal>,
}

impl StaticSignalSource {
    /// Always return `signals`
    pub fn new(signals: Vec<Signal>) -> Self {
        Self {
            batches: Mutex::new(VecDeque::new()),
            fallback: signals,
        }
    }

    /// Return each batch once, then nothing
    pub fn scripted(batches: Vec<Vec<Signal>>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            fallback: Vec::new(),
        }
    }

    /// Never return any signals
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl SignalSource for StaticSignalSource {
    async fn fetch_signals(&self) -> DaemonResult<Vec<Signal>> {
        let next = self
            .batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}
