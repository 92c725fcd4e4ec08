//! Shared handler state

use crate::config::ServerSettings;
use crate::ledger::LedgerReceiver;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Shared state of the peer-facing routes
#[derive(Clone)]
pub struct ApiState {
    /// Stores replicated ledger entries
    pub receiver: LedgerReceiver,
    /// Bounds concurrent replication requests; a full gate answers 503
    pub gate: Arc<Semaphore>,
    /// Request body limit in bytes
    pub body_limit: usize,
}

impl ApiState {
    /// State for `receiver` under the listener limits in `settings`
    pub fn new(receiver: LedgerReceiver, settings: &ServerSettings) -> Self {
        Self {
            receiver,
            gate: Arc::new(Semaphore::new(settings.max_concurrent_requests)),
            body_limit: settings.body_limit_bytes,
        }
    }
}
