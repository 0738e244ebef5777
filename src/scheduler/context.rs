use std::sync::Arc;

use crate::scheduler::callbacks::CallbackRegistry;
use crate::scheduler::observers::Observers;
use crate::scheduler::stats::Statistics;

/// Process-wide registry shared by every scheduler of a scan: the callback
/// dispatch table, aggregate statistics and context-level observers.
///
/// Create one per scan and hand it to each scheduler.
pub struct PoolContext {
    callbacks: CallbackRegistry,
    statistics: Statistics,
    observers: Observers,
}

impl PoolContext {
    pub fn new(callbacks: CallbackRegistry) -> Arc<Self> {
        Arc::new(Self {
            callbacks,
            statistics: Statistics::new(),
            observers: Observers::new(),
        })
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn observers(&self) -> &Observers {
        &self.observers
    }

    /// Resets statistics and drops observers, e.g. between scans.
    pub fn reset(&self) {
        self.statistics.reset();
        self.observers.clear();
    }
}

impl std::fmt::Debug for PoolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolContext")
            .field("callbacks", &self.callbacks.len())
            .field("statistics", &self.statistics.snapshot())
            .finish()
    }
}
