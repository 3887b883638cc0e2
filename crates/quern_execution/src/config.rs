use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use quern_error::{QuernError, Result};

/// Per-query execution settings.
///
/// These are plain values threaded into the operator at init rather than
/// process-wide flags, so two concurrent queries can run with different
/// settings.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Per-operator memory budget in bytes for sorters and hash tables.
    pub work_mem: usize,

    /// When false, hash aggregation never spills; exceeding the sized table
    /// with spilling disabled is an error.
    pub enable_hybrid_hash_agg: bool,

    /// Number of batch files a spilled hash table is partitioned into.
    pub default_hashagg_nbatches: usize,

    /// Emit diagnostics at spill/reload boundaries.
    pub hybrid_hash_agg_debug: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            work_mem: 4 * 1024 * 1024,
            enable_hybrid_hash_agg: false,
            default_hashagg_nbatches: 32,
            hybrid_hash_agg_debug: false,
        }
    }
}

/// Cooperative cancellation handle.
///
/// Checked on every input fetch and on every iteration of the ordered
/// aggregate drain loop. Cloning shares the underlying flag.
#[derive(Debug, Clone, Default)]
pub struct Interrupts {
    flag: Arc<AtomicBool>,
}

impl Interrupts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Safe to call from any thread.
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_interrupted() {
            Err(QuernError::Interrupted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_shared_across_clones() {
        let interrupts = Interrupts::new();
        let other = interrupts.clone();
        assert!(interrupts.check().is_ok());

        other.interrupt();
        assert!(matches!(interrupts.check(), Err(QuernError::Interrupted)));
    }
}
