/// Single-flight value log compaction
///
/// A pass compacts the store once `deletes - gc_runs * threshold` exceeds the
/// threshold. The run counter is persisted so the baseline survives restarts.

use crate::Result;
use distill_core::{
    encode_key, read_counter, write_counter, CompactionReport, KeyCategory, StoreExt,
    TransactionalStore,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// System counter holding the number of completed compaction passes
pub const GC_COUNT_KEY: &str = "distill_sys_gc_count";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MaintenanceOutcome {
    /// Another pass was running; this trigger was dropped
    Busy,
    NotNeeded,
    Compacted(CompactionReport),
}

pub struct MaintenanceScheduler {
    store: Arc<dyn TransactionalStore>,
    deletes_threshold: u64,
    discard_ratio: f64,
    running: AtomicBool,
}

/// Releases the running flag when a pass ends, even on error
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl MaintenanceScheduler {
    pub fn new(store: Arc<dyn TransactionalStore>, deletes_threshold: u64, discard_ratio: f64) -> Self {
        Self {
            store,
            deletes_threshold: deletes_threshold.max(1),
            discard_ratio,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Completed compaction passes recorded in the store
    pub fn gc_count(&self) -> Result<u64> {
        let key = encode_key(KeyCategory::SystemCounter, GC_COUNT_KEY)?;
        Ok(self.store.view(|txn| read_counter(txn, &key))?)
    }

    /// Consider a compaction pass given the current delete total.
    ///
    /// Never blocks and never queues: when a pass is already running the
    /// trigger is ignored and `Busy` is returned.
    pub fn run_if_needed(&self, total_deletes: impl Fn() -> u64) -> Result<MaintenanceOutcome> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Maintenance already running, skipping trigger");
            return Ok(MaintenanceOutcome::Busy);
        }
        let _guard = RunningGuard(&self.running);
        self.evaluate(total_deletes())
    }

    fn evaluate(&self, deletes: u64) -> Result<MaintenanceOutcome> {
        let key = encode_key(KeyCategory::SystemCounter, GC_COUNT_KEY)?;
        let mut gc_count = self.store.view(|txn| read_counter(txn, &key))?;

        let mut baseline = gc_count.saturating_mul(self.deletes_threshold);
        if baseline > deletes {
            debug!(
                "Delete counter reset detected ({} < {}), restarting gc baseline",
                deletes, baseline
            );
            gc_count = 0;
            baseline = 0;
        }

        let pending = deletes - baseline;
        if pending <= self.deletes_threshold {
            return Ok(MaintenanceOutcome::NotNeeded);
        }

        info!(
            "Start maintenance {} for deletes {} > {}",
            gc_count, pending, self.deletes_threshold
        );
        let report = self.store.compact(self.discard_ratio)?;
        gc_count += 1;
        self.store
            .update(|txn| write_counter(txn, &key, gc_count))?;
        info!(
            "End maintenance {} (rewritten: {}, {} -> {} bytes)",
            gc_count, report.rewritten, report.bytes_before, report.bytes_after
        );
        Ok(MaintenanceOutcome::Compacted(report))
    }
}
