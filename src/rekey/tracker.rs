use std::collections::HashMap;

use parking_lot::Mutex;

/// Final counts reported to the external rekey service after a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RekeyOutcome {
    pub processed: u64,
    pub failed: u64,
    pub batches: u64,
}

/// Per-(tenant, key) progress counters for one scheduled run.
///
/// Failures are counted, never propagated, until a tenant exceeds the
/// configured threshold; the scheduler then aborts that tenant's run only.
/// A negative threshold means unlimited.
pub struct ProgressTracker {
    max_failures: i64,
    counters: Mutex<HashMap<(String, String), RekeyOutcome>>,
}

impl ProgressTracker {
    pub fn new(max_failures: i64) -> Self {
        Self {
            max_failures,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_failures(&self) -> i64 {
        self.max_failures
    }

    /// Record one completed batch for `(tenant, key)`.
    pub fn record_batch(&self, tenant_id: &str, key_id: &str, processed: u64, failed: u64) {
        let mut counters = self.counters.lock();
        let entry = counters
            .entry((tenant_id.to_string(), key_id.to_string()))
            .or_default();
        entry.processed += processed;
        entry.failed += failed;
        entry.batches += 1;
    }

    /// Failures accumulated across every key of `tenant_id` this run.
    pub fn tenant_failures(&self, tenant_id: &str) -> u64 {
        self.counters
            .lock()
            .iter()
            .filter(|((t, _), _)| t == tenant_id)
            .map(|(_, o)| o.failed)
            .sum()
    }

    /// Whether the tenant has burned through its failure budget.
    pub fn threshold_exceeded(&self, tenant_id: &str) -> bool {
        self.max_failures >= 0 && self.tenant_failures(tenant_id) > self.max_failures as u64
    }

    /// Aggregate counts for the tenant across all of its keys.
    pub fn tenant_outcome(&self, tenant_id: &str) -> RekeyOutcome {
        let counters = self.counters.lock();
        let mut outcome = RekeyOutcome::default();
        for ((t, _), o) in counters.iter() {
            if t == tenant_id {
                outcome.processed += o.processed;
                outcome.failed += o.failed;
                outcome.batches += o.batches;
            }
        }
        outcome
    }

    /// Counts for one (tenant, key) pair.
    pub fn key_outcome(&self, tenant_id: &str, key_id: &str) -> RekeyOutcome {
        self.counters
            .lock()
            .get(&(tenant_id.to_string(), key_id.to_string()))
            .copied()
            .unwrap_or_default()
    }
}
