//! Bounded device-slot tracker.
//!
//! Holds one permit per accelerator plus a map of which job leases
//! which slot. Admission is FIFO-fair: `tokio::sync::Semaphore`
//! queues waiters in arrival order, so a later job never overtakes an
//! earlier one. On a host without accelerators the tracker degrades
//! to a single permit and leases carry no slot index.

use crate::error::RunnerError;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

pub struct GpuTracker {
    permits: Arc<Semaphore>,
    inner: Mutex<TrackerInner>,
    /// Physical slot count; 0 on a CPU-only host. Fixed for the
    /// process lifetime.
    total: usize,
    capacity: usize,
}

struct TrackerInner {
    free: BTreeSet<u32>,
    leased: BTreeMap<String, u32>,
}

impl GpuTracker {
    pub fn new(slots: usize) -> Arc<Self> {
        let capacity = slots.max(1);
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(capacity)),
            inner: Mutex::new(TrackerInner {
                free: (0..slots as u32).collect(),
                leased: BTreeMap::new(),
            }),
            total: slots,
            capacity,
        })
    }

    /// Number of physical slots (0 on a CPU-only host).
    pub fn total_slots(&self) -> usize {
        self.total
    }

    /// Permits currently held by running jobs.
    pub fn leased(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Wait for a free slot. Callers race this against shutdown; a
    /// dropped acquire future leaves the FIFO queue cleanly.
    pub async fn acquire(self: &Arc<Self>, job_id: &str) -> Result<GpuLease, RunnerError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RunnerError::Tracker("semaphore closed".to_string()))?;

        let slot = if self.total == 0 {
            None
        } else {
            let mut inner = self.inner.lock().expect("tracker mutex poisoned");
            let slot = inner
                .free
                .pop_first()
                .expect("permit held but no free device slot");
            inner.leased.insert(job_id.to_string(), slot);
            Some(slot)
        };

        crate::metrics::set_slots_leased(self.leased() as f64);
        debug!(job_id = %job_id, slot = ?slot, "Device slot leased");

        Ok(GpuLease {
            tracker: Arc::clone(self),
            job_id: job_id.to_string(),
            slot,
            _permit: permit,
        })
    }

    /// Return a slot to the free set. Double release is a programming
    /// error and fails loudly.
    fn release(&self, job_id: &str, slot: u32) {
        let mut inner = self.inner.lock().expect("tracker mutex poisoned");
        let removed = inner.leased.remove(job_id);
        assert_eq!(
            removed,
            Some(slot),
            "double release of device slot {slot} (job {job_id})"
        );
        assert!(
            inner.free.insert(slot),
            "device slot {slot} returned while already free"
        );
    }

    #[cfg(test)]
    fn release_for_test(&self, job_id: &str, slot: u32) {
        self.release(job_id, slot);
    }
}

/// Exclusive lease on one device slot. Dropping the lease returns the
/// slot, so release happens on every exit path of a worker task.
pub struct GpuLease {
    tracker: Arc<GpuTracker>,
    job_id: String,
    pub slot: Option<u32>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for GpuLease {
    fn drop(&mut self) {
        if let Some(slot) = self.slot {
            self.tracker.release(&self.job_id, slot);
        }
        crate::metrics::set_slots_leased((self.tracker.leased().saturating_sub(1)) as f64);
    }
}
