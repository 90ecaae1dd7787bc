//! Per-target mutual exclusion.
//!
//! The lock table is the only state shared between running jobs. Acquiring is
//! a single check-and-insert under one mutex, so two triggers for the same
//! target can never both get a lock. The returned [`TargetLock`] releases on
//! drop, which covers every way a job task can end.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::core::models::{ContainerRef, QuiesceAction};

/// A container a job has paused or stopped and not yet restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuiescedContainer {
    pub target_id: String,
    pub job_id: String,
    pub container: ContainerRef,
    pub action: QuiesceAction,
}

#[derive(Debug)]
struct LockEntry {
    job_id: String,
    quiesced: Option<QuiescedContainer>,
}

#[derive(Clone, Default)]
pub struct TargetLocks {
    inner: Arc<Mutex<HashMap<String, LockEntry>>>,
}

impl TargetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `target_id`, or `None` if a job already holds it.
    pub fn try_acquire(&self, target_id: &str, job_id: &str) -> Option<TargetLock> {
        let mut table = self.table();
        if table.contains_key(target_id) {
            return None;
        }
        table.insert(
            target_id.to_string(),
            LockEntry {
                job_id: job_id.to_string(),
                quiesced: None,
            },
        );
        Some(TargetLock {
            locks: self.clone(),
            target_id: target_id.to_string(),
            job_id: job_id.to_string(),
        })
    }

    pub fn holder(&self, target_id: &str) -> Option<String> {
        self.table().get(target_id).map(|e| e.job_id.clone())
    }

    pub fn held_count(&self) -> usize {
        self.table().len()
    }

    /// Containers currently left quiesced by a running job.
    pub fn quiesced(&self) -> Vec<QuiescedContainer> {
        self.table()
            .values()
            .filter_map(|e| e.quiesced.clone())
            .collect()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, LockEntry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held for the lifetime of one job.
#[derive(Debug)]
pub struct TargetLock {
    locks: TargetLocks,
    target_id: String,
    job_id: String,
}

impl TargetLock {
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn mark_quiesced(&self, container: ContainerRef, action: QuiesceAction) {
        if let Some(entry) = self.locks.table().get_mut(&self.target_id) {
            entry.quiesced = Some(QuiescedContainer {
                target_id: self.target_id.clone(),
                job_id: self.job_id.clone(),
                container,
                action,
            });
        }
    }

    pub fn clear_quiesced(&self) {
        if let Some(entry) = self.locks.table().get_mut(&self.target_id) {
            entry.quiesced = None;
        }
    }
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        let mut table = self.locks.table();
        if table
            .get(&self.target_id)
            .is_some_and(|e| e.job_id == self.job_id)
        {
            table.remove(&self.target_id);
        }
    }
}

impl std::fmt::Debug for TargetLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetLocks")
            .field("held", &self.held_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container() -> ContainerRef {
        ContainerRef {
            id: "c1".into(),
            name: "web".into(),
        }
    }

    #[test]
    fn second_acquire_is_refused_until_release() {
        let locks = TargetLocks::new();
        let first = locks.try_acquire("web", "job-1").unwrap();
        assert!(locks.try_acquire("web", "job-2").is_none());
        assert_eq!(locks.holder("web").as_deref(), Some("job-1"));

        drop(first);
        assert_eq!(locks.held_count(), 0);
        assert!(locks.try_acquire("web", "job-3").is_some());
    }

    #[test]
    fn distinct_targets_do_not_contend() {
        let locks = TargetLocks::new();
        let _a = locks.try_acquire("a", "job-1").unwrap();
        let _b = locks.try_acquire("b", "job-2").unwrap();
        assert_eq!(locks.held_count(), 2);
    }

    #[test]
    fn quiesced_state_is_tracked_and_dropped_with_the_lock() {
        let locks = TargetLocks::new();
        let lock = locks.try_acquire("web", "job-1").unwrap();

        lock.mark_quiesced(container(), QuiesceAction::Pause);
        assert_eq!(locks.quiesced().len(), 1);

        lock.clear_quiesced();
        assert!(locks.quiesced().is_empty());

        lock.mark_quiesced(container(), QuiesceAction::Stop);
        drop(lock);
        assert!(locks.quiesced().is_empty());
    }

    #[test]
    fn debug_output_reports_held_count() {
        let locks = TargetLocks::new();
        let lock = locks.try_acquire("web", "job-1").unwrap();
        assert_eq!(format!("{:?}", locks), "TargetLocks { held: 1 }");
        assert!(format!("{:?}", lock).contains("job-1"));
    }

    #[test]
    fn concurrent_acquire_admits_exactly_one() {
        let locks = TargetLocks::new();
        let barrier = Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let locks = locks.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    locks
                        .try_acquire("web", &format!("job-{}", i))
                        .map(std::mem::forget)
                        .is_some()
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(admitted, 1);
    }
}
