//! Partitions
//!
//! A [`Partition`] is a synchronization domain: one reentrant lock, one
//! deferred-callback queue, and the nesting state for transaction scopes.
//! Transactions on the same partition are serialized across threads by the
//! lock; partitions are independent of each other.
//!
//! # Lock discipline
//!
//! The lock is acquired when the outermost [`TransactionScope`] opens on a
//! thread and held for the entire outermost scope, including all nested
//! scopes and the whole prioritized drain. It must be same-thread reentrant
//! because callbacks running under it may call [`Partition::post`], which
//! takes it again. `parking_lot::ReentrantMutex` hands out shared access
//! only, so the mutable state lives in a `RefCell` inside it.
//!
//! # Deferred queue
//!
//! [`Partition::post`] enqueues work that must run outside any transaction.
//! The queue drains FIFO after the owning transaction's lock is released,
//! with the lock dropped around each invocation so other threads can keep
//! enqueueing, and so a deferred callback may open a fresh transaction
//! without deadlocking.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::ArcReentrantMutexGuard;
use parking_lot::{RawMutex, RawThreadId, ReentrantMutex};

use crate::error::{ActionError, PropagateError};
use crate::transaction::{DefaultPolicy, ExecutionPolicy};

/// Unique identifier for a partition.
///
/// Keys the per-thread current-transaction slot, so two partitions never
/// share an active transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionId(u64);

impl PartitionId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

type DeferredAction = Box<dyn FnOnce() -> Result<(), ActionError> + Send>;

/// Mutable partition state, guarded by the partition's reentrant lock.
pub struct PartitionState {
    deferred: VecDeque<DeferredAction>,
    /// Reentrancy guard: true while a deferred drain pass is running.
    processing_deferred: bool,
    /// Number of transaction scopes currently open on the partition.
    depth: u32,
}

/// An owned guard over a partition's critical section.
///
/// Holding the guard means holding the partition's reentrant lock. The
/// guard is owned rather than borrowed so an [`ExecutionPolicy`] can stash
/// it in thread-local storage between [`ExecutionPolicy::install`] and the
/// release phase of [`ExecutionPolicy::dispatch`].
pub type PartitionGuard = ArcReentrantMutexGuard<RawMutex, RawThreadId, RefCell<PartitionState>>;

/// A synchronization domain for transactions.
///
/// `Partition` is a shared handle; clones refer to the same domain. The
/// execution policy is fixed at construction and never swapped afterwards,
/// so configuring a custom policy is strictly a startup-time act.
#[derive(Clone)]
pub struct Partition {
    id: PartitionId,
    state: Arc<ReentrantMutex<RefCell<PartitionState>>>,
    policy: Arc<dyn ExecutionPolicy>,
}

impl Partition {
    /// Create a partition driven by the [`DefaultPolicy`].
    pub fn new() -> Self {
        Self::with_policy(Arc::new(DefaultPolicy::new()))
    }

    /// Create a partition driven by a custom execution policy.
    pub fn with_policy(policy: Arc<dyn ExecutionPolicy>) -> Self {
        Self {
            id: PartitionId::new(),
            state: Arc::new(ReentrantMutex::new(RefCell::new(PartitionState {
                deferred: VecDeque::new(),
                processing_deferred: false,
                depth: 0,
            }))),
            policy,
        }
    }

    /// Get the partition's unique ID.
    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub(crate) fn policy(&self) -> &Arc<dyn ExecutionPolicy> {
        &self.policy
    }

    /// Enqueue a callback to run outside any transaction.
    ///
    /// Callbacks run FIFO relative to other `post` calls on this partition,
    /// regardless of the posting thread. Usable with or without an open
    /// transaction; with one, delivery waits until the transaction's lock
    /// has been released.
    pub fn post<F>(&self, action: F)
    where
        F: FnOnce() -> Result<(), ActionError> + Send + 'static,
    {
        let state = self.state.lock();
        state.borrow_mut().deferred.push_back(Box::new(action));
    }

    /// Acquire the partition's lock, entering its critical section.
    ///
    /// Blocks until the lock is available unless the calling thread already
    /// holds it. Intended for [`ExecutionPolicy::install`] implementations.
    pub fn enter_critical_section(&self) -> PartitionGuard {
        self.state.lock_arc()
    }

    /// Drain the deferred queue, FIFO, until it is empty.
    ///
    /// Only one logical pass runs at a time per partition: if a pass is
    /// already in progress (on any thread), this call is a no-op and the
    /// running pass picks up whatever was enqueued in the meantime. The lock
    /// is released around each callback invocation.
    ///
    /// A failing callback stops the pass; the remaining callbacks stay
    /// queued and a later call resumes them.
    pub fn drain_deferred(&self) -> Result<(), PropagateError> {
        {
            let state = self.state.lock();
            let mut state = state.borrow_mut();
            if state.processing_deferred {
                return Ok(());
            }
            state.processing_deferred = true;
        }
        // Reset the pass flag on every exit, including errors and panics,
        // so a failed callback cannot wedge the partition.
        let _pass = DeferredPass { partition: self };
        tracing::trace!(partition = self.id.raw(), "draining deferred queue");
        loop {
            let next = {
                let state = self.state.lock();
                let action = state.borrow_mut().deferred.pop_front();
                action
            };
            match next {
                Some(action) => action().map_err(PropagateError::Deferred)?,
                None => return Ok(()),
            }
        }
    }

    pub(crate) fn depth(&self) -> u32 {
        self.state.lock().borrow().depth
    }

    pub(crate) fn increment_depth(&self) {
        self.state.lock().borrow_mut().depth += 1;
    }

    pub(crate) fn decrement_depth(&self) {
        self.state.lock().borrow_mut().depth -= 1;
    }

    pub(crate) fn reset_depth(&self) {
        self.state.lock().borrow_mut().depth = 0;
    }
}

impl Default for Partition {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition").field("id", &self.id).finish()
    }
}

struct DeferredPass<'a> {
    partition: &'a Partition,
}

impl Drop for DeferredPass<'_> {
    fn drop(&mut self) {
        let state = self.partition.state.lock();
        state.borrow_mut().processing_deferred = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use std::sync::Mutex;

    #[test]
    fn partition_ids_are_unique() {
        let p1 = Partition::new();
        let p2 = Partition::new();
        assert_ne!(p1.id(), p2.id());
    }

    #[test]
    fn deferred_callbacks_run_in_fifo_order() {
        let partition = Partition::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..4 {
            let log = Arc::clone(&log);
            partition.post(move || {
                log.lock().unwrap().push(i);
                Ok(())
            });
        }

        partition.drain_deferred().unwrap();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn drain_is_a_noop_while_a_pass_is_running() {
        let partition = Partition::new();
        let runs = Arc::new(AtomicI32::new(0));

        let inner_partition = partition.clone();
        let inner_runs = Arc::clone(&runs);
        partition.post(move || {
            inner_runs.fetch_add(1, Ordering::SeqCst);
            // Reentrant drain must not start a second pass.
            inner_partition.drain_deferred().unwrap();
            Ok(())
        });
        let outer_runs = Arc::clone(&runs);
        partition.post(move || {
            outer_runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        partition.drain_deferred().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn running_pass_picks_up_callbacks_posted_mid_drain() {
        let partition = Partition::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let post_partition = partition.clone();
        let first_log = Arc::clone(&log);
        partition.post(move || {
            first_log.lock().unwrap().push("first");
            let late_log = Arc::clone(&first_log);
            post_partition.post(move || {
                late_log.lock().unwrap().push("late");
                Ok(())
            });
            Ok(())
        });

        partition.drain_deferred().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["first", "late"]);
    }

    #[test]
    fn failed_callback_stops_the_pass_but_not_the_partition() {
        let partition = Partition::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        partition.post(|| Err("boom".into()));
        let survivor_log = Arc::clone(&log);
        partition.post(move || {
            survivor_log.lock().unwrap().push("survivor");
            Ok(())
        });

        let err = partition.drain_deferred().unwrap_err();
        assert!(matches!(err, PropagateError::Deferred(_)));
        assert!(log.lock().unwrap().is_empty());

        // The reentrancy flag was reset: a later drain resumes the queue.
        partition.drain_deferred().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
    }

    #[test]
    fn posting_from_another_thread_is_serialized() {
        let partition = Partition::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let thread_partition = partition.clone();
        let thread_log = Arc::clone(&log);
        std::thread::spawn(move || {
            thread_partition.post(move || {
                thread_log.lock().unwrap().push("remote");
                Ok(())
            });
        })
        .join()
        .unwrap();

        partition.drain_deferred().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["remote"]);
    }
}
