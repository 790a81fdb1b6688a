//! Execution Policies
//!
//! An [`ExecutionPolicy`] decides three things for a partition: how the
//! thread's current transaction is looked up, how a freshly created
//! transaction is installed (which claims the partition's critical
//! section), and how the two close phases are dispatched around that
//! critical section. The graph and scheduling logic never touch a lock or
//! a thread-local directly; they go through the policy, so a host can
//! substitute a different concurrency strategy — single-threaded
//! cooperative scheduling, a multi-partition coordinator — without touching
//! them.
//!
//! The policy is injected when a [`Partition`] is constructed and fixed for
//! the partition's lifetime.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::PropagateError;
use crate::partition::{Partition, PartitionGuard, PartitionId};

use super::{Transaction, TransactionHandle};

/// Strategy for locating, installing, and dispatching transactions.
pub trait ExecutionPolicy: Send + Sync + 'static {
    /// The transaction currently active for `partition` on this thread, if
    /// any. A nested scope reuses it instead of creating a second one.
    fn current_transaction(&self, partition: &Partition) -> Option<TransactionHandle>;

    /// Create a new transaction, claim the partition's critical section,
    /// and publish the transaction as current for this thread.
    ///
    /// Blocks while another thread holds the partition.
    fn install(&self, partition: &Partition) -> TransactionHandle;

    /// Run the two phases of an outermost scope close.
    ///
    /// `transactional` drains the transaction and must run inside the
    /// critical section claimed by [`install`](Self::install). `release`
    /// runs outside it, after the current-transaction slot is cleared, so
    /// deferred callbacks may open fresh transactions without deadlocking.
    ///
    /// Implementations must leave the critical section on every exit path,
    /// including a failing `transactional` phase; only a successful
    /// transactional phase proceeds to `release`.
    fn dispatch(
        &self,
        partition: &Partition,
        transactional: &mut dyn FnMut() -> Result<(), PropagateError>,
        release: &mut dyn FnMut() -> Result<(), PropagateError>,
    ) -> Result<(), PropagateError>;
}

thread_local! {
    /// Per-thread current-transaction slots, keyed by partition.
    static ACTIVE: RefCell<HashMap<PartitionId, ActiveSlot>> = RefCell::new(HashMap::new());
}

/// A slot owns the transaction handle and the partition's lock guard, so
/// dropping the slot both unpublishes the transaction and releases the
/// critical section.
struct ActiveSlot {
    txn: TransactionHandle,
    _guard: PartitionGuard,
}

/// The single-lock, thread-local-slot policy.
///
/// One transaction per (partition, thread), serialized across threads by
/// the partition's reentrant lock, which is held from install until the end
/// of the transactional phase.
#[derive(Debug, Default)]
pub struct DefaultPolicy;

impl DefaultPolicy {
    pub fn new() -> Self {
        Self
    }
}

impl ExecutionPolicy for DefaultPolicy {
    fn current_transaction(&self, partition: &Partition) -> Option<TransactionHandle> {
        ACTIVE.with(|slots| {
            slots
                .borrow()
                .get(&partition.id())
                .map(|slot| Rc::clone(&slot.txn))
        })
    }

    fn install(&self, partition: &Partition) -> TransactionHandle {
        let guard = partition.enter_critical_section();
        let txn: TransactionHandle = Rc::new(RefCell::new(Transaction::new(partition.clone())));
        tracing::trace!(partition = partition.id().raw(), "transaction installed");
        ACTIVE.with(|slots| {
            slots.borrow_mut().insert(
                partition.id(),
                ActiveSlot {
                    txn: Rc::clone(&txn),
                    _guard: guard,
                },
            )
        });
        txn
    }

    fn dispatch(
        &self,
        partition: &Partition,
        transactional: &mut dyn FnMut() -> Result<(), PropagateError>,
        release: &mut dyn FnMut() -> Result<(), PropagateError>,
    ) -> Result<(), PropagateError> {
        let result = {
            // Clear the slot — and with it the lock — on every exit from
            // the transactional phase, so an error or panic in a callback
            // cannot leave the partition locked.
            let _clear = ClearSlot(partition.id());
            transactional()
        };
        result?;
        release()
    }
}

struct ClearSlot(PartitionId);

impl Drop for ClearSlot {
    fn drop(&mut self) {
        ACTIVE.with(|slots| {
            slots.borrow_mut().remove(&self.0);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_transaction_is_current_before_install() {
        let policy = DefaultPolicy::new();
        let partition = Partition::new();
        assert!(policy.current_transaction(&partition).is_none());
    }

    #[test]
    fn install_publishes_the_transaction_for_this_thread() {
        let policy = DefaultPolicy::new();
        let partition = Partition::new();

        let txn = policy.install(&partition);
        let current = policy
            .current_transaction(&partition)
            .expect("transaction should be current after install");
        assert!(Rc::ptr_eq(&txn, &current));

        // Another partition is unaffected.
        let other = Partition::new();
        assert!(policy.current_transaction(&other).is_none());

        policy
            .dispatch(&partition, &mut || Ok(()), &mut || Ok(()))
            .unwrap();
    }

    #[test]
    fn dispatch_clears_the_slot_and_runs_both_phases() {
        let policy = DefaultPolicy::new();
        let partition = Partition::new();
        let _txn = policy.install(&partition);

        let phases = RefCell::new(Vec::new());
        policy
            .dispatch(
                &partition,
                &mut || {
                    phases.borrow_mut().push("transactional");
                    Ok(())
                },
                &mut || {
                    phases.borrow_mut().push("release");
                    Ok(())
                },
            )
            .unwrap();

        assert_eq!(phases.into_inner(), vec!["transactional", "release"]);
        assert!(policy.current_transaction(&partition).is_none());
    }

    #[test]
    fn failed_transactional_phase_still_clears_the_slot() {
        let policy = DefaultPolicy::new();
        let partition = Partition::new();
        let _txn = policy.install(&partition);

        let mut released = false;
        let err = policy
            .dispatch(
                &partition,
                &mut || Err(PropagateError::Prioritized("boom".into())),
                &mut || {
                    released = true;
                    Ok(())
                },
            )
            .unwrap_err();

        assert!(matches!(err, PropagateError::Prioritized(_)));
        assert!(!released, "release phase must be skipped on error");
        assert!(policy.current_transaction(&partition).is_none());

        // The critical section was left: another thread can claim it.
        let thread_partition = partition.clone();
        std::thread::spawn(move || {
            let _guard = thread_partition.enter_critical_section();
        })
        .join()
        .unwrap();
    }
}
