//! Transaction Scopes
//!
//! A [`TransactionScope`] brackets a unit of work against a partition.
//! Opening the first scope on a thread creates and installs a transaction;
//! nested scopes on the same thread reuse it. Closing the outermost scope
//! is what actually propagates: the prioritized drain, the final callbacks,
//! and — after the partition's lock is released — the deferred queue.
//!
//! Scopes close explicitly through [`TransactionScope::close`], which
//! surfaces callback failures. Dropping an unclosed scope closes it too,
//! but a failure on that path can only be logged.

use crate::error::{ActionError, PropagateError};
use crate::graph::Node;
use crate::partition::Partition;

use super::{drain, Transaction, TransactionHandle};

/// Scope guard for one (possibly nested) transaction on a partition.
///
/// Not `Send`: a scope lives and dies on the thread that opened it.
///
/// # Scheduling
///
/// [`prioritized`](Self::prioritized) and [`last`](Self::last) borrow the
/// active transaction for the duration of the call. While the transaction
/// is *draining* (inside a running callback) that borrow is taken by the
/// drain loop, so callbacks must schedule through the `&mut Transaction`
/// they receive, not through a scope.
#[must_use = "a scope propagates when it closes; an unused scope closes immediately"]
pub struct TransactionScope {
    partition: Partition,
    txn: Option<TransactionHandle>,
    closed: bool,
}

impl TransactionScope {
    /// Open a scope on `partition`.
    ///
    /// If this thread already has a transaction on the partition, the scope
    /// nests inside it. Otherwise a new transaction is created and
    /// installed, blocking while another thread holds the partition.
    pub fn open(partition: &Partition) -> Self {
        let txn = match partition.policy().current_transaction(partition) {
            Some(txn) => txn,
            None => partition.policy().install(partition),
        };
        partition.increment_depth();
        Self {
            partition: partition.clone(),
            txn: Some(txn),
            closed: false,
        }
    }

    /// Schedule a prioritized callback on the active transaction.
    ///
    /// See [`Transaction::prioritized`].
    pub fn prioritized<F>(&self, target: Option<&Node>, action: F)
    where
        F: FnOnce(&mut Transaction) -> Result<(), ActionError> + 'static,
    {
        self.with(|txn| txn.prioritized(target, action));
    }

    /// Schedule a final callback on the active transaction.
    ///
    /// See [`Transaction::last`].
    pub fn last<F>(&self, action: F)
    where
        F: FnOnce(&mut Transaction) -> Result<(), ActionError> + 'static,
    {
        self.with(|txn| txn.last(action));
    }

    /// Run `f` with mutable access to the active transaction.
    pub fn with<R>(&self, f: impl FnOnce(&mut Transaction) -> R) -> R {
        let txn = self
            .txn
            .as_ref()
            .expect("transaction scope already closed");
        let mut txn = txn.borrow_mut();
        f(&mut txn)
    }

    /// Close the scope.
    ///
    /// For a nested scope this only unwinds the nesting level. For the
    /// outermost scope it dispatches the transactional phase (the
    /// prioritized and final drains) and then the release phase (the
    /// deferred drain, outside the lock) through the partition's policy.
    /// Errors from either phase surface here.
    pub fn close(mut self) -> Result<(), PropagateError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<(), PropagateError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let txn = self.txn.take().expect("transaction scope closed twice");

        if self.partition.depth() == 1 {
            tracing::trace!(
                partition = self.partition.id().raw(),
                "closing outermost transaction scope"
            );
            let partition = self.partition.clone();
            let policy = partition.policy().clone();
            policy.dispatch(
                &self.partition,
                &mut || {
                    let result = drain(&txn);
                    // Reset even when the drain failed, so the partition
                    // stays usable for the next transaction.
                    partition.reset_depth();
                    result
                },
                &mut || partition.drain_deferred(),
            )
        } else {
            self.partition.decrement_depth();
            Ok(())
        }
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(error) = self.finish() {
                tracing::error!(%error, "transaction scope close failed during drop");
            }
        }
    }
}

impl std::fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("partition", &self.partition.id())
            .field("closed", &self.closed)
            .finish()
    }
}
