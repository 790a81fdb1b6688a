//! Transactions
//!
//! A transaction is one atomic propagation pass: a set of prioritized
//! callbacks executed in dependency order, followed by a FIFO set of final
//! callbacks, all under a single hold of the partition's lock. Work that
//! must wait until the lock is released goes through
//! [`Partition::post`](crate::partition::Partition::post) instead.
//!
//! # Ordering
//!
//! Prioritized entries execute in strictly increasing `(rank, EntryId)`
//! order: the rank of the entry's target node decides the phase, and the
//! entry ID — allocated in scheduling order — breaks ties. The rank is
//! snapshotted into the queue key when the entry is scheduled. Running
//! callbacks may link new edges and thereby raise ranks, which makes
//! snapshotted keys stale; [`Transaction::invalidate_ordering`] flags the
//! queue for a full key rebuild before the next pop. Rebuild-on-demand is
//! what lets the graph grow mid-drain without misordering entries that are
//! already queued.
//!
//! # Scheduling from callbacks
//!
//! Every callback receives `&mut Transaction` and schedules further work
//! through it. This explicit handle is the only way to reach the
//! transaction while it is draining; see [`TransactionScope`] for the
//! scoped API used outside of callbacks.

mod policy;
mod scope;

pub use policy::{DefaultPolicy, ExecutionPolicy};
pub use scope::TransactionScope;

use std::cell::RefCell;
use std::collections::{BTreeSet, VecDeque};
use std::rc::Rc;

use indexmap::IndexMap;

use crate::error::{ActionError, PropagateError};
use crate::graph::{rank_of, EdgeId, Node};
use crate::partition::Partition;

/// Shared handle to a transaction.
///
/// Transactions are driven by a single thread, so the handle is `Rc`-based
/// and deliberately not `Send`.
pub type TransactionHandle = Rc<RefCell<Transaction>>;

/// Identifier for a prioritized entry, unique within one transaction.
///
/// IDs increase in scheduling order and break ties between entries whose
/// targets share a rank, which makes equal-rank execution order
/// deterministic: first scheduled, first run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(u64);

impl EntryId {
    fn succ(self) -> Self {
        Self(self.0 + 1)
    }
}

type ActionResult = Result<(), ActionError>;
type PrioritizedAction = Box<dyn FnOnce(&mut Transaction) -> ActionResult>;
type FinalAction = Box<dyn FnOnce(&mut Transaction) -> ActionResult>;

struct Entry {
    /// The node whose rank keys this entry; re-read on queue rebuilds.
    target: Option<Node>,
    action: PrioritizedAction,
}

/// One atomic propagation pass over a partition.
pub struct Transaction {
    partition: Partition,
    entries: IndexMap<EntryId, Entry>,
    /// Pending entries keyed by `(rank snapshot, entry id)`.
    queue: BTreeSet<(u64, EntryId)>,
    /// Set when a rank mutation may have invalidated snapshotted keys.
    needs_rebuild: bool,
    next_entry: EntryId,
    finals: VecDeque<FinalAction>,
}

impl Transaction {
    pub(crate) fn new(partition: Partition) -> Self {
        Self {
            partition,
            entries: IndexMap::new(),
            queue: BTreeSet::new(),
            needs_rebuild: false,
            next_entry: EntryId(0),
            finals: VecDeque::new(),
        }
    }

    /// The partition this transaction runs against.
    ///
    /// Callbacks use this to reach [`post`](Partition::post) for work that
    /// must wait until the transaction's lock is released.
    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Schedule a prioritized callback, ordered by `target`'s rank.
    ///
    /// Entries without a target sort last. The rank is snapshotted now; if
    /// it changes before the entry runs, the scheduler rebuilds its keys
    /// provided the mutation was reported via
    /// [`invalidate_ordering`](Self::invalidate_ordering) (or performed
    /// through [`link`](Self::link), which reports it automatically).
    pub fn prioritized<F>(&mut self, target: Option<&Node>, action: F)
    where
        F: FnOnce(&mut Transaction) -> Result<(), ActionError> + 'static,
    {
        let id = self.next_entry;
        self.next_entry = id.succ();
        self.queue.insert((rank_of(target), id));
        self.entries.insert(
            id,
            Entry {
                target: target.cloned(),
                action: Box::new(action),
            },
        );
    }

    /// Schedule a final callback.
    ///
    /// Final callbacks run strictly after every prioritized entry —
    /// including entries scheduled mid-drain — in FIFO order. A final
    /// callback may append further final callbacks; they join the same
    /// draining loop.
    pub fn last<F>(&mut self, action: F)
    where
        F: FnOnce(&mut Transaction) -> Result<(), ActionError> + 'static,
    {
        self.finals.push_back(Box::new(action));
    }

    /// Flag the priority queue for a full key rebuild before the next pop.
    ///
    /// Call this after any rank mutation that was not performed through
    /// [`link`](Self::link) while entries are queued.
    pub fn invalidate_ordering(&mut self) {
        self.needs_rebuild = true;
    }

    /// Link `node` to `target` and invalidate the ordering if any rank
    /// moved.
    ///
    /// This is the linking entry point for running callbacks: it keeps the
    /// queue keys honest when the graph grows mid-drain.
    pub fn link(&mut self, node: &Node, id: EdgeId, target: Option<&Node>) {
        if node.link(id, target) {
            self.needs_rebuild = true;
        }
    }

    fn check_rebuild(&mut self) {
        if self.needs_rebuild {
            self.needs_rebuild = false;
            self.queue.clear();
            for (&id, entry) in &self.entries {
                self.queue.insert((rank_of(entry.target.as_ref()), id));
            }
        }
    }

    fn pop_prioritized(&mut self) -> Option<PrioritizedAction> {
        self.check_rebuild();
        let (_, id) = self.queue.pop_first()?;
        let entry = self
            .entries
            .swap_remove(&id)
            .expect("priority queue references a missing entry");
        Some(entry.action)
    }

    fn pop_final(&mut self) -> Option<FinalAction> {
        self.finals.pop_front()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("partition", &self.partition.id())
            .field("pending", &self.entries.len())
            .field("finals", &self.finals.len())
            .field("needs_rebuild", &self.needs_rebuild)
            .finish()
    }
}

/// Run a transaction to completion: prioritized entries in `(rank, EntryId)`
/// order, then final callbacks FIFO.
///
/// The transaction borrow is released around each callback so the callback
/// can receive `&mut Transaction` itself. A callback failure aborts the
/// remainder of the pass.
pub(crate) fn drain(handle: &TransactionHandle) -> Result<(), PropagateError> {
    loop {
        let mut txn = handle.borrow_mut();
        match txn.pop_prioritized() {
            Some(action) => action(&mut txn).map_err(PropagateError::Prioritized)?,
            None => break,
        }
    }
    loop {
        let mut txn = handle.borrow_mut();
        match txn.pop_final() {
            Some(action) => action(&mut txn).map_err(PropagateError::Final)?,
            None => break,
        }
    }
    Ok(())
}
