//! Graph Nodes
//!
//! Nodes own their outgoing edges and a rank used to order transaction work.
//! A node is a cheap-to-clone handle; multiple upstream producers may hold
//! handles to the same downstream node.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

/// Unique identity for an edge, used to find and remove it later.
///
/// The identity says nothing about the edge's endpoints; it exists so a
/// handler registered through [`Node::link`] can be detached again with
/// [`Node::unlink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(u64);

impl EdgeId {
    /// Generate a new unique edge ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for EdgeId {
    fn default() -> Self {
        Self::new()
    }
}

/// An outgoing edge to a downstream node.
///
/// `target` may be `None`: such an edge carries a handler identity but
/// imposes no ordering obligation.
struct Edge {
    id: EdgeId,
    target: Option<Node>,
}

struct NodeInner {
    /// Ordering key. Larger ranks schedule later. Mutated only while the
    /// owning partition's lock is held.
    rank: AtomicU64,
    targets: Mutex<SmallVec<[Edge; 2]>>,
}

/// A vertex in the dependency graph.
///
/// `Node` is a shared handle: cloning it yields another handle to the same
/// vertex. Edges hold strong handles to their downstream node, so an acyclic
/// graph is freed as soon as the last external handle drops. A graph that a
/// caller forces into a cycle keeps itself alive instead; that is the
/// accepted trade-off for cycles being out of contract.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Create a new node with rank zero and no edges.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NodeInner {
                rank: AtomicU64::new(0),
                targets: Mutex::new(SmallVec::new()),
            }),
        }
    }

    /// Get the node's current rank.
    pub fn rank(&self) -> u64 {
        self.inner.rank.load(Ordering::Relaxed)
    }

    /// Link this node to `target`, recorded under `id`.
    ///
    /// If `target` is present its rank (and transitively the rank of
    /// everything downstream of it) is raised above this node's rank first,
    /// so work keyed on `target` sorts after work keyed on this node.
    ///
    /// Returns `true` if any rank changed. A transaction that already has
    /// entries queued against the affected nodes must rebuild its ordering
    /// keys when that happens; see
    /// [`Transaction::link`](crate::transaction::Transaction::link).
    pub fn link(&self, id: EdgeId, target: Option<&Node>) -> bool {
        let changed = match target {
            Some(node) => node.ensure_rank_exceeds(self.rank()),
            None => false,
        };
        self.inner.targets.lock().push(Edge {
            id,
            target: target.cloned(),
        });
        changed
    }

    /// Remove the first edge recorded under `id`.
    ///
    /// Returns whether an edge was found. Ranks are not adjusted: they are
    /// monotone watermarks, and a stale-high rank never violates ordering.
    pub fn unlink(&self, id: EdgeId) -> bool {
        let mut targets = self.inner.targets.lock();
        if let Some(position) = targets.iter().position(|edge| edge.id == id) {
            targets.remove(position);
            true
        } else {
            false
        }
    }

    /// Raise this node's rank until it exceeds `limit`, propagating the new
    /// watermark downstream.
    ///
    /// Returns `true` if any rank was mutated. A node whose rank already
    /// exceeds `limit` satisfies the invariant transitively and is left
    /// untouched, as is any node already visited in this pass. The visited
    /// set bounds the traversal on cyclic graphs; it cannot establish a
    /// correct total order for a true cycle, only guarantee termination.
    pub(crate) fn ensure_rank_exceeds(&self, limit: u64) -> bool {
        let mut visited = HashSet::new();
        self.raise_rank(&mut visited, limit)
    }

    fn raise_rank(&self, visited: &mut HashSet<*const NodeInner>, limit: u64) -> bool {
        let key = Arc::as_ptr(&self.inner);
        if self.rank() > limit || !visited.insert(key) {
            return false;
        }
        let raised = limit.saturating_add(1);
        self.inner.rank.store(raised, Ordering::Relaxed);
        // Snapshot the downstream handles so no edge-list lock is held
        // while recursing.
        let downstream: Vec<Node> = self
            .inner
            .targets
            .lock()
            .iter()
            .filter_map(|edge| edge.target.clone())
            .collect();
        for node in downstream {
            node.raise_rank(visited, raised);
        }
        true
    }

    /// Number of outgoing edges.
    pub fn edge_count(&self) -> usize {
        self.inner.targets.lock().len()
    }

    /// Whether two handles refer to the same vertex.
    pub fn same_node(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Node {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("rank", &self.rank())
            .field("edges", &self.edge_count())
            .finish()
    }
}

/// The scheduling rank of an optional target.
///
/// An absent target has the maximum representable rank: entries with no
/// downstream consumer sort last among prioritized work.
pub(crate) fn rank_of(target: Option<&Node>) -> u64 {
    match target {
        Some(node) => node.rank(),
        None => u64::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_ids_are_unique() {
        let id1 = EdgeId::new();
        let id2 = EdgeId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn new_node_starts_at_rank_zero() {
        let node = Node::new();
        assert_eq!(node.rank(), 0);
        assert_eq!(node.edge_count(), 0);
    }

    #[test]
    fn link_raises_target_rank() {
        let a = Node::new();
        let b = Node::new();

        let changed = a.link(EdgeId::new(), Some(&b));

        assert!(changed);
        assert_eq!(a.rank(), 0);
        assert_eq!(b.rank(), 1);
        assert_eq!(a.edge_count(), 1);
    }

    #[test]
    fn link_propagates_ranks_transitively() {
        let a = Node::new();
        let b = Node::new();
        let c = Node::new();

        b.link(EdgeId::new(), Some(&c));
        assert_eq!(c.rank(), 1);

        // Linking a -> b must push b above a, and c above b.
        a.link(EdgeId::new(), Some(&b));
        assert_eq!(b.rank(), 1);
        assert_eq!(c.rank(), 2);
    }

    #[test]
    fn link_to_already_higher_target_changes_nothing() {
        let a = Node::new();
        let b = Node::new();
        b.ensure_rank_exceeds(5);
        assert_eq!(b.rank(), 6);

        let changed = a.link(EdgeId::new(), Some(&b));

        assert!(!changed);
        assert_eq!(b.rank(), 6);
    }

    #[test]
    fn link_without_target_has_no_rank_effect() {
        let a = Node::new();
        let changed = a.link(EdgeId::new(), None);
        assert!(!changed);
        assert_eq!(a.edge_count(), 1);
    }

    #[test]
    fn unlink_removes_only_the_matching_edge() {
        let a = Node::new();
        let b = Node::new();
        let c = Node::new();

        let id_b = EdgeId::new();
        let id_c = EdgeId::new();
        a.link(id_b, Some(&b));
        a.link(id_c, Some(&c));

        assert!(a.unlink(id_b));
        assert_eq!(a.edge_count(), 1);

        // Unknown identity is not an error.
        assert!(!a.unlink(id_b));
        assert!(a.unlink(id_c));
        assert_eq!(a.edge_count(), 0);
    }

    #[test]
    fn cyclic_link_terminates_with_bounded_ranks() {
        let a = Node::new();
        let b = Node::new();

        a.link(EdgeId::new(), Some(&b));
        assert_eq!((a.rank(), b.rank()), (0, 1));

        // Closing the cycle raises a above b, then stops when the pass
        // revisits a.
        b.link(EdgeId::new(), Some(&a));
        assert_eq!(a.rank(), 2);
        assert_eq!(b.rank(), 3);

        // A second pass over the same cycle also terminates.
        b.ensure_rank_exceeds(b.rank());
        assert!(b.rank() < 10);
    }

    #[test]
    fn rank_of_absent_target_is_max() {
        let node = Node::new();
        assert_eq!(rank_of(None), u64::MAX);
        assert_eq!(rank_of(Some(&node)), 0);
    }

    #[test]
    fn clones_share_the_vertex() {
        let a = Node::new();
        let alias = a.clone();
        assert!(a.same_node(&alias));

        alias.ensure_rank_exceeds(3);
        assert_eq!(a.rank(), 4);
    }
}
