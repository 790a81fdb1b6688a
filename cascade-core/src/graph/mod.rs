//! Dependency Graph
//!
//! This module implements the dependency graph that orders propagation work
//! inside a transaction.
//!
//! # Overview
//!
//! The graph is a set of nodes connected by directed edges. An edge from A
//! to B means B consumes A's output, so within a transaction any work keyed
//! on A must fire before work keyed on B.
//!
//! Ordering is maintained through per-node *ranks* rather than an explicit
//! topological sort:
//!
//! - Every node carries a rank. Larger ranks schedule later.
//! - Linking A to B raises B's rank (and, transitively, the ranks of
//!   everything downstream of B) until it exceeds A's.
//! - Ranks only ever grow. They are watermarks, not exact depths, so
//!   unlinking never lowers them.
//!
//! This makes the ordering cheap to maintain while the graph is mutated
//! mid-propagation, at the cost of ranks drifting upward over time.
//!
//! # Cycles
//!
//! The graph does not prevent cycles. Rank propagation carries a visited set
//! so that linking into a cycle terminates, but the resulting execution
//! order around the cycle is unspecified. Callers that need the ordering
//! guarantee must keep the graph acyclic.

mod node;

pub use node::{EdgeId, Node};
pub(crate) use node::rank_of;
