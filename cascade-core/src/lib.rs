//! Cascade Core
//!
//! This crate is the transactional propagation core of the Cascade reactive
//! runtime. It guarantees that when a change enters a dependency graph,
//! every dependent computation fires exactly once, strictly after all of
//! its upstream producers, within one atomic transaction — so observers
//! never see inconsistent intermediate ("glitch") states.
//!
//! # Architecture
//!
//! The crate is organized into three modules:
//!
//! - `graph`: dependency-graph nodes and the rank watermarks that order
//!   propagation
//! - `transaction`: transactions, nested scopes, and the pluggable
//!   execution policy
//! - `partition`: synchronization domains owning the lock, the deferred
//!   queue, and the nesting state
//!
//! Reactive value types (streams, cells, listeners) are built on top of
//! this core by other crates; nothing here is user-facing state.
//!
//! # Example
//!
//! ```rust,ignore
//! use cascade_core::{EdgeId, Node, Partition, TransactionScope};
//!
//! let partition = Partition::new();
//!
//! // Build a two-node graph: work keyed on `source` fires before work
//! // keyed on `sink`.
//! let source = Node::new();
//! let sink = Node::new();
//! source.link(EdgeId::new(), Some(&sink));
//!
//! let scope = TransactionScope::open(&partition);
//! scope.prioritized(Some(&sink), |_| {
//!     println!("after the source");
//!     Ok(())
//! });
//! scope.prioritized(Some(&source), |_| {
//!     println!("first");
//!     Ok(())
//! });
//! scope.close()?;
//! ```

pub mod graph;
pub mod partition;
pub mod transaction;

mod error;

pub use error::{ActionError, PropagateError};
pub use graph::{EdgeId, Node};
pub use partition::{Partition, PartitionGuard, PartitionId};
pub use transaction::{
    DefaultPolicy, EntryId, ExecutionPolicy, Transaction, TransactionHandle, TransactionScope,
};
