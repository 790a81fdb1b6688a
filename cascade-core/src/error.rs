//! Error types for transaction propagation.
//!
//! Scheduled callbacks are fallible: a failing callback aborts the rest of
//! its drain pass and the error surfaces from the close (or from
//! [`Partition::drain_deferred`](crate::partition::Partition::drain_deferred)
//! for deferred work). Internal inconsistencies in the scheduling structures
//! are contract violations, not error values, and panic instead.

use thiserror::Error;

/// The error a scheduled callback may return.
pub type ActionError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A failure surfaced while draining a transaction or a partition's
/// deferred queue.
///
/// Whatever the phase, the owning locks are released before the error
/// reaches the caller; a failed pass never leaves the partition wedged.
#[derive(Debug, Error)]
pub enum PropagateError {
    /// A prioritized entry failed; the remaining entries and all final
    /// callbacks of the transaction were skipped.
    #[error("prioritized entry failed during propagation")]
    Prioritized(#[source] ActionError),

    /// A final callback failed after the prioritized phase settled; the
    /// remaining final callbacks were skipped.
    #[error("final callback failed after propagation settled")]
    Final(#[source] ActionError),

    /// A deferred callback failed; the remaining deferred callbacks stay
    /// queued for the next drain.
    #[error("deferred callback failed")]
    Deferred(#[source] ActionError),
}
