//! serial-txn confines a single, non-thread-safe transaction handle to one
//! dedicated thread, and lets any number of concurrent async callers submit
//! operations against it. Operations run strictly one-at-a-time, in the order
//! they were submitted.

mod context;
pub mod sqlite;
mod store;

pub use context::{Completion, Observer, Options, State, TxnContext};
pub use store::Store;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("transaction context is already disposed")]
    AlreadyDisposed,
    // The operation's own error, unchanged.
    #[error(transparent)]
    OperationFailed(#[from] anyhow::Error),
    // Returned by every start() of a context whose transaction couldn't be begun.
    #[error("{0:#}")]
    BeginFailed(std::sync::Arc<anyhow::Error>),
    #[error("operation was canceled by transaction context shutdown")]
    ShutdownCanceled,
    #[error("transaction handle is not bound (this is a bug in the bootstrap of the drain loop)")]
    HandleNotYetBound,
    #[error("failed to spawn the drain thread")]
    Spawn(#[source] std::io::Error),
}

impl Error {
    /// Is this a violation of an internal invariant of the drain loop?
    /// Such errors are fatal: the loop exits upon encountering one.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Error::HandleNotYetBound)
    }
}
