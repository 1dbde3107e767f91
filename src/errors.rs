//! Error hierarchy, categorized by layer: backing-store access, change-stream
//! plumbing, and the transaction runner. Every variant carries owned data so
//! errors stay `Clone`; the supervisor hands the terminal error to every
//! `wait()` caller.

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The unit or its service is gone or inaccessible before the watcher
    /// could start. There is nothing left for the agent to do.
    #[error("agent should be terminated")]
    TerminateAgent,

    /// Cooperative shutdown sentinel; reported as a clean stop, never as a
    /// failure.
    #[error("watcher is dying")]
    Dying,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Txn(#[from] TxnError),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Errors returned by [`crate::UnitStateStore`] implementations. `NotFound`
/// and `Unauthorized` are part of the protocol: handlers classify them with
/// the predicates below and treat them as removals or terminal conditions
/// rather than failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found")]
    NotFound { entity: String },

    #[error("access to {entity} unauthorized")]
    Unauthorized { entity: String },

    /// Transport or server-side failure; surfaced unchanged.
    #[error("backing store request failed: {0}")]
    RequestFailed(String),
}

impl StoreError {
    pub fn not_found(entity: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity: entity.into(),
        }
    }

    pub fn unauthorized(entity: impl Into<String>) -> Self {
        StoreError::Unauthorized {
            entity: entity.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_not_found_or_unauthorized(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound { .. } | StoreError::Unauthorized { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatchError {
    /// A change stream closed without its producer recording a cause.
    #[error("change stream closed unexpectedly")]
    StreamClosed,

    /// Root cause recorded by the producer before it went away.
    #[error("change stream failed: {0}")]
    StreamFailed(String),

    /// The leadership tracker dropped a ticket without settling it.
    #[error("leadership tracker is no longer available")]
    TrackerGone,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TxnError {
    /// The target document's pending-transaction queue is over the bound.
    /// The candidate has been aborted and the queue left as it was.
    #[error("txn-queue for {doc_id} in {collection} has too many transactions ({len})")]
    QueueTooLong {
        collection: String,
        doc_id: String,
        len: usize,
    },

    /// An assertion did not hold; the transaction was aborted.
    #[error("transaction aborted")]
    Aborted,

    #[error("transaction {txn_id} not found")]
    TxnMissing { txn_id: u64 },

    #[error("cannot abort transaction {txn_id} in state {state}")]
    BadAbortState { txn_id: u64, state: &'static str },

    #[error("transaction has no operations")]
    EmptyTxn,
}
