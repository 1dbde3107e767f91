//! Client-side multi-document transactions with bounded coordination queues.
//!
//! Documents carry a queue of pending transaction tokens; a transaction is
//! prepared by enqueueing its token on every document it touches, asserted,
//! then applied. Two bounds keep that coordination from fanning out without
//! limit:
//!
//! - **`max_txn_queue_length`**: a document whose queue is over the bound
//!   aborts the candidate transaction with
//!   [`TxnError::QueueTooLong`](crate::TxnError::QueueTooLong). Many queue
//!   operations are quadratic in queue length, and a long queue means
//!   something upstream is stuck; bounding it stops one sick document from
//!   cascading.
//! - **`assertion_cleanup_length`**: assert-only operations never mutate
//!   their document, so dead tokens would pile up there forever. Once the
//!   accumulated pull-set reaches the threshold, a cleanup update pulls the
//!   dead tokens out of the queue.
//!
//! Both bounds live in [`RunnerOptions`]; `0` disables the bound.

mod runner;

pub use runner::Action;
pub use runner::Database;
pub use runner::Document;
pub use runner::Op;
pub use runner::Payload;
pub use runner::Runner;
pub use runner::RunnerOptions;
pub use runner::Token;
pub use runner::TxnId;
pub use runner::TxnResult;
pub use runner::TxnState;
