//! # remotestate
//!
//! Per-unit remote state aggregation for workload agents.
//!
//! A unit agent drives its reconciliation loop from server-side facts, each
//! surfaced by an independent change stream. The [`RemoteStateWatcher`] fans
//! those streams into one consolidated [`Snapshot`] and emits a coalesced
//! "something changed" signal to exactly one consumer:
//!
//! ```text
//! unit ────────────┐
//! service ─────────┤
//! config ──────────┤
//! addresses ───────┤   ┌─────────────────┐  mutex   ┌──────────┐
//! relations ───────┼──▶│ aggregator loop │─────────▶│ Snapshot │
//! storage ─────────┤   └────────┬────────┘          └──────────┘
//! leader settings ─┤            │ try_send
//! leadership ──────┤            ▼
//! sub-watchers ────┘      changed signal
//! ```
//!
//! The watcher surfaces facts, never decisions: it holds no disk state, does
//! not deduplicate semantically identical snapshots, and only promises that
//! the latest snapshot is available after each signal.
//!
//! The [`txn`] module is the companion piece at the storage layer: bounded
//! pending-transaction queues so coordination fan-out cannot grow without
//! limit either.

mod config;
mod errors;
mod leadership;
mod relation_watcher;
mod snapshot;
mod storage_watcher;
mod store;
mod stream;
mod supervisor;
mod watcher;

pub mod txn;

pub use self::config::*;
pub use errors::*;
pub use leadership::*;
pub use snapshot::*;
pub use store::*;
pub use stream::*;
pub use watcher::*;

pub(crate) use relation_watcher::*;
pub(crate) use storage_watcher::*;
pub(crate) use supervisor::*;

#[cfg(test)]
mod test_utils;

#[cfg(test)]
mod config_test;
#[cfg(test)]
mod leadership_test;
