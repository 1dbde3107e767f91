//! Termination primitive for the watcher and its loop task.
//!
//! Two phases: *dying* (shutdown requested, the loop must unwind) and *dead*
//! (the loop has returned, every sub-watcher is stopped). The first real
//! error recorded in either phase is the one every `wait()` caller sees; the
//! `Dying` sentinel counts as a clean stop.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::Error;
use crate::Result;

#[derive(Clone)]
pub(crate) struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    dying_tx: watch::Sender<bool>,
    dead_tx: watch::Sender<bool>,
    reason: Mutex<Option<Error>>,
}

impl Supervisor {
    pub(crate) fn new() -> Self {
        let (dying_tx, _) = watch::channel(false);
        let (dead_tx, _) = watch::channel(false);
        Supervisor {
            inner: Arc::new(Inner {
                dying_tx,
                dead_tx,
                reason: Mutex::new(None),
            }),
        }
    }

    /// Requests shutdown, recording `reason` if it is the first real error.
    pub(crate) fn kill(&self, reason: Option<Error>) {
        self.record(reason);
        let _ = self.inner.dying_tx.send(true);
    }

    /// Marks the loop as finished. Implies dying, so `wait()` callers wake
    /// even when the loop returned on its own.
    pub(crate) fn mark_dead(&self, reason: Option<Error>) {
        self.record(reason);
        let _ = self.inner.dying_tx.send(true);
        let _ = self.inner.dead_tx.send(true);
    }

    fn record(&self, reason: Option<Error>) {
        let Some(err) = reason else { return };
        // The dying sentinel is bookkeeping, not a failure.
        if err == Error::Dying {
            return;
        }
        let mut slot = self.inner.reason.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Cooperative cancellation signal; every blocking receive in the loop
    /// selects against `dying().wait_for(|dying| *dying)`.
    pub(crate) fn dying(&self) -> watch::Receiver<bool> {
        self.inner.dying_tx.subscribe()
    }

    pub(crate) fn dead(&self) -> watch::Receiver<bool> {
        self.inner.dead_tx.subscribe()
    }

    /// Blocks until the loop has fully unwound, then reports its fate.
    pub(crate) async fn wait(&self) -> Result<()> {
        let mut dead = self.inner.dead_tx.subscribe();
        // The sender lives in self.inner, so this cannot fail here.
        let _ = dead.wait_for(|dead| *dead).await;
        match self.inner.reason.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
