//! Bridge to the external leadership tracker.
//!
//! Leadership is a boolean, so the tracker hands out one-shot tickets
//! instead of a full change stream: the watcher claims leadership once at
//! startup, then alternates between a wait-until-minion and a
//! wait-until-leader ticket, flipping the snapshot flag each time one fires.

use tokio::sync::oneshot;

#[cfg(test)]
use mockall::automock;

use crate::WatchError;

/// One-shot leadership outcome. Resolves when the tracker settles it.
#[derive(Debug)]
pub struct Ticket {
    rx: oneshot::Receiver<bool>,
}

/// Settling half of a [`Ticket`], held by the tracker.
#[derive(Debug)]
pub struct TicketHandle {
    tx: oneshot::Sender<bool>,
}

impl Ticket {
    pub fn pending() -> (TicketHandle, Ticket) {
        let (tx, rx) = oneshot::channel();
        (TicketHandle { tx }, Ticket { rx })
    }

    /// A ticket that has already been settled with `outcome`.
    pub fn settled(outcome: bool) -> Ticket {
        let (handle, ticket) = Ticket::pending();
        handle.settle(outcome);
        ticket
    }

    /// Awaits the tracker's verdict. Errors only when the tracker dropped
    /// the handle unsettled, which means it is gone for good.
    pub async fn outcome(&mut self) -> std::result::Result<bool, WatchError> {
        (&mut self.rx).await.map_err(|_| WatchError::TrackerGone)
    }
}

impl TicketHandle {
    pub fn settle(self, outcome: bool) {
        let _ = self.tx.send(outcome);
    }
}

/// External authority over which unit of a service is leader. All three
/// calls return immediately; the ticket resolves when the named condition
/// holds.
#[cfg_attr(test, automock)]
pub trait LeadershipTracker: Send + Sync + 'static {
    /// Requests leadership; resolves with whether this unit now holds it.
    fn claim_leader(&self) -> Ticket;

    /// Resolves when this unit gains leadership.
    fn wait_leader(&self) -> Ticket;

    /// Resolves when this unit loses leadership.
    fn wait_minion(&self) -> Ticket;
}
