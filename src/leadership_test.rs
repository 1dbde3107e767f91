use crate::Ticket;
use crate::WatchError;

#[tokio::test]
async fn settled_ticket_resolves_immediately() {
    let mut ticket = Ticket::settled(true);
    assert_eq!(ticket.outcome().await, Ok(true));
}

#[tokio::test]
async fn pending_ticket_resolves_on_settle() {
    let (handle, mut ticket) = Ticket::pending();

    let waiter = tokio::spawn(async move { ticket.outcome().await });
    handle.settle(false);

    assert_eq!(waiter.await.expect("waiter finished"), Ok(false));
}

#[tokio::test]
async fn dropped_handle_means_tracker_gone() {
    let (handle, mut ticket) = Ticket::pending();
    drop(handle);

    assert_eq!(ticket.outcome().await, Err(WatchError::TrackerGone));
}
