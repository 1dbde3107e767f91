//! Per-attachment storage tracking. Change tokens carry no payload, so the
//! task re-fetches the attachment on every token and forwards the result to
//! the aggregator; a not-found fetch means the attachment is gone, and the
//! task reports the removal and ends itself.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::ChangeStream;
use crate::Error;
use crate::Result;
use crate::StorageAttachmentId;
use crate::StorageSnapshot;
use crate::StorageTag;
use crate::UnitStateStore;
use crate::WatchError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StorageAttachmentEvent {
    /// Fresh attachment details; the aggregator overwrites its entry.
    Changed(StorageSnapshot),

    /// The backing store no longer knows the attachment; the aggregator
    /// drops its entry.
    Removed(StorageTag),
}

pub(crate) struct StorageAttachmentWatcher {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<std::result::Result<(), Error>>,
}

impl StorageAttachmentWatcher {
    pub(crate) fn spawn<S: UnitStateStore>(
        store: Arc<S>,
        id: StorageAttachmentId,
        mut stream: ChangeStream<()>,
        events: mpsc::Sender<StorageAttachmentEvent>,
        mut dying: watch::Receiver<bool>,
    ) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            loop {
                if *dying.borrow() {
                    return Ok(());
                }
                tokio::select! {
                    biased;

                    _ = &mut stop_rx => return Ok(()),

                    r = dying.changed() => {
                        if r.is_err() {
                            return Ok(());
                        }
                        continue;
                    },

                    change = stream.recv() => match change {
                        Some(()) => match store.storage_attachment(&id).await {
                            Ok(snapshot) => {
                                let event = StorageAttachmentEvent::Changed(snapshot);
                                if events.send(event).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Err(err) if err.is_not_found() => {
                                debug!(storage = %id.storage, "storage attachment gone");
                                let event =
                                    StorageAttachmentEvent::Removed(id.storage.clone());
                                let _ = events.send(event).await;
                                return Ok(());
                            }
                            Err(err) => return Err(err.into()),
                        },
                        None => return Err(stream.error().into()),
                    },
                }
            }
        });
        StorageAttachmentWatcher {
            stop_tx: Some(stop_tx),
            task,
        }
    }

    /// Signals the task and joins it, surfacing any failure it ended with.
    pub(crate) async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(join_err) => Err(WatchError::StreamFailed(format!(
                "storage attachment watcher task failed: {join_err}"
            ))
            .into()),
        }
    }
}
