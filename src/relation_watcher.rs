//! Per-relation member tracking: one task per relation the unit is in scope
//! for, forwarding every member delta onto the shared aggregator channel
//! tagged with its relation id.

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::ChangeStream;
use crate::RelationId;
use crate::RelationUnitsDelta;
use crate::Result;
use crate::WatchError;

/// Member delta addressed to the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RelationUnitsEvent {
    pub(crate) relation_id: RelationId,
    pub(crate) delta: RelationUnitsDelta,
}

pub(crate) struct RelationUnitsWatcher {
    relation_id: RelationId,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<std::result::Result<(), WatchError>>>,
}

impl RelationUnitsWatcher {
    pub(crate) fn spawn(
        relation_id: RelationId,
        mut stream: ChangeStream<RelationUnitsDelta>,
        events: mpsc::Sender<RelationUnitsEvent>,
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
                        Some(delta) => {
                            let event = RelationUnitsEvent { relation_id, delta };
                            if events.send(event).await.is_err() {
                                // Aggregator gone; nothing left to report to.
                                return Ok(());
                            }
                        }
                        None => return Err(stream.error()),
                    },
                }
            }
        });
        RelationUnitsWatcher {
            relation_id,
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    pub(crate) fn relation_id(&self) -> RelationId {
        self.relation_id
    }

    /// Signals the task and joins it, surfacing any stream failure it saw.
    /// A second call is a no-op.
    pub(crate) async fn stop(&mut self) -> Result<()> {
        debug!(relation_id = self.relation_id, "stopping relation units watcher");
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(result) => result.map_err(Into::into),
            Err(join_err) => Err(WatchError::StreamFailed(format!(
                "relation units watcher task failed: {join_err}"
            ))
            .into()),
        }
    }
}
