//! Uniform contract for one server-side change stream: the first token is an
//! initial event describing current state, tokens carry only what is needed
//! to drive a refresh, and a stream that ends without the consumer dropping
//! it is an error whose cause the consumer probes with [`ChangeStream::error`].

use std::sync::Arc;
use std::sync::OnceLock;

use tokio::sync::mpsc;

use crate::WatchError;

/// Receiving half of a change stream. Dropping it terminates the
/// subscription; the producer observes that via [`StreamHandle::closed`] or
/// failed sends and releases its server-side resources.
#[derive(Debug)]
pub struct ChangeStream<T> {
    rx: mpsc::Receiver<T>,
    cause: Arc<OnceLock<WatchError>>,
}

/// Producing half, held by the transport binding (or a test) that pumps
/// server-side deltas into it.
#[derive(Debug, Clone)]
pub struct StreamHandle<T> {
    tx: mpsc::Sender<T>,
    cause: Arc<OnceLock<WatchError>>,
}

impl<T: Send> ChangeStream<T> {
    pub fn channel(buffer: usize) -> (StreamHandle<T>, ChangeStream<T>) {
        let (tx, rx) = mpsc::channel(buffer);
        let cause = Arc::new(OnceLock::new());
        (
            StreamHandle {
                tx,
                cause: cause.clone(),
            },
            ChangeStream { rx, cause },
        )
    }

    /// Receives the next change token. `None` means the producer went away.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Root cause of an unexpected close, recorded by the producer through
    /// [`StreamHandle::fail`]; [`WatchError::StreamClosed`] when none was.
    pub fn error(&self) -> WatchError {
        self.cause
            .get()
            .cloned()
            .unwrap_or(WatchError::StreamClosed)
    }
}

impl<T: Send> StreamHandle<T> {
    /// Delivers one change token. Returns `false` once the consumer is gone.
    pub async fn send(&self, token: T) -> bool {
        self.tx.send(token).await.is_ok()
    }

    /// Records the root cause and closes the stream.
    pub fn fail(self, cause: WatchError) {
        let _ = self.cause.set(cause);
    }

    /// Resolves when the consumer has dropped its half.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
