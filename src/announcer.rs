use std::future::Future;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::warn;

/// A bounded fire-and-forget dispatch queue drained by one dedicated
/// task.
///
/// Handlers that push notifications to slow downstream sinks (chat
/// webhooks and the like) hand messages to an `Announcer` instead of
/// blocking their own run. The queue is bounded: when the sink cannot
/// keep up, [`Announcer::announce`] sheds the new message and reports it,
/// rather than growing without limit.
pub struct Announcer<M> {
    tx: mpsc::Sender<M>,
    handle: JoinHandle<()>,
}

impl<M: Send + 'static> Announcer<M> {
    /// Spawn the drain task with the given queue capacity and delivery
    /// function.
    pub fn start<F, Fut>(capacity: usize, mut deliver: F) -> Self
    where
        F: FnMut(M) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (tx, mut rx) = mpsc::channel(capacity);
        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                deliver(message).await;
            }
        });

        Self { tx, handle }
    }

    /// Enqueue a message without waiting.
    ///
    /// Returns `false` if the message was shed because the queue is full
    /// or the drain task is gone.
    pub fn announce(&self, message: M) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("announcer queue full, message dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!("announcer task gone, message dropped");
                false
            }
        }
    }

    /// Drain the remaining messages and stop the task.
    pub async fn close(self) {
        drop(self.tx);
        if let Err(error) = self.handle.await {
            warn!(%error, "announcer task panicked");
        }
    }
}
