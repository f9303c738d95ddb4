use parking_lot::Mutex;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::{ProviderError, StreamEvent, StreamResult};

pub type EventSender = mpsc::Sender<Result<StreamEvent, ProviderError>>;

pub const DEFAULT_CAPACITY: usize = 64;

/// Background pump that owns a transport's live connection.
///
/// The producer future writes events into a bounded channel; the returned
/// stream reads them in order. `cancel` drops the producer (closing whatever
/// socket it holds) and waits for the task to finish, so once it returns no
/// further events are produced.
pub struct StreamTask {
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StreamTask {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn spawn<F, Fut>(&self, capacity: usize, producer: F) -> StreamResult
    where
        F: FnOnce(EventSender) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let token = self.token.clone();
        let producer = producer(tx);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("stream producer canceled");
                }
                _ = producer => {}
            }
        });
        if let Some(previous) = self.handle.lock().replace(handle) {
            previous.abort();
        }
        Box::pin(ReceiverStream::new(rx))
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn cancel(&self) {
        self.token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    tracing::warn!(%err, "stream producer panicked");
                }
            }
        }
    }
}

impl Default for StreamTask {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StreamTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
