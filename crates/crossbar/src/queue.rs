use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::GatewayError;
use crate::requests::{ProviderId, Request};
use crate::response::{Response, ResponseStream};

/// The queued unit of work: the request, its call context, and the
/// single-slot channels the worker answers on. Exactly one of the three
/// channels receives a value.
pub struct WorkItem {
    pub ctx: Context,
    pub request: Request,
    pub response_tx: mpsc::Sender<Box<Response>>,
    pub error_tx: mpsc::Sender<Box<GatewayError>>,
    pub stream_tx: Option<mpsc::Sender<ResponseStream>>,
}

/// The caller's ends of a work item's result channels.
pub struct WorkItemReceivers {
    pub response_rx: mpsc::Receiver<Box<Response>>,
    pub error_rx: mpsc::Receiver<Box<GatewayError>>,
    pub stream_rx: Option<mpsc::Receiver<ResponseStream>>,
}

impl WorkItem {
    pub fn new(ctx: Context, request: Request) -> (WorkItem, WorkItemReceivers) {
        let (response_tx, response_rx) = mpsc::channel(1);
        let (error_tx, error_rx) = mpsc::channel(1);
        let (stream_tx, stream_rx) = if request.kind.is_streaming() {
            let (tx, rx) = mpsc::channel(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        (
            WorkItem {
                ctx,
                request,
                response_tx,
                error_tx,
                stream_tx,
            },
            WorkItemReceivers {
                response_rx,
                error_rx,
                stream_rx,
            },
        )
    }
}

/// Bounded FIFO of work items for one provider, with lifecycle flags.
///
/// Lifecycle: open, then `signal_closing` (atomic flag plus done-signal
/// broadcast, so stranded producers stop), then `close` (the FIFO itself
/// closes and workers drain to end-of-stream). `signal_closing` must precede
/// `close`; both are idempotent.
pub struct ProviderQueue {
    provider: ProviderId,
    tx: RwLock<Option<mpsc::Sender<WorkItem>>>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
    closing: AtomicBool,
    done: CancellationToken,
    capacity: usize,
}

impl ProviderQueue {
    pub fn new(provider: ProviderId, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        ProviderQueue {
            provider,
            tx: RwLock::new(Some(tx)),
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            closing: AtomicBool::new(false),
            done: CancellationToken::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn provider(&self) -> &ProviderId {
        &self.provider
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn sender(&self) -> Option<mpsc::Sender<WorkItem>> {
        self.tx
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Adds a work item, honoring the drop policy when the queue is full.
    ///
    /// Fails with a shutdown error when the queue is closing, when the
    /// done-signal fires mid-send, or with a cancellation error when the
    /// caller's context cancels while waiting for space.
    pub async fn enqueue(
        &self,
        ctx: &Context,
        item: WorkItem,
        drop_excess: bool,
    ) -> Result<(), Box<GatewayError>> {
        if self.is_closing() {
            return Err(GatewayError::shutting_down(&self.provider).boxed());
        }
        let Some(tx) = self.sender() else {
            return Err(GatewayError::shutting_down(&self.provider).boxed());
        };

        let item = match tx.try_send(item) {
            Ok(()) => return Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(GatewayError::shutting_down(&self.provider).boxed());
            }
            Err(mpsc::error::TrySendError::Full(item)) => item,
        };

        if drop_excess {
            return Err(GatewayError::queue_full(&self.provider).boxed());
        }

        // The closing flag may have been set between the first check and the
        // failed try_send; re-check before parking on the blocking send.
        if self.is_closing() {
            return Err(GatewayError::shutting_down(&self.provider).boxed());
        }

        tokio::select! {
            _ = self.done.cancelled() => {
                Err(GatewayError::shutting_down(&self.provider).boxed())
            }
            _ = ctx.cancelled() => {
                Err(GatewayError::cancelled_waiting_for_queue().boxed())
            }
            sent = tx.send(item) => {
                sent.map_err(|_| GatewayError::shutting_down(&self.provider).boxed())
            }
        }
    }

    /// Non-blocking enqueue used by the reconfigure transfer. Returns the
    /// item on failure so the caller can retry with a deadline.
    pub fn try_enqueue(&self, item: WorkItem) -> Result<(), WorkItem> {
        let Some(tx) = self.sender() else {
            return Err(item);
        };
        match tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(item))
            | Err(mpsc::error::TrySendError::Closed(item)) => Err(item),
        }
    }

    /// Blocking enqueue bounded only by the caller-supplied deadline logic;
    /// used by the reconfigure transfer task.
    pub async fn enqueue_blocking(&self, item: WorkItem) -> Result<(), ()> {
        let Some(tx) = self.sender() else {
            return Err(());
        };
        tx.send(item).await.map_err(|_| ())
    }

    /// Next item for a worker; `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<WorkItem> {
        self.rx.lock().await.recv().await
    }

    /// Drains whatever is immediately available, for the reconfigure
    /// transfer.
    pub fn try_pop(&self) -> Option<WorkItem> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Marks the queue as closing and broadcasts the done-signal. Producers
    /// blocked on a full queue wake up and fail with a shutdown error.
    /// Idempotent.
    pub fn signal_closing(&self) {
        if !self.closing.swap(true, Ordering::AcqRel) {
            self.done.cancel();
        }
    }

    /// Closes the FIFO so workers see end-of-stream after draining.
    /// `signal_closing` must have been called first. Idempotent.
    pub fn close(&self) {
        debug_assert!(self.is_closing(), "close called before signal_closing");
        self.tx
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::{ChatMessage, ProviderId};
    use std::time::Duration;

    fn chat_item() -> (WorkItem, WorkItemReceivers) {
        let request = Request::chat(ProviderId::OpenAi, "gpt-4o", vec![ChatMessage::user("hi")]);
        WorkItem::new(Context::new(), request)
    }

    fn queue(capacity: usize) -> ProviderQueue {
        ProviderQueue::new(ProviderId::OpenAi, capacity)
    }

    #[tokio::test]
    async fn enqueue_then_recv_is_fifo() {
        let q = queue(4);
        for _ in 0..3 {
            let (item, _rx) = chat_item();
            q.enqueue(&Context::new(), item, false).await.unwrap();
        }
        for _ in 0..3 {
            assert!(q.recv().await.is_some());
        }
    }

    #[tokio::test]
    async fn enqueue_fails_after_signal_closing() {
        let q = queue(4);
        q.signal_closing();
        let (item, _rx) = chat_item();
        let err = q.enqueue(&Context::new(), item, false).await.unwrap_err();
        assert_eq!(err.error_type, Some(crate::error::ErrorType::ShuttingDown));
    }

    #[tokio::test]
    async fn full_queue_drops_when_drop_policy_on() {
        let q = queue(1);
        let (a, _arx) = chat_item();
        q.enqueue(&Context::new(), a, true).await.unwrap();
        let (b, _brx) = chat_item();
        let err = q.enqueue(&Context::new(), b, true).await.unwrap_err();
        assert_eq!(err.error_type, Some(crate::error::ErrorType::QueueDropped));
    }

    #[tokio::test]
    async fn full_queue_blocks_until_space_when_drop_policy_off() {
        let q = Arc::new(queue(1));
        let (a, _arx) = chat_item();
        q.enqueue(&Context::new(), a, false).await.unwrap();

        let q2 = q.clone();
        let blocked = tokio::spawn(async move {
            let (b, _brx) = chat_item();
            q2.enqueue(&Context::new(), b, false).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        assert!(q.recv().await.is_some());
        blocked.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn caller_cancellation_unblocks_full_enqueue() {
        let q = Arc::new(queue(1));
        let (a, _arx) = chat_item();
        q.enqueue(&Context::new(), a, false).await.unwrap();

        let ctx = Context::new();
        let ctx2 = ctx.clone();
        let q2 = q.clone();
        let blocked = tokio::spawn(async move {
            let (b, _brx) = chat_item();
            q2.enqueue(&ctx2, b, false).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.cancel();
        let err = blocked.await.unwrap().unwrap_err();
        assert!(err.message.contains("waiting for queue space"));
    }

    #[tokio::test]
    async fn done_signal_unblocks_full_enqueue() {
        let q = Arc::new(queue(1));
        let (a, _arx) = chat_item();
        q.enqueue(&Context::new(), a, false).await.unwrap();

        let q2 = q.clone();
        let blocked = tokio::spawn(async move {
            let (b, _brx) = chat_item();
            q2.enqueue(&Context::new(), b, false).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.signal_closing();
        let err = blocked.await.unwrap().unwrap_err();
        assert_eq!(err.error_type, Some(crate::error::ErrorType::ShuttingDown));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_drains() {
        let q = queue(4);
        let (item, _rx) = chat_item();
        q.enqueue(&Context::new(), item, false).await.unwrap();

        q.signal_closing();
        q.signal_closing();
        q.close();
        q.close();

        assert!(q.recv().await.is_some());
        assert!(q.recv().await.is_none());
    }
}
