//! Consumer side of an aggregator subscription.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::vibecheck::snapshot_source::SourceError;

/// One emission. Each `View` fully replaces the previous one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ViewUpdate<T> {
    View(T),

    /// The source failed to read. Not terminal: a later snapshot may follow.
    SourceError(SourceError),
}

impl<T> ViewUpdate<T> {
    pub fn into_view(self) -> Option<T> {
        match self {
            ViewUpdate::View(view) => Some(view),
            ViewUpdate::SourceError(_) => None,
        }
    }
}

/// Aggregator side of a subscription, erased over the view type.
pub(crate) trait Cancellable: Send + Sync {
    fn cancel(&self);
}

/// Lets the aggregator hand over an emission it held back while the
/// buffer was full.
pub(crate) trait Refill: Send + Sync {
    fn refill(&self);
}

/// Stops a subscription. Cloneable so the consumer can hand it to teardown
/// code while keeping the stream.
#[derive(Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    link: Option<Arc<dyn Cancellable>>,
}

impl CancelHandle {
    pub(crate) fn new(cancelled: Arc<AtomicBool>, link: Option<Arc<dyn Cancellable>>) -> Self {
        Self { cancelled, link }
    }

    /// Detaches the subscription. Calling it again is a no-op.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(link) = &self.link {
            link.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Receiving half. Yields nothing once the subscription is cancelled, even
/// if emissions are still buffered.
pub struct ViewStream<T> {
    receiver: mpsc::Receiver<ViewUpdate<T>>,
    cancelled: Arc<AtomicBool>,
    refill: Option<Arc<dyn Refill>>,
}

impl<T> ViewStream<T> {
    pub(crate) fn new(
        receiver: mpsc::Receiver<ViewUpdate<T>>,
        cancelled: Arc<AtomicBool>,
        refill: Option<Arc<dyn Refill>>,
    ) -> Self {
        Self {
            receiver,
            cancelled,
            refill,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// A slot just freed up; pull in the newest held-back emission.
    fn taken(&self) {
        if let Some(refill) = &self.refill {
            refill.refill();
        }
    }

    pub async fn recv(&mut self) -> Option<ViewUpdate<T>> {
        if self.is_cancelled() {
            return None;
        }
        let update = self.receiver.recv().await?;
        if self.is_cancelled() {
            return None;
        }
        self.taken();
        Some(update)
    }

    pub fn try_recv(&mut self) -> Result<ViewUpdate<T>, TryRecvError> {
        if self.is_cancelled() {
            return Err(TryRecvError::Disconnected);
        }
        let update = self.receiver.try_recv()?;
        self.taken();
        Ok(update)
    }
}

impl<T> Unpin for ViewStream<T> {}

impl<T> Stream for ViewStream<T> {
    type Item = ViewUpdate<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.is_cancelled() {
            return Poll::Ready(None);
        }
        match this.receiver.poll_recv(cx) {
            Poll::Ready(Some(update)) if this.is_cancelled() => {
                drop(update);
                Poll::Ready(None)
            }
            Poll::Ready(Some(update)) => {
                this.taken();
                Poll::Ready(Some(update))
            }
            other => other,
        }
    }
}

/// A live subscription: the stream of views plus its cancel function.
pub struct ViewSubscription<T> {
    stream: ViewStream<T>,
    cancel: CancelHandle,
}

impl<T> ViewSubscription<T> {
    pub(crate) fn new(stream: ViewStream<T>, cancel: CancelHandle) -> Self {
        Self { stream, cancel }
    }

    /// A subscription that already holds `value` and never touches a source.
    pub fn detached(value: T) -> Self {
        let (sender, receiver) = mpsc::channel(1);
        // Capacity is 1 and the receiver is alive, so this cannot fail.
        let _ = sender.try_send(ViewUpdate::View(value));

        let cancelled = Arc::new(AtomicBool::new(false));
        Self::new(
            ViewStream::new(receiver, cancelled.clone(), None),
            CancelHandle::new(cancelled, None),
        )
    }

    pub async fn recv(&mut self) -> Option<ViewUpdate<T>> {
        self.stream.recv().await
    }

    pub fn try_recv(&mut self) -> Result<ViewUpdate<T>, TryRecvError> {
        self.stream.try_recv()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn into_parts(self) -> (ViewStream<T>, CancelHandle) {
        (self.stream, self.cancel)
    }
}

impl<T> std::fmt::Debug for ViewSubscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewSubscription")
            .field("cancel", &self.cancel)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn detached_yields_value_then_ends() {
        let mut subscription = ViewSubscription::detached(7u32);

        assert_eq!(subscription.recv().await, Some(ViewUpdate::View(7)));
        assert_eq!(subscription.recv().await, None);
    }

    #[tokio::test]
    async fn cancel_hides_buffered_emissions() {
        let subscription = ViewSubscription::detached("buffered");
        let (mut stream, cancel) = subscription.into_parts();

        cancel.cancel();

        assert!(cancel.is_cancelled());
        assert_eq!(stream.next().await, None);
        assert_eq!(stream.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn cancel_twice_is_noop() {
        let subscription = ViewSubscription::detached(());
        let handle = subscription.cancel_handle();

        handle.cancel();
        subscription.cancel();

        assert!(subscription.is_cancelled());
    }

    #[test]
    fn into_view_discards_errors() {
        let error: ViewUpdate<u8> = ViewUpdate::SourceError(SourceError::Unavailable("x".into()));
        assert_eq!(error.into_view(), None);
        assert_eq!(ViewUpdate::View(3u8).into_view(), Some(3));
    }
}
