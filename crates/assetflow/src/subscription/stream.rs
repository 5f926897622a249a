use super::{Completion, Subscriber, Subscription};
use crate::{Demand, FetchError};
use bytes::Bytes;
use core::{
    pin::Pin,
    task::{Context, Poll},
};
use futures::Stream;
use tokio::sync::mpsc;

pub(crate) enum Message {
    Chunk(Bytes),
    Done(Completion),
}

/// Forwards everything into a channel read by [`ChunkStream`].
pub(crate) struct ChannelSubscriber {
    tx: mpsc::UnboundedSender<Message>,
}

impl Subscriber for ChannelSubscriber {
    fn on_subscribe(&mut self, _subscription: Subscription) {}

    fn on_next(&mut self, chunk: Bytes) -> Demand {
        let _ = self.tx.send(Message::Chunk(chunk));
        Demand::none()
    }

    fn on_complete(&mut self, completion: Completion) {
        let _ = self.tx.send(Message::Done(completion));
    }
}

/// Pull-based view of a subscription.
///
/// Each poll that finds nothing buffered requests one more `chunk_size` worth
/// of demand, so at most one chunk is ever in flight. Yields `Err` once if the
/// fetch fails, then ends. Dropping the stream cancels the subscription.
pub struct ChunkStream {
    subscription: Subscription,
    rx: mpsc::UnboundedReceiver<Message>,
    chunk_size: usize,
    /// Demand requested but not yet delivered.
    outstanding: usize,
    done: bool,
}

impl ChunkStream {
    pub(crate) fn channel() -> (ChannelSubscriber, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelSubscriber { tx }, rx)
    }

    pub(crate) fn new(
        subscription: Subscription,
        rx: mpsc::UnboundedReceiver<Message>,
        chunk_size: usize,
    ) -> Self {
        Self {
            subscription,
            rx,
            chunk_size: chunk_size.max(1),
            outstanding: 0,
            done: false,
        }
    }

    pub const fn subscription(&self) -> &Subscription {
        &self.subscription
    }
}

impl Stream for ChunkStream {
    type Item = Result<Bytes, FetchError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Message::Chunk(chunk))) => {
                self.outstanding = self.outstanding.saturating_sub(chunk.len());
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Message::Done(Completion::Failed(err)))) => {
                self.done = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(Some(Message::Done(Completion::Finished)) | None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => {
                if self.outstanding == 0 {
                    self.outstanding = self.chunk_size;
                    self.subscription.request(Demand::max(self.chunk_size));
                }
                Poll::Pending
            }
        }
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        if !self.done {
            self.subscription.cancel();
        }
    }
}

/// Closure-driven consumer that requests unbounded demand up front.
pub struct SinkSubscriber<V, C> {
    on_value: V,
    on_complete: Option<C>,
}

impl<V, C> SinkSubscriber<V, C>
where
    V: FnMut(Bytes) + Send + 'static,
    C: FnOnce(Completion) + Send + 'static,
{
    pub const fn new(on_value: V, on_complete: C) -> Self {
        Self {
            on_value,
            on_complete: Some(on_complete),
        }
    }
}

impl<V, C> Subscriber for SinkSubscriber<V, C>
where
    V: FnMut(Bytes) + Send + 'static,
    C: FnOnce(Completion) + Send + 'static,
{
    fn on_subscribe(&mut self, subscription: Subscription) {
        subscription.request(Demand::UNBOUNDED);
    }

    fn on_next(&mut self, chunk: Bytes) -> Demand {
        (self.on_value)(chunk);
        Demand::none()
    }

    fn on_complete(&mut self, completion: Completion) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(completion);
        }
    }
}
