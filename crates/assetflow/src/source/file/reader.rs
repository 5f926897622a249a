use crate::{
    AssetQueue, FetchError,
    source::{DelegateRef, Event, StreamState},
};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::{path::PathBuf, sync::Arc};
use tokio::{fs::File, io::AsyncReadExt, sync::Notify};
use tokio_util::sync::CancellationToken;

/// Asynchronous, block-at-a-time reader over a local file.
///
/// Blocks are pulled from disk by a background task and handed to the
/// scheduled [`AssetQueue`]. The next block is only pulled once the current
/// one has been fully drained by [`read`](Self::read), so at most one block is
/// ever buffered.
///
/// Delivery stops as soon as the reader is unscheduled, its delegate is
/// detached, or it is closed.
pub struct FileReadStream {
    inner: Arc<ReaderInner>,
}

struct ReaderInner {
    path: PathBuf,
    block_size: usize,
    drained: Notify,
    cancel: CancellationToken,
    state: Mutex<ReaderState>,
}

struct ReaderState {
    status: StreamState,
    block: Bytes,
    queue: Option<AssetQueue>,
    delegate: Option<DelegateRef>,
}

impl FileReadStream {
    pub fn new(path: impl Into<PathBuf>, block_size: usize) -> Self {
        Self {
            inner: Arc::new(ReaderInner {
                path: path.into(),
                block_size: block_size.max(1),
                drained: Notify::new(),
                cancel: CancellationToken::new(),
                state: Mutex::new(ReaderState {
                    status: StreamState::NotOpen,
                    block: Bytes::new(),
                    queue: None,
                    delegate: None,
                }),
            }),
        }
    }

    /// Sets or clears the queue events are delivered on.
    pub fn schedule(&self, queue: Option<AssetQueue>) {
        self.inner.state.lock().queue = queue;
    }

    /// Attaches or detaches the event receiver.
    pub fn set_delegate(&self, delegate: Option<DelegateRef>) {
        self.inner.state.lock().delegate = delegate;
    }

    /// Starts pulling blocks in the background.
    ///
    /// The reader must be scheduled on a queue first.
    pub fn open(&self) {
        let queue = {
            let mut state = self.inner.state.lock();
            let Some(queue) = state.queue.clone() else {
                crate::error::contract_violation("file reader opened before being scheduled");
                return;
            };
            if !state.status.advance(StreamState::Opening) {
                return;
            }
            queue
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(path = %self.inner.path.display(), "Opening file");

        let inner = Arc::clone(&self.inner);
        queue.spawn(async move {
            let cancel = inner.cancel.clone();
            tokio::select! {
                () = cancel.cancelled() => {}
                () = inner.pump() => {}
            }
        });
    }

    /// Takes up to `max_len` bytes of the current block.
    ///
    /// If bytes remain afterwards, [`Event::BytesAvailable`] is raised again on
    /// the next queue turn. Once the block is drained the next one is pulled.
    pub fn read(&self, max_len: usize) -> Bytes {
        let mut state = self.inner.state.lock();
        if !matches!(state.status, StreamState::Open) || state.block.is_empty() {
            return Bytes::new();
        }

        let take = max_len.min(state.block.len());
        let chunk = state.block.split_to(take);

        if state.block.is_empty() {
            state.status.advance(StreamState::Reading);
            drop(state);
            self.inner.drained.notify_one();
        } else if let Some(queue) = state.queue.clone() {
            drop(state);
            let inner = Arc::clone(&self.inner);
            queue.dispatch(move || {
                if inner.has_available() {
                    inner.deliver(Event::BytesAvailable);
                }
            });
        }
        chunk
    }

    pub fn has_available(&self) -> bool {
        self.inner.has_available()
    }

    /// The unread remainder of the current block.
    pub fn peek(&self) -> Option<Bytes> {
        let state = self.inner.state.lock();
        (!state.block.is_empty()).then(|| state.block.clone())
    }

    /// Releases the file handle. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if !state.status.is_terminal() {
                state.status = StreamState::Closed;
            }
            state.block = Bytes::new();
        }
        self.inner.cancel.cancel();
    }

    pub fn status(&self) -> StreamState {
        self.inner.state.lock().status.clone()
    }
}

impl Drop for FileReadStream {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl ReaderInner {
    fn has_available(&self) -> bool {
        let state = self.state.lock();
        matches!(state.status, StreamState::Open) && !state.block.is_empty()
    }

    /// Hands `event` to the delegate unless delivery has been stopped.
    fn deliver(&self, event: Event) {
        let delegate = {
            let state = self.state.lock();
            if state.queue.is_none() || matches!(state.status, StreamState::Closed) {
                return;
            }
            state.delegate.as_ref().and_then(|delegate| delegate.upgrade())
        };
        if let Some(delegate) = delegate {
            delegate.handle_event(event);
        }
    }

    /// Applies `update` on the scheduled queue, then raises the event it
    /// returns. Resolves to `false` once delivery has been stopped.
    async fn post<F>(self: &Arc<Self>, update: F) -> bool
    where
        F: FnOnce(&mut ReaderState) -> Option<Event> + Send + 'static,
    {
        let Some(queue) = self.state.lock().queue.clone() else {
            return false;
        };
        let inner = Arc::clone(self);
        queue
            .run(move || {
                let event = {
                    let mut state = inner.state.lock();
                    if state.status.is_terminal() || state.queue.is_none() {
                        return false;
                    }
                    update(&mut state)
                };
                if let Some(event) = event {
                    inner.deliver(event);
                }
                true
            })
            .await
            .unwrap_or(false)
    }

    async fn fail(self: &Arc<Self>, err: FetchError) {
        #[cfg(feature = "tracing")]
        tracing::warn!(path = %self.path.display(), error = %err, "File read failed");

        self.post(move |state| {
            state.block = Bytes::new();
            state.status.advance(StreamState::Error(err.clone()));
            Some(Event::Errored(err))
        })
        .await;
    }

    async fn pump(self: Arc<Self>) {
        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(err) => return self.fail(FetchError::from_io(&self.path, &err)).await,
        };

        let opened = self
            .post(|state| {
                state.status.advance(StreamState::Open);
                Some(Event::Opened)
            })
            .await;
        if !opened {
            return;
        }

        loop {
            let mut buf = BytesMut::with_capacity(self.block_size);
            while buf.len() < self.block_size {
                match file.read_buf(&mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(err) => return self.fail(FetchError::from_io(&self.path, &err)).await,
                }
            }

            if buf.is_empty() {
                #[cfg(feature = "tracing")]
                tracing::debug!(path = %self.path.display(), "Reached end of file");

                self.post(|state| {
                    state.status.advance(StreamState::AtEnd);
                    Some(Event::EndReached)
                })
                .await;
                return;
            }

            let block = buf.freeze();
            let installed = self
                .post(move |state| {
                    if matches!(state.status, StreamState::Reading) {
                        state.status.advance(StreamState::Open);
                    }
                    state.block = block;
                    Some(Event::BytesAvailable)
                })
                .await;
            if !installed {
                return;
            }

            self.wait_until_drained().await;
        }
    }

    async fn wait_until_drained(&self) {
        loop {
            {
                let state = self.state.lock();
                if state.block.is_empty() || state.status.is_terminal() {
                    return;
                }
            }
            self.drained.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StreamDelegate;
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<Event>);

    impl StreamDelegate for Forward {
        fn handle_event(&self, event: Event) {
            let _ = self.0.send(event);
        }
    }

    fn scratch_file(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "assetflow-reader-{}-{name}",
            std::process::id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reads_block_by_block() {
        let path = scratch_file("blocks", &[7u8; 10]);
        let queue = AssetQueue::start("test.reader");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let delegate: Arc<dyn StreamDelegate> = Arc::new(Forward(tx));

        let reader = Arc::new(FileReadStream::new(&path, 4));
        reader.set_delegate(Some(Arc::downgrade(&delegate)));
        reader.schedule(Some(queue.clone()));
        reader.open();

        assert_eq!(rx.recv().await, Some(Event::Opened));

        let mut total = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                Event::BytesAvailable => {
                    let reader = Arc::clone(&reader);
                    let chunk = queue.run(move || reader.read(3)).await.unwrap();
                    total.extend_from_slice(&chunk);
                }
                Event::EndReached => break,
                other => panic!("unexpected {other:?}"),
            }
        }

        assert_eq!(total, vec![7u8; 10]);
        assert_eq!(reader.status(), StreamState::AtEnd);
        std::fs::remove_file(path).ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_file_errors() {
        let queue = AssetQueue::start("test.reader.missing");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let delegate: Arc<dyn StreamDelegate> = Arc::new(Forward(tx));
        let path = std::env::temp_dir().join("assetflow-reader-does-not-exist.bin");

        let reader = FileReadStream::new(&path, 16);
        reader.set_delegate(Some(Arc::downgrade(&delegate)));
        reader.schedule(Some(queue));
        reader.open();

        assert_eq!(
            rx.recv().await,
            Some(Event::Errored(FetchError::FileNotFound(path)))
        );
        assert!(matches!(reader.status(), StreamState::Error(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unscheduled_reader_stays_silent() {
        let path = scratch_file("silent", b"abc");
        let queue = AssetQueue::start("test.reader.silent");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let delegate: Arc<dyn StreamDelegate> = Arc::new(Forward(tx));

        let reader = FileReadStream::new(&path, 16);
        reader.set_delegate(Some(Arc::downgrade(&delegate)));
        reader.schedule(Some(queue.clone()));
        reader.open();
        reader.schedule(None);
        reader.set_delegate(None);
        reader.close();

        queue.run(|| ()).await;
        tokio::time::sleep(core::time::Duration::from_millis(50)).await;
        queue.run(|| ()).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(reader.status(), StreamState::Closed);
        std::fs::remove_file(path).ok();
    }
}
