mod registry;
mod transport;

pub use registry::{TaskEvents, TaskRegistry};
pub use transport::{
    DataTask, FetchRequest, HttpTransport, ReqwestTransport, TaskId, TaskState, TransportSink,
};

use crate::{
    ByteQueue, FetchEnv, FetchError,
    error::contract_violation,
    source::{DelegateRef, Event, StreamSource, StreamState},
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use url::Url;

/// A [`StreamSource`] over a streaming HTTP GET.
///
/// The body is buffered as it arrives and drained by [`read`](StreamSource::read).
/// [`Event::BytesAvailable`] is raised when the buffer goes from empty to
/// non-empty, and again after every read that leaves bytes behind.
pub struct NetworkStreamSource {
    inner: Arc<NetworkInner>,
}

struct NetworkInner {
    me: Weak<NetworkInner>,
    url: Url,
    env: Arc<FetchEnv>,
    state: Mutex<NetworkState>,
}

struct NetworkState {
    status: StreamState,
    buffer: ByteQueue,
    /// The transport delivered the whole body.
    finished: bool,
    closed: bool,
    task: Option<DataTask>,
    delegate: Option<DelegateRef>,
}

impl NetworkStreamSource {
    pub fn new(url: Url, env: Arc<FetchEnv>, delegate: DelegateRef) -> Self {
        Self {
            inner: Arc::new_cyclic(|me| NetworkInner {
                me: me.clone(),
                url,
                env,
                state: Mutex::new(NetworkState {
                    status: StreamState::NotOpen,
                    buffer: ByteQueue::new(),
                    finished: false,
                    closed: false,
                    task: None,
                    delegate: Some(delegate),
                }),
            }),
        }
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    /// Identifier of the running data task, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        self.inner.state.lock().task.as_ref().map(DataTask::id)
    }
}

impl StreamSource for NetworkStreamSource {
    fn open(&self) {
        if self.inner.state.lock().status != StreamState::NotOpen {
            contract_violation("network source opened twice");
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.env.queue().dispatch(move || inner.start());
    }

    fn read(&self, max_len: usize) -> Bytes {
        self.inner.env.queue().assert_current("network read off the queue");

        let mut state = self.inner.state.lock();
        if !matches!(state.status, StreamState::Open | StreamState::Reading) {
            return Bytes::new();
        }
        let chunk = state.buffer.take(max_len);

        if !state.buffer.is_empty() {
            drop(state);
            self.inner.emit(Event::BytesAvailable);
        } else if state.finished {
            state.status.advance(StreamState::AtEnd);
            drop(state);
            self.inner.emit(Event::EndReached);
        } else {
            state.status.advance(StreamState::Open);
        }
        chunk
    }

    fn has_available(&self) -> bool {
        !self.inner.state.lock().buffer.is_empty()
    }

    fn peek(&self) -> Option<Bytes> {
        self.inner.state.lock().buffer.contiguous()
    }

    fn close(&self) {
        self.inner.close();
    }

    fn state(&self) -> StreamState {
        self.inner.state.lock().status.clone()
    }
}

impl Drop for NetworkStreamSource {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl NetworkInner {
    /// Raises `event` on the next queue turn, unless the source has been
    /// closed or its delegate detached by then.
    fn emit(&self, event: Event) {
        let Some(inner) = self.me.upgrade() else {
            return;
        };
        self.env.queue().dispatch(move || {
            let delegate = {
                let state = inner.state.lock();
                if state.closed {
                    return;
                }
                state.delegate.as_ref().and_then(Weak::upgrade)
            };
            if let Some(delegate) = delegate {
                delegate.handle_event(event);
            }
        });
    }

    fn fail(&self, state: &mut NetworkState, err: FetchError) {
        #[cfg(feature = "tracing")]
        tracing::warn!(url = %self.url, error = %err, "Network fetch failed");

        state.buffer.clear();
        state.status.advance(StreamState::Error(err.clone()));
        self.emit(Event::Errored(err));
    }

    fn start(&self) {
        let mut state = self.state.lock();
        if state.closed || state.status != StreamState::NotOpen {
            return;
        }

        if self.env.config().fail_fast_offline && !self.env.connectivity().is_up() {
            return self.fail(&mut state, FetchError::NotReachable);
        }

        let id = TaskId::next();
        let registry = self.env.registry();
        let request = FetchRequest {
            url: self.url.clone(),
            timeout: self.env.config().request_timeout,
        };
        let task = self
            .env
            .transport()
            .data_task(request, TransportSink::new(id, registry.clone()));

        let target: Weak<dyn TaskEvents> = self.me.clone();
        registry.register(id, target);
        state.status.advance(StreamState::Opening);

        #[cfg(feature = "tracing")]
        tracing::debug!(task = %id, url = %self.url, "Starting network fetch");

        task.resume();
        state.task = Some(task);
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        if !state.status.is_terminal() {
            state.status = StreamState::Closed;
        }
        state.delegate = None;
        state.buffer.clear();

        let Some(task) = state.task.take() else {
            return;
        };
        drop(state);

        if task.is_running() {
            task.cancel();
        }
        let id = task.id();
        let registry = self.env.registry().clone();
        if registry.queue().is_current() {
            registry.unregister(id);
        } else {
            registry.queue().clone().dispatch(move || {
                registry.unregister(id);
            });
        }
    }
}

impl TaskEvents for NetworkInner {
    fn on_response(&self, status: u16) {
        let mut state = self.state.lock();
        if state.closed || state.status.is_terminal() {
            return;
        }

        if status == 200 {
            state.status.advance(StreamState::Open);
            drop(state);
            self.emit(Event::Opened);
            return;
        }

        if let Some(task) = state.task.take() {
            task.cancel();
            self.env.registry().unregister(task.id());
        }
        self.fail(&mut state, FetchError::HttpStatus(status));
    }

    fn on_data(&self, chunk: Bytes) {
        let mut state = self.state.lock();
        if state.closed || state.status.is_terminal() || chunk.is_empty() {
            return;
        }

        let was_empty = state.buffer.is_empty();
        state.buffer.push(chunk);
        if matches!(state.status, StreamState::Open) {
            state.status.advance(StreamState::Reading);
        }
        if was_empty {
            drop(state);
            self.emit(Event::BytesAvailable);
        }
    }

    fn on_complete(&self, error: Option<FetchError>) {
        let mut state = self.state.lock();
        if state.closed || state.status.is_terminal() {
            return;
        }
        if let Some(task) = state.task.take() {
            self.env.registry().unregister(task.id());
        }

        if let Some(err) = error {
            return self.fail(&mut state, err);
        }
        if state.status == StreamState::Opening {
            // A body cannot end before its response head.
            return self.fail(
                &mut state,
                FetchError::Transport("transfer completed without a response".to_string()),
            );
        }

        state.finished = true;
        if state.buffer.is_empty() {
            #[cfg(feature = "tracing")]
            tracing::debug!(url = %self.url, "Network body complete");

            state.status.advance(StreamState::AtEnd);
            drop(state);
            self.emit(Event::EndReached);
        }
    }

    fn on_shutdown(&self) {
        self.close();
    }
}
