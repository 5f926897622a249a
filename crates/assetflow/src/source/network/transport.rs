//! The HTTP seam.
//!
//! A [`HttpTransport`] turns a [`FetchRequest`] into a suspended [`DataTask`].
//! Once resumed, the task reports through its [`TransportSink`]: one
//! `response`, any number of `data` calls, then exactly one `complete`. Every
//! sink call is marshaled onto the [`AssetQueue`] and routed through the
//! [`TaskRegistry`] to the source that owns the task.

use super::TaskRegistry;
use crate::{AssetQueue, FetchConfig, FetchError, Result};
use bytes::Bytes;
use core::{fmt, time::Duration};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use portable_atomic::{AtomicU8, AtomicU64, Ordering};
use reqwest::header::{CACHE_CONTROL, PRAGMA};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use url::Url;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of one in-flight data task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// A single GET request. Caching is always disabled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: Url,
    /// Idle timeout: the longest the transport waits for the response head
    /// or for the next body chunk. A slow body that keeps trickling never
    /// trips it.
    pub timeout: Duration,
}

/// Where a [`DataTask`] reports its progress.
#[derive(Clone)]
pub struct TransportSink {
    id: TaskId,
    registry: TaskRegistry,
}

impl TransportSink {
    pub fn new(id: TaskId, registry: TaskRegistry) -> Self {
        Self { id, registry }
    }

    pub const fn id(&self) -> TaskId {
        self.id
    }

    fn queue(&self) -> &AssetQueue {
        self.registry.queue()
    }

    pub fn response(&self, status: u16) {
        let (id, registry) = (self.id, self.registry.clone());
        self.queue()
            .dispatch(move || registry.route_response(id, status));
    }

    pub fn data(&self, chunk: Bytes) {
        let (id, registry) = (self.id, self.registry.clone());
        self.queue().dispatch(move || registry.route_data(id, chunk));
    }

    /// `None` means the body finished cleanly.
    pub fn complete(&self, error: Option<FetchError>) {
        let (id, registry) = (self.id, self.registry.clone());
        self.queue()
            .dispatch(move || registry.route_complete(id, error));
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Suspended = 0,
    Running = 1,
    Canceling = 2,
    Completed = 3,
}

impl TaskState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Suspended,
            1 => Self::Running,
            2 => Self::Canceling,
            _ => Self::Completed,
        }
    }
}

/// A suspended unit of transport work.
///
/// Nothing happens until [`resume`](Self::resume). Cancelling drops the work
/// at its next await point, so no further sink calls are made.
pub struct DataTask {
    id: TaskId,
    queue: AssetQueue,
    cancel: CancellationToken,
    state: Arc<AtomicU8>,
    work: Mutex<Option<BoxFuture<'static, ()>>>,
}

impl fmt::Debug for DataTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataTask")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DataTask {
    pub fn new<F>(sink: &TransportSink, work: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            id: sink.id(),
            queue: sink.queue().clone(),
            cancel: CancellationToken::new(),
            state: Arc::new(AtomicU8::new(TaskState::Suspended as u8)),
            work: Mutex::new(Some(Box::pin(work))),
        }
    }

    pub const fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == TaskState::Running
    }

    /// Starts the work. Calling it again is a no-op.
    pub fn resume(&self) {
        let Some(work) = self.work.lock().take() else {
            return;
        };
        if self.cancel.is_cancelled() {
            return;
        }
        self.state.store(TaskState::Running as u8, Ordering::Release);

        let cancel = self.cancel.clone();
        let state = Arc::clone(&self.state);
        self.queue.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = work => {}
            }
            state.store(TaskState::Completed as u8, Ordering::Release);
        });
    }

    pub fn cancel(&self) {
        let _ = self.state.compare_exchange(
            TaskState::Running as u8,
            TaskState::Canceling as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.work.lock().take();
        self.cancel.cancel();
    }
}

/// Produces [`DataTask`]s for GET requests.
pub trait HttpTransport: Send + Sync {
    fn data_task(&self, request: FetchRequest, sink: TransportSink) -> DataTask;
}

/// [`HttpTransport`] backed by a shared [`reqwest::Client`].
///
/// Cookies and caches are never used. At most
/// [`max_concurrent_fetches`](FetchConfig::max_concurrent_fetches) requests
/// are in flight at once; the rest wait for a permit.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    permits: Arc<Semaphore>,
}

impl ReqwestTransport {
    /// # Errors
    ///
    /// Returns [`FetchError::Transport`] if the TLS backend cannot be
    /// initialised.
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.request_timeout)
            .build()?;
        Ok(Self::with_client(client, config.max_concurrent_fetches))
    }

    pub fn with_client(client: reqwest::Client, max_concurrent_fetches: usize) -> Self {
        Self {
            client,
            permits: Arc::new(Semaphore::new(max_concurrent_fetches.max(1))),
        }
    }
}

impl HttpTransport for ReqwestTransport {
    fn data_task(&self, request: FetchRequest, sink: TransportSink) -> DataTask {
        let client = self.client.clone();
        let permits = Arc::clone(&self.permits);
        let reporter = sink.clone();

        DataTask::new(&sink, async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return reporter.complete(Some(FetchError::Transport(
                    "transport is shutting down".to_string(),
                )));
            };

            #[cfg(feature = "tracing")]
            tracing::debug!(task = %reporter.id(), url = %request.url, "Sending request");

            let idle = request.timeout;
            let send = client
                .get(request.url)
                .header(CACHE_CONTROL, "no-cache")
                .header(PRAGMA, "no-cache")
                .send();
            let mut response = match tokio::time::timeout(idle, send).await {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => return reporter.complete(Some(err.into())),
                Err(_) => return reporter.complete(Some(idle_timeout(idle))),
            };

            let status = response.status().as_u16();
            reporter.response(status);
            if status != 200 {
                // The source cancels the task on any other status.
                return;
            }

            loop {
                match tokio::time::timeout(idle, response.chunk()).await {
                    Ok(Ok(Some(chunk))) => reporter.data(chunk),
                    Ok(Ok(None)) => return reporter.complete(None),
                    Ok(Err(err)) => return reporter.complete(Some(err.into())),
                    Err(_) => return reporter.complete(Some(idle_timeout(idle))),
                }
            }
        })
    }
}

fn idle_timeout(idle: Duration) -> FetchError {
    FetchError::Transport(format!("no data received for {idle:?}"))
}
