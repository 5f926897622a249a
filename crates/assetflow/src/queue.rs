//! The serial execution context that owns every source lifecycle transition.
//!
//! An [`AssetQueue`] is a single Tokio task draining an unbounded MPSC channel
//! of boxed closures. Jobs run one at a time, to completion, in submission
//! order. Collaborator callbacks (file reader, HTTP transport) are marshaled
//! onto the queue before they touch any shared state, and every event a
//! [`StreamSource`](crate::source::StreamSource) raises is delivered from it.
//!
//! A job that dispatches another job never runs it inline: the new job is
//! queued behind everything already submitted. Sources rely on this to re-arm
//! readiness events without recursing into the subscription.

use crate::error::contract_violation;
use portable_atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

type Job = Box<dyn FnOnce() + Send + 'static>;

tokio::task_local! {
    /// Identifier of the queue whose job is currently executing.
    static CURRENT_QUEUE: u64;
}

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a serial execution context. Cheap to clone.
#[derive(Clone)]
pub struct AssetQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    id: u64,
    label: String,
    tx: mpsc::UnboundedSender<Job>,
    handle: Handle,
    shutdown_token: CancellationToken,
    is_shutdown: AtomicBool,
}

impl core::fmt::Debug for AssetQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AssetQueue")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .finish_non_exhaustive()
    }
}

impl AssetQueue {
    /// Starts a new queue on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside the context of a Tokio runtime.
    pub fn start(label: impl Into<String>) -> Self {
        Self::start_on(&Handle::current(), label)
    }

    /// Starts a new queue whose worker and spawned I/O run on `handle`.
    pub fn start_on(handle: &Handle, label: impl Into<String>) -> Self {
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let label = label.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown_token = CancellationToken::new();

        handle.spawn(CURRENT_QUEUE.scope(
            id,
            queue_loop(label.clone(), rx, shutdown_token.clone()),
        ));

        Self {
            inner: Arc::new(QueueInner {
                id,
                label,
                tx,
                handle: handle.clone(),
                shutdown_token,
                is_shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Enqueues `job` behind every job already submitted.
    ///
    /// Returns `false` if the queue has been shut down and the job was
    /// dropped.
    pub fn dispatch<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.is_shutdown.load(Ordering::Acquire) {
            return false;
        }
        self.inner.tx.send(Box::new(job)).is_ok()
    }

    /// Runs `job` on the queue and waits for its result.
    ///
    /// Resolves to `None` if the queue shut down before the job ran.
    pub async fn run<F, R>(&self, job: F) -> Option<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        if !self.dispatch(move || {
            let _ = tx.send(job());
        }) {
            return None;
        }
        rx.await.ok()
    }

    /// Returns `true` only while a job of this queue is executing.
    pub fn is_current(&self) -> bool {
        CURRENT_QUEUE
            .try_with(|id| *id == self.inner.id)
            .unwrap_or(false)
    }

    /// Flags a caller that must run on this queue but does not.
    #[track_caller]
    pub(crate) fn assert_current(&self, what: &'static str) {
        if !self.is_current() {
            contract_violation(what);
        }
    }

    /// Spawns collaborator I/O on the runtime backing this queue.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.handle.spawn(fut)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown.load(Ordering::Acquire)
    }

    /// Stops the queue. Jobs still pending are dropped without running.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.inner.is_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(queue = %self.inner.label, "Shutting down asset queue");
        self.inner.shutdown_token.cancel();
    }
}

async fn queue_loop(
    _label: String,
    mut rx: mpsc::UnboundedReceiver<Job>,
    shutdown_token: CancellationToken,
) {
    #[cfg(feature = "tracing")]
    tracing::trace!(queue = %_label, "Asset queue started");

    loop {
        tokio::select! {
            biased;
            () = shutdown_token.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job(),
                None => break,
            },
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!(queue = %_label, "Asset queue stopped");
}
