#![allow(dead_code)]

use assetflow::{
    Completion, Demand, FetchEnv, Subscriber, Subscription,
    source::{DataTask, FetchRequest, HttpTransport, TransportSink},
};
use bytes::Bytes;
use core::time::Duration;
use parking_lot::Mutex;
use portable_atomic::{AtomicUsize, Ordering};
use std::{path::PathBuf, sync::Arc};
use tokio::sync::oneshot;

static NEXT_FILE: AtomicUsize = AtomicUsize::new(0);

/// A file under the temp dir, removed on drop.
pub struct TempFile {
    pub path: PathBuf,
}

impl TempFile {
    pub fn with_contents(contents: &[u8]) -> Self {
        let path = std::env::temp_dir().join(format!(
            "assetflow-test-{}-{}.bin",
            std::process::id(),
            NEXT_FILE.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&path, contents).expect("failed to write temp file");
        Self { path }
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        std::fs::remove_file(&self.path).ok();
    }
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Subscriber that records every chunk and reports its completion.
pub struct Recorder {
    pub chunks: Arc<Mutex<Vec<Bytes>>>,
    initial: Demand,
    per_chunk: Demand,
    done: Option<oneshot::Sender<Completion>>,
}

impl Recorder {
    pub fn new(
        initial: Demand,
        per_chunk: Demand,
    ) -> (Self, Arc<Mutex<Vec<Bytes>>>, oneshot::Receiver<Completion>) {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = oneshot::channel();
        let recorder = Self {
            chunks: Arc::clone(&chunks),
            initial,
            per_chunk,
            done: Some(tx),
        };
        (recorder, chunks, rx)
    }
}

impl Subscriber for Recorder {
    fn on_subscribe(&mut self, subscription: Subscription) {
        subscription.request(self.initial);
    }

    fn on_next(&mut self, chunk: Bytes) -> Demand {
        self.chunks.lock().push(chunk);
        self.per_chunk
    }

    fn on_complete(&mut self, completion: Completion) {
        if let Some(done) = self.done.take() {
            let _ = done.send(completion);
        }
    }
}

pub fn lengths(chunks: &Mutex<Vec<Bytes>>) -> Vec<usize> {
    chunks.lock().iter().map(Bytes::len).collect()
}

pub fn concat(chunks: &Mutex<Vec<Bytes>>) -> Vec<u8> {
    chunks.lock().iter().flat_map(|c| c.iter().copied()).collect()
}

/// Lets every chain of queued jobs run to completion.
pub async fn settle(env: &FetchEnv) {
    for _ in 0..16 {
        env.queue().run(|| ()).await;
    }
}

pub async fn completion(rx: oneshot::Receiver<Completion>) -> Completion {
    tokio::time::timeout(Duration::from_secs(10), rx)
        .await
        .expect("timed out waiting for completion")
        .expect("subscriber dropped without completing")
}

/// Transport whose responses are driven by the test through the captured
/// sinks.
#[derive(Default)]
pub struct ScriptedTransport {
    sinks: Mutex<Vec<(FetchRequest, TransportSink)>>,
}

impl ScriptedTransport {
    pub fn requests(&self) -> usize {
        self.sinks.lock().len()
    }

    /// Waits for the `n`th (zero-based) task to be created.
    pub async fn sink(&self, n: usize) -> TransportSink {
        for _ in 0..1000 {
            if let Some((_, sink)) = self.sinks.lock().get(n) {
                return sink.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("transport task {n} was never created");
    }
}

impl HttpTransport for ScriptedTransport {
    fn data_task(&self, request: FetchRequest, sink: TransportSink) -> DataTask {
        self.sinks.lock().push((request, sink.clone()));
        DataTask::new(&sink, async {})
    }
}
