use super::TaskId;
use crate::{AssetQueue, FetchError};
use bytes::Bytes;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

/// Receiver of transport callbacks for one task.
pub trait TaskEvents: Send + Sync {
    fn on_response(&self, status: u16);
    fn on_data(&self, chunk: Bytes);
    fn on_complete(&self, error: Option<FetchError>);
    /// The environment is shutting down; release the task.
    fn on_shutdown(&self);
}

/// Routes transport callbacks to the source that owns each task.
///
/// Entries are non-owning, so a source that went away is simply skipped. The
/// map is only mutated from the owning [`AssetQueue`]; routing never holds the
/// lock while calling into a source.
#[derive(Clone)]
pub struct TaskRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    queue: AssetQueue,
    entries: Mutex<HashMap<TaskId, Weak<dyn TaskEvents>>>,
}

impl TaskRegistry {
    pub fn new(queue: AssetQueue) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                queue,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn queue(&self) -> &AssetQueue {
        &self.inner.queue
    }

    #[track_caller]
    pub fn register(&self, id: TaskId, target: Weak<dyn TaskEvents>) {
        self.inner.queue.assert_current("registry mutated off its queue");
        self.inner.entries.lock().insert(id, target);
    }

    /// Returns whether an entry was removed.
    #[track_caller]
    pub fn unregister(&self, id: TaskId) -> bool {
        self.inner.queue.assert_current("registry mutated off its queue");
        self.inner.entries.lock().remove(&id).is_some()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.inner.entries.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, id: TaskId) -> Option<Arc<dyn TaskEvents>> {
        let mut entries = self.inner.entries.lock();
        let target = entries.get(&id)?.upgrade();
        if target.is_none() {
            entries.remove(&id);
        }
        target
    }

    pub(crate) fn route_response(&self, id: TaskId, status: u16) {
        if let Some(target) = self.lookup(id) {
            target.on_response(status);
        }
    }

    pub(crate) fn route_data(&self, id: TaskId, chunk: Bytes) {
        if let Some(target) = self.lookup(id) {
            target.on_data(chunk);
        }
    }

    pub(crate) fn route_complete(&self, id: TaskId, error: Option<FetchError>) {
        if let Some(target) = self.lookup(id) {
            target.on_complete(error);
        } else {
            #[cfg(feature = "tracing")]
            tracing::trace!(task = %id, "Completion for unknown task dropped");
        }
    }

    /// Tells every live task owner to shut down.
    #[track_caller]
    pub(crate) fn shutdown_all(&self) {
        self.inner.queue.assert_current("registry mutated off its queue");
        let targets: Vec<_> = self
            .inner
            .entries
            .lock()
            .drain()
            .filter_map(|(_, target)| target.upgrade())
            .collect();

        #[cfg(feature = "tracing")]
        tracing::debug!(count = targets.len(), "Shutting down in-flight tasks");

        for target in targets {
            target.on_shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl TaskEvents for Recorder {
        fn on_response(&self, status: u16) {
            self.seen.lock().push(format!("response {status}"));
        }
        fn on_data(&self, chunk: Bytes) {
            self.seen.lock().push(format!("data {}", chunk.len()));
        }
        fn on_complete(&self, error: Option<FetchError>) {
            self.seen.lock().push(format!("complete {}", error.is_some()));
        }
        fn on_shutdown(&self) {
            self.seen.lock().push("shutdown".to_string());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn routes_to_registered_target() {
        let queue = AssetQueue::start("test.registry");
        let registry = TaskRegistry::new(queue.clone());
        let recorder = Arc::new(Recorder::default());
        let id = TaskId::next();

        let (r, target) = (registry.clone(), Arc::downgrade(&recorder));
        queue
            .run(move || {
                r.register(id, target);
                r.route_response(id, 200);
                r.route_data(id, Bytes::from_static(b"abc"));
                r.route_complete(id, None);
                r.route_data(TaskId::next(), Bytes::from_static(b"lost"));
            })
            .await;

        assert_eq!(
            *recorder.seen.lock(),
            vec!["response 200", "data 3", "complete false"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dead_targets_are_pruned() {
        let queue = AssetQueue::start("test.registry.dead");
        let registry = TaskRegistry::new(queue.clone());
        let id = TaskId::next();

        let r = registry.clone();
        queue
            .run(move || {
                let recorder: Arc<dyn TaskEvents> = Arc::new(Recorder::default());
                r.register(id, Arc::downgrade(&recorder));
                drop(recorder);
                r.route_response(id, 200);
            })
            .await;

        assert!(!registry.contains(id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_drains_every_entry() {
        let queue = AssetQueue::start("test.registry.shutdown");
        let registry = TaskRegistry::new(queue.clone());
        let recorder = Arc::new(Recorder::default());

        let (r, target) = (registry.clone(), Arc::downgrade(&recorder));
        queue
            .run(move || {
                r.register(TaskId::next(), target.clone());
                r.register(TaskId::next(), target);
                r.shutdown_all();
            })
            .await;

        assert!(registry.is_empty());
        assert_eq!(*recorder.seen.lock(), vec!["shutdown", "shutdown"]);
    }
}
