use crate::{
    AssetQueue, Connectivity, FetchConfig, Result,
    source::{HttpTransport, ReqwestTransport, TaskRegistry},
    subscription::Subscriptions,
};
use portable_atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;

/// Everything the fetchers of one process share: the serial queue, the task
/// registry, the connectivity signal and the HTTP transport.
///
/// Built once with [`FetchEnv::init`] (or [`FetchEnv::builder`] to swap in
/// collaborators) and passed to every [`AssetFetcher`](crate::AssetFetcher).
pub struct FetchEnv {
    config: FetchConfig,
    queue: AssetQueue,
    registry: TaskRegistry,
    connectivity: Connectivity,
    transport: Arc<dyn HttpTransport>,
    subscriptions: Arc<Subscriptions>,
    is_shutdown: AtomicBool,
}

impl core::fmt::Debug for FetchEnv {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FetchEnv")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .field("connectivity", &self.connectivity.is_up())
            .field("in_flight", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl FetchEnv {
    /// Builds an environment with the default [`ReqwestTransport`] on the
    /// current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails if `config` does not validate or the HTTP client cannot be built.
    ///
    /// # Panics
    ///
    /// Panics if called outside the context of a Tokio runtime.
    pub fn init(config: FetchConfig) -> Result<Arc<Self>> {
        Self::builder(config).build()
    }

    pub fn builder(config: FetchConfig) -> FetchEnvBuilder {
        FetchEnvBuilder {
            config,
            handle: None,
            connectivity: None,
            transport: None,
        }
    }

    pub const fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub const fn queue(&self) -> &AssetQueue {
        &self.queue
    }

    pub const fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub const fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn transport(&self) -> &dyn HttpTransport {
        self.transport.as_ref()
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    /// Fails every subscription still running with
    /// [`FetchError::Shutdown`](crate::FetchError::Shutdown), cancels every
    /// in-flight network task, stops the connectivity probe and stops the
    /// queue. Subscriptions started afterwards fail the same way right away.
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::info!(in_flight = self.registry.len(), "Shutting down fetch environment");

        let registry = self.registry.clone();
        let subscriptions = Arc::clone(&self.subscriptions);
        self.queue
            .run(move || {
                subscriptions.shutdown_all();
                registry.shutdown_all();
            })
            .await;
        self.connectivity.stop_probe();
        self.queue.shutdown();
    }
}

/// Configures collaborators before building a [`FetchEnv`].
pub struct FetchEnvBuilder {
    config: FetchConfig,
    handle: Option<Handle>,
    connectivity: Option<Connectivity>,
    transport: Option<Arc<dyn HttpTransport>>,
}

impl FetchEnvBuilder {
    /// Runtime the queue and transport I/O run on. Defaults to the current
    /// one.
    #[must_use]
    pub fn handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Reachability signal to consult. Defaults to one that reports up.
    #[must_use]
    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// # Errors
    ///
    /// Fails if the config does not validate or the default HTTP client
    /// cannot be built.
    ///
    /// # Panics
    ///
    /// Panics if no runtime handle was given and this is called outside the
    /// context of a Tokio runtime.
    pub fn build(self) -> Result<Arc<FetchEnv>> {
        self.config.validate()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(&self.config)?),
        };
        let handle = self.handle.unwrap_or_else(Handle::current);
        let queue = AssetQueue::start_on(&handle, "assetflow.queue");

        #[cfg(feature = "tracing")]
        tracing::debug!(config = ?self.config, "Fetch environment ready");

        Ok(Arc::new(FetchEnv {
            registry: TaskRegistry::new(queue.clone()),
            queue,
            connectivity: self.connectivity.unwrap_or_default(),
            transport,
            subscriptions: Arc::default(),
            config: self.config,
            is_shutdown: AtomicBool::new(false),
        }))
    }
}
