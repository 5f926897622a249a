use crate::{
    FetchEnv, FetchError, Result,
    source::{FileStreamSource, NetworkStreamSource, StreamSource},
    subscription::{ChunkStream, Completion, SinkSubscriber, Subscriber, Subscription},
};
use bytes::{Bytes, BytesMut};
use core::{fmt, str::FromStr};
use futures::StreamExt;
use std::{path::PathBuf, sync::Arc};
use url::Url;

/// What an [`AssetFetcher`] reads from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Locator {
    File(PathBuf),
    Remote(Url),
}

impl Locator {
    /// Classifies `raw` as a local path, a `file://` URL or an HTTP(S) URL.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::InvalidLocator`] for empty input, URLs with any
    /// other scheme, and `file://` URLs that do not name a local path.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(FetchError::InvalidLocator("empty locator".to_string()));
        }

        match Url::parse(raw) {
            // Drive letters parse as one-letter schemes.
            Ok(url) if url.scheme().len() == 1 => Ok(Self::File(PathBuf::from(raw))),
            Ok(url) => Self::try_from(url),
            Err(_) => Ok(Self::File(PathBuf::from(raw))),
        }
    }

    pub const fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

impl TryFrom<Url> for Locator {
    type Error = FetchError;

    fn try_from(url: Url) -> Result<Self> {
        match url.scheme() {
            "http" | "https" => Ok(Self::Remote(url)),
            "file" => url
                .to_file_path()
                .map(Self::File)
                .map_err(|()| FetchError::InvalidLocator(url.to_string())),
            _ => Err(FetchError::InvalidLocator(url.to_string())),
        }
    }
}

impl From<PathBuf> for Locator {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

impl FromStr for Locator {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Remote(url) => write!(f, "{url}"),
        }
    }
}

/// Publishes the bytes behind one [`Locator`].
///
/// Every subscription gets its own source, so one fetcher can be subscribed
/// to any number of times, concurrently.
#[derive(Clone, Debug)]
pub struct AssetFetcher {
    env: Arc<FetchEnv>,
    locator: Locator,
}

impl AssetFetcher {
    pub fn new(env: Arc<FetchEnv>, locator: impl Into<Locator>) -> Self {
        Self {
            env,
            locator: locator.into(),
        }
    }

    /// # Errors
    ///
    /// See [`Locator::parse`].
    pub fn parse(env: Arc<FetchEnv>, raw: &str) -> Result<Self> {
        Ok(Self::new(env, Locator::parse(raw)?))
    }

    pub const fn locator(&self) -> &Locator {
        &self.locator
    }

    /// Starts a fetch that feeds `subscriber`.
    ///
    /// [`Subscriber::on_subscribe`] runs on the next queue turn, and the
    /// source is opened right after it returns.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(locator = %self.locator)))]
    pub fn subscribe<S: Subscriber>(&self, subscriber: S) -> Subscription {
        let env = Arc::clone(&self.env);
        let locator = self.locator.clone();

        Subscription::start(
            self.locator.to_string(),
            self.env.queue().clone(),
            self.env.subscriptions(),
            self.env.config().chunk_size,
            Box::new(subscriber),
            move |delegate| -> Box<dyn StreamSource> {
                match locator {
                    Locator::File(path) => Box::new(FileStreamSource::new(
                        path,
                        env.queue().clone(),
                        delegate,
                        env.config().read_block_size,
                    )),
                    Locator::Remote(url) => Box::new(NetworkStreamSource::new(url, env, delegate)),
                }
            },
        )
    }

    /// Pull-based stream of chunks. Demand is raised one chunk at a time as
    /// the stream is polled.
    pub fn stream(&self) -> ChunkStream {
        let (subscriber, rx) = ChunkStream::channel();
        let subscription = self.subscribe(subscriber);
        ChunkStream::new(subscription, rx, self.env.config().chunk_size)
    }

    /// Pushes every chunk into `on_value` as soon as it is read, then calls
    /// `on_complete` once.
    pub fn sink<V, C>(&self, on_value: V, on_complete: C) -> Subscription
    where
        V: FnMut(Bytes) + Send + 'static,
        C: FnOnce(Completion) + Send + 'static,
    {
        self.subscribe(SinkSubscriber::new(on_value, on_complete))
    }

    /// Fetches the whole asset into memory.
    ///
    /// # Errors
    ///
    /// Returns the error the fetch completed with.
    pub async fn collect(&self) -> Result<Bytes> {
        let mut stream = self.stream();
        let mut out = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }
}
