use super::config::RunConfig;
use super::telemetry::{
    decrement_fetches_inflight, increment_bytes_delivered, increment_fetch_errors,
    increment_fetches_inflight, increment_fetches_started, record_fetch_duration,
};
use anyhow::{Context, anyhow, bail};
use assetflow::{AssetFetcher, Completion, Demand, FetchEnv, Locator, Subscriber, Subscription};
use bytes::Bytes;
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinSet,
};

/// Where one fetched asset ends up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Stdout,
    File(PathBuf),
}

enum Delivery {
    Chunk(Bytes),
    Done(Completion),
}

/// Hands every callback to the writer task. Demand is raised by the writer as
/// it drains, never from inside the callbacks.
struct Forward {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Subscriber for Forward {
    fn on_subscribe(&mut self, _subscription: Subscription) {}

    fn on_next(&mut self, chunk: Bytes) -> Demand {
        let _ = self.tx.send(Delivery::Chunk(chunk));
        Demand::none()
    }

    fn on_complete(&mut self, completion: Completion) {
        let _ = self.tx.send(Delivery::Done(completion));
    }
}

/// Cancels the subscription when the fetch future is dropped, e.g. on
/// shutdown.
struct CancelOnDrop(Subscription);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Fetches every configured locator concurrently.
///
/// # Errors
///
/// Fails when the output directory cannot be created or when any fetch
/// failed. Each failure is reported on stderr as it happens.
pub async fn run_all(env: &Arc<FetchEnv>, config: &RunConfig) -> anyhow::Result<()> {
    if let Some(dir) = &config.output_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let targets = targets(&config.locators, config.output_dir.as_deref());
    let total = targets.len();

    let mut fetches = JoinSet::new();
    for (locator, target) in config.locators.iter().cloned().zip(targets) {
        let fetcher = AssetFetcher::new(Arc::clone(env), locator);
        let demand = config.demand;
        fetches.spawn(async move {
            let result = fetch_one(&fetcher, demand, &target).await;
            (fetcher, result)
        });
    }

    let mut failures = 0;
    while let Some(joined) = fetches.join_next().await {
        let (fetcher, result) = joined?;
        match result {
            Ok(_written) => {
                #[cfg(feature = "tracing")]
                tracing::info!(locator = %fetcher.locator(), bytes = _written, "Fetch finished");
            }
            Err(err) => {
                failures += 1;
                eprintln!("{}: {err:#}", fetcher.locator());
            }
        }
    }

    if failures > 0 {
        bail!("{failures} of {total} fetches failed");
    }
    Ok(())
}

/// Streams one asset into `target`, keeping at most `demand` bytes between the
/// source and the writer. Returns the number of bytes written.
pub async fn fetch_one(
    fetcher: &AssetFetcher,
    demand: Demand,
    target: &Target,
) -> anyhow::Result<u64> {
    increment_fetches_started();
    increment_fetches_inflight();
    let started = Instant::now();

    let result = match target {
        Target::Stdout => pump(fetcher, demand, tokio::io::stdout()).await,
        Target::File(path) => pump_to_file(fetcher, demand, path).await,
    };

    decrement_fetches_inflight();
    record_fetch_duration(started.elapsed().as_secs_f64() * 1000.0);
    if result.is_err() {
        increment_fetch_errors();
    }
    result
}

/// Writes into `<path>.part` and renames it into place once the fetch
/// finished, so a failed fetch never leaves a truncated asset behind.
async fn pump_to_file(fetcher: &AssetFetcher, demand: Demand, path: &Path) -> anyhow::Result<u64> {
    let partial = partial_path(path);
    let file = tokio::fs::File::create(&partial)
        .await
        .with_context(|| format!("failed to create {}", partial.display()))?;

    match pump(fetcher, demand, file).await {
        Ok(written) => {
            tokio::fs::rename(&partial, path)
                .await
                .with_context(|| format!("failed to move {} into place", path.display()))?;
            Ok(written)
        }
        Err(err) => {
            let _ = tokio::fs::remove_file(&partial).await;
            Err(err)
        }
    }
}

async fn pump<W>(fetcher: &AssetFetcher, demand: Demand, mut out: W) -> anyhow::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = CancelOnDrop(fetcher.subscribe(Forward { tx }));
    subscription.0.request(demand);

    let mut written = 0u64;
    while let Some(delivery) = rx.recv().await {
        match delivery {
            Delivery::Chunk(chunk) => {
                out.write_all(&chunk).await?;
                written += chunk.len() as u64;
                increment_bytes_delivered(chunk.len() as u64);
                if !demand.is_unbounded() {
                    subscription.0.request(Demand::max(chunk.len()));
                }
            }
            Delivery::Done(completion) => {
                completion.into_result()?;
                out.flush().await?;
                return Ok(written);
            }
        }
    }

    Err(anyhow!("fetch was cancelled before it completed"))
}

/// Maps each locator to its output. Names that collide inside `dir` get a
/// numeric suffix.
pub fn targets(locators: &[Locator], dir: Option<&Path>) -> Vec<Target> {
    let Some(dir) = dir else {
        return locators.iter().map(|_| Target::Stdout).collect();
    };

    let mut taken = HashSet::new();
    locators
        .iter()
        .map(|locator| {
            let base = file_name(locator);
            let mut name = base.clone();
            let mut n = 1;
            while !taken.insert(name.clone()) {
                name = format!("{base}.{n}");
                n += 1;
            }
            Target::File(dir.join(name))
        })
        .collect()
}

/// Last path segment of the locator, falling back to the host (or `asset`)
/// for URLs that end in `/`.
pub fn file_name(locator: &Locator) -> String {
    let name = match locator {
        Locator::File(path) => path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()),
        Locator::Remote(url) => url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .or_else(|| url.host_str().map(str::to_string)),
    };
    name.unwrap_or_else(|| "asset".to_string())
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetflow::FetchConfig;
    use core::time::Duration;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("assetflow-cli-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn names_come_from_the_last_segment() {
        let file = Locator::parse("/var/assets/hero.png").unwrap();
        let remote = Locator::parse("https://cdn.example.com/models/ship.glb?v=2").unwrap();
        let bare = Locator::parse("https://cdn.example.com/").unwrap();

        assert_eq!(file_name(&file), "hero.png");
        assert_eq!(file_name(&remote), "ship.glb");
        assert_eq!(file_name(&bare), "cdn.example.com");
    }

    #[test]
    fn colliding_names_get_a_suffix() {
        let locators = [
            Locator::parse("/a/hero.png").unwrap(),
            Locator::parse("https://cdn.example.com/hero.png").unwrap(),
            Locator::parse("/b/hero.png").unwrap(),
        ];
        let dir = Path::new("/out");

        assert_eq!(
            targets(&locators, Some(dir)),
            vec![
                Target::File(dir.join("hero.png")),
                Target::File(dir.join("hero.png.1")),
                Target::File(dir.join("hero.png.2")),
            ]
        );
        assert_eq!(targets(&locators[..1], None), vec![Target::Stdout]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn writes_file_with_bounded_demand() {
        let dir = scratch_dir("bounded");
        let source = dir.join("source.bin");
        let contents: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&source, &contents).unwrap();

        let env = FetchEnv::init(FetchConfig::default()).unwrap();
        let fetcher = AssetFetcher::new(Arc::clone(&env), source);
        let out = dir.join("copy.bin");

        let written = tokio::time::timeout(
            Duration::from_secs(10),
            fetch_one(&fetcher, Demand::max(1000), &Target::File(out.clone())),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(written, contents.len() as u64);
        assert_eq!(std::fs::read(&out).unwrap(), contents);
        assert!(!partial_path(&out).exists());

        env.shutdown().await;
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_fetch_leaves_nothing_behind() {
        let dir = scratch_dir("missing");
        let env = FetchEnv::init(FetchConfig::default()).unwrap();
        let fetcher = AssetFetcher::new(Arc::clone(&env), dir.join("nope.bin"));
        let out = dir.join("nope.copy");

        let result = fetch_one(&fetcher, Demand::UNBOUNDED, &Target::File(out.clone())).await;

        assert!(result.is_err());
        assert!(!out.exists());
        assert!(!partial_path(&out).exists());

        env.shutdown().await;
        std::fs::remove_dir_all(&dir).ok();
    }
}
