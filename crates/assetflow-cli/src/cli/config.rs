use anyhow::bail;
use assetflow::{Demand, FetchConfig, Locator};
use clap::Parser;
use core::time::Duration;
use std::path::PathBuf;

/// Command-line arguments for the `assetflow` binary.
///
/// Every knob can also be set through the environment (or a `.env` file),
/// which makes the binary easy to drive from scripts and containers.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "assetflow",
    version,
    about = "Fetch local files and HTTP assets with demand-driven streaming"
)]
pub struct CliArgs {
    /// Local paths, `file://` URLs or `http(s)://` URLs to fetch.
    #[arg(required = true)]
    pub locators: Vec<String>,

    /// Directory the fetched assets are written to, one file per locator. When
    /// unset, the single locator is written to stdout.
    ///
    /// Environment variable: `OUTPUT_DIR`
    #[arg(short, long, env = "OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Bytes drained from a source per readiness event.
    ///
    /// Environment variable: `CHUNK_SIZE`
    #[arg(long, env = "CHUNK_SIZE", default_value_t = assetflow::DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Block size used when reading local files.
    ///
    /// Environment variable: `READ_BLOCK_SIZE`
    #[arg(long, env = "READ_BLOCK_SIZE", default_value_t = assetflow::DEFAULT_READ_BLOCK_SIZE)]
    pub read_block_size: usize,

    /// Seconds an HTTP fetch may sit idle waiting for the response or the
    /// next body chunk.
    ///
    /// Environment variable: `REQUEST_TIMEOUT_SECS`
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 60)]
    pub request_timeout_secs: u64,

    /// Maximum number of HTTP fetches in flight at once.
    ///
    /// Environment variable: `MAX_CONCURRENT_FETCHES`
    #[arg(long, env = "MAX_CONCURRENT_FETCHES", default_value_t = assetflow::DEFAULT_MAX_CONCURRENT_FETCHES)]
    pub max_concurrent_fetches: usize,

    /// Refuse HTTP fetches up front while the connectivity probe reports the
    /// network as down.
    ///
    /// Environment variable: `FAIL_FAST_OFFLINE`
    #[arg(long, env = "FAIL_FAST_OFFLINE", default_value_t = true, action = clap::ArgAction::Set)]
    pub fail_fast_offline: bool,

    /// `host:port` probed with a TCP connect to decide whether the network is
    /// up. Without it the network is assumed reachable.
    ///
    /// Example: "1.1.1.1:443"
    ///
    /// Environment variable: `PROBE_ADDR`
    #[arg(long, env = "PROBE_ADDR")]
    pub probe_addr: Option<String>,

    /// Seconds between two connectivity probes.
    ///
    /// Environment variable: `PROBE_INTERVAL_SECS`
    #[arg(long, env = "PROBE_INTERVAL_SECS", default_value_t = 5)]
    pub probe_interval_secs: u64,

    /// Bytes requested per pull, or `unbounded` to take everything as soon as
    /// it is read.
    ///
    /// Environment variable: `DEMAND`
    #[arg(long, env = "DEMAND", default_value = "unbounded")]
    pub demand: String,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub locators: Vec<Locator>,
    pub output_dir: Option<PathBuf>,
    pub fetch: FetchConfig,
    pub probe_addr: Option<String>,
    pub probe_interval: Duration,
    pub demand: Demand,
}

impl TryFrom<CliArgs> for RunConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.output_dir.is_none() && args.locators.len() > 1 {
            bail!("OUTPUT_DIR is required when fetching more than one locator");
        }

        if args.probe_interval_secs == 0 {
            bail!("PROBE_INTERVAL_SECS must be greater than 0");
        }

        let demand = parse_demand(&args.demand)?;

        let locators = args
            .locators
            .iter()
            .map(|raw| Locator::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;

        let fetch = FetchConfig {
            chunk_size: args.chunk_size,
            read_block_size: args.read_block_size,
            request_timeout: Duration::from_secs(args.request_timeout_secs),
            max_concurrent_fetches: args.max_concurrent_fetches,
            fail_fast_offline: args.fail_fast_offline,
            ..FetchConfig::default()
        };
        fetch.validate()?;

        Ok(Self {
            locators,
            output_dir: args.output_dir,
            fetch,
            probe_addr: args.probe_addr,
            probe_interval: Duration::from_secs(args.probe_interval_secs),
            demand,
        })
    }
}

fn parse_demand(raw: &str) -> anyhow::Result<Demand> {
    if raw.eq_ignore_ascii_case("unbounded") {
        return Ok(Demand::UNBOUNDED);
    }
    match raw.parse::<usize>() {
        Ok(0) => bail!("DEMAND must be greater than 0"),
        Ok(n) => Ok(Demand::max(n)),
        Err(_) => bail!("DEMAND must be a byte count or `unbounded`, got {raw:?}"),
    }
}
