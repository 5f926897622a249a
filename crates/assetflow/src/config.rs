use crate::{FetchError, Result};
use core::time::Duration;

/// Default number of bytes drained from a source per readiness event.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Default block size the local file reader pulls from disk at a time.
pub const DEFAULT_READ_BLOCK_SIZE: usize = 16 * 1024;

/// Default timeout for a single network request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default cap on concurrently running network fetches.
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 4;

/// Tunables shared by every fetch issued from one [`FetchEnv`].
///
/// [`FetchEnv`]: crate::FetchEnv
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    /// Bytes drained from a source per readiness event when it cannot report
    /// how much it has buffered, and the size of the pulls issued by
    /// [`ChunkStream`](crate::ChunkStream).
    pub chunk_size: usize,
    /// Block size of the local file reader.
    pub read_block_size: usize,
    /// Idle timeout of the HTTP transport: how long it waits for the response
    /// or for the next body chunk. Also bounds connection setup.
    pub request_timeout: Duration,
    /// Maximum number of network fetches in flight at once.
    pub max_concurrent_fetches: usize,
    /// Fail network fetches immediately with [`FetchError::NotReachable`] when
    /// the connectivity signal is down.
    pub fail_fast_offline: bool,
    /// `User-Agent` header sent with every request.
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_block_size: DEFAULT_READ_BLOCK_SIZE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            fail_fast_offline: true,
            user_agent: concat!("assetflow/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl FetchConfig {
    /// Checks that every knob is usable.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(FetchError::InvalidConfig("chunk_size must be greater than 0"));
        }
        if self.read_block_size == 0 {
            return Err(FetchError::InvalidConfig("read_block_size must be greater than 0"));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(FetchError::InvalidConfig("max_concurrent_fetches must be greater than 0"));
        }
        if self.request_timeout.is_zero() {
            return Err(FetchError::InvalidConfig("request_timeout must be greater than 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = FetchConfig::default();
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.max_concurrent_fetches, 4);
        assert!(config.fail_fast_offline);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let config = FetchConfig {
            chunk_size: 0,
            ..FetchConfig::default()
        };
        assert!(config.validate().is_err());

        let config = FetchConfig {
            max_concurrent_fetches: 0,
            ..FetchConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
