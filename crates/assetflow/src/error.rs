//! Error types for asset fetching.
//!
//! Every failure a [`StreamSource`] can run into surfaces to the consumer as a
//! single terminal [`Completion::Failed`] carrying one of these variants.
//! Nothing is retried locally; callers re-issue a fresh fetch to retry.
//!
//! ## Error Cases
//! - `NotReachable`: the connectivity signal reported the network as down.
//! - `HttpStatus`: the server answered with a status other than `200`.
//! - `Transport`: the HTTP transport failed mid-flight (DNS, TLS, timeout...).
//! - `FileNotFound`: the local path does not exist.
//! - `Io`: any other local I/O failure.
//! - `ContractViolation`: an internal invariant was broken. Debug builds abort
//!   on these; release builds absorb them as no-ops.
//! - `InvalidLocator`: the locator is neither a local path nor an HTTP(S) URL.
//! - `InvalidConfig`: a configuration knob is out of range.
//! - `Shutdown`: the environment shut down before the fetch completed.
//!
//! [`StreamSource`]: crate::source::StreamSource
//! [`Completion::Failed`]: crate::subscription::Completion::Failed

use std::path::PathBuf;

pub type Result<T> = core::result::Result<T, FetchError>;

/// Unified error type for asset fetching.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum FetchError {
    /// The connectivity signal reported the network as unavailable, so no
    /// request was attempted.
    #[error("Network is not reachable")]
    NotReachable,

    /// The server responded with a non-200 status code.
    #[error("Failed to connect: status code {0}")]
    HttpStatus(u16),

    /// The HTTP transport failed before the body completed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The local file does not exist.
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// A local I/O operation failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// An internal contract was broken (event after close, double terminal
    /// completion, ...).
    #[error("Contract violation: {0}")]
    ContractViolation(&'static str),

    /// The locator could not be classified as a file path or an HTTP(S) URL.
    #[error("Invalid locator: {0}")]
    InvalidLocator(String),

    /// A [`FetchConfig`](crate::FetchConfig) knob is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// The [`FetchEnv`](crate::FetchEnv) shut down while the fetch was still
    /// running, or before it started.
    #[error("Fetch environment shut down")]
    Shutdown,
}

impl FetchError {
    /// Maps an I/O error raised while touching `path`.
    pub(crate) fn from_io(path: &std::path::Path, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::FileNotFound(path.to_path_buf()),
            _ => Self::Io(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::HttpStatus(status.as_u16()),
            None => Self::Transport(err.to_string()),
        }
    }
}

/// Reports a broken internal contract.
///
/// Aborts in debug builds so the bug is caught where it happens. Release
/// builds log the violation and carry on; the caller must treat the offending
/// operation as a no-op.
#[track_caller]
pub(crate) fn contract_violation(what: &'static str) {
    #[cfg(feature = "tracing")]
    tracing::error!("{}", FetchError::ContractViolation(what));
    debug_assert!(false, "contract violation: {what}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_not_found_maps_to_file_not_found() {
        let path = std::path::Path::new("/definitely/missing.jpg");
        let err = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(
            FetchError::from_io(path, &err),
            FetchError::FileNotFound(path.to_path_buf())
        );
    }

    #[test]
    fn other_io_errors_keep_their_detail() {
        let path = std::path::Path::new("/tmp/x");
        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(
            FetchError::from_io(path, &err),
            FetchError::Io("nope".to_string())
        );
    }

    #[test]
    fn http_status_display_carries_the_code() {
        assert_eq!(
            FetchError::HttpStatus(404).to_string(),
            "Failed to connect: status code 404"
        );
    }
}
