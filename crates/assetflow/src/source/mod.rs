//! Push-style byte sources.
//!
//! A [`StreamSource`] acquires bytes asynchronously and announces progress by
//! raising [`Event`]s on its owning [`AssetQueue`](crate::AssetQueue). Each
//! source raises at most one [`Event::Opened`], then zero or more
//! [`Event::BytesAvailable`], then exactly one of [`Event::EndReached`] or
//! [`Event::Errored`]. Nothing is raised after that, and nothing is raised
//! once [`close`](StreamSource::close) has been called.
//!
//! ## Implementations
//!
//! - [`FileStreamSource`] - a local file, read block by block.
//! - [`NetworkStreamSource`] - a streaming HTTP download.

mod file;
mod network;

pub use file::{FileReadStream, FileStreamSource};
pub use network::{
    DataTask, FetchRequest, HttpTransport, NetworkStreamSource, ReqwestTransport, TaskEvents,
    TaskId, TaskRegistry, TaskState, TransportSink,
};

use crate::{FetchError, error::contract_violation};
use bytes::Bytes;
use std::sync::Weak;

/// Lifecycle of a [`StreamSource`].
///
/// Transitions only move forward, except that any non-terminal state may move
/// to [`StreamState::Error`]. [`StreamState::Closed`] and
/// [`StreamState::Error`] are terminal and exclusive: a closed source never
/// errors and an errored source never reports closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamState {
    NotOpen,
    Opening,
    Open,
    /// Bytes are being pulled from the underlying resource or are waiting to
    /// be drained.
    Reading,
    AtEnd,
    Closed,
    Error(FetchError),
}

impl StreamState {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Error(_))
    }

    /// Whether moving from `self` to `next` respects the lifecycle.
    ///
    /// Staying in the same non-terminal state is allowed.
    pub fn can_transition_to(&self, next: &Self) -> bool {
        use StreamState::{AtEnd, Closed, Error, NotOpen, Open, Opening, Reading};

        match (self, next) {
            (Closed | Error(_), _) => false,
            (_, Error(_) | Closed) => true,
            (NotOpen, Opening)
            | (Opening, Open)
            | (Open, Reading)
            | (Reading, Open)
            | (Open | Reading, AtEnd) => true,
            (a, b) => a == b,
        }
    }

    /// Moves `self` to `next`, reporting a contract violation and keeping the
    /// current state if the move is not allowed.
    ///
    /// Returns whether the transition happened.
    #[track_caller]
    pub(crate) fn advance(&mut self, next: Self) -> bool {
        if self.can_transition_to(&next) {
            *self = next;
            true
        } else {
            contract_violation("invalid stream state transition");
            false
        }
    }
}

/// Notifications raised by a [`StreamSource`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Opened,
    /// The source went from having nothing buffered to having bytes ready.
    BytesAvailable,
    EndReached,
    Errored(FetchError),
}

/// Receiver of [`Event`]s. Always invoked on the source's
/// [`AssetQueue`](crate::AssetQueue).
pub trait StreamDelegate: Send + Sync {
    fn handle_event(&self, event: Event);
}

/// Non-owning link from a source back to its delegate.
pub type DelegateRef = Weak<dyn StreamDelegate>;

/// The contract shared by the file and network backends.
///
/// No method blocks. `read`, `peek` and `has_available` must be called from
/// the owning [`AssetQueue`](crate::AssetQueue).
pub trait StreamSource: Send + Sync {
    /// Begins asynchronous acquisition. Results in [`Event::Opened`] or
    /// [`Event::Errored`].
    fn open(&self);

    /// Returns between `0` and `max_len` bytes that are buffered right now.
    fn read(&self, max_len: usize) -> Bytes;

    fn has_available(&self) -> bool;

    /// A read-only view of the bytes buffered right now, without consuming
    /// them. Sources that cannot expose their buffer return `None`.
    fn peek(&self) -> Option<Bytes> {
        None
    }

    /// Stops event delivery and releases the underlying resource.
    ///
    /// Idempotent, and valid from any state.
    fn close(&self);

    fn state(&self) -> StreamState;

    fn error(&self) -> Option<FetchError> {
        match self.state() {
            StreamState::Error(err) => Some(err),
            _ => None,
        }
    }
}
