#![doc = include_str!("../README.md")]

mod buffer;
mod config;
mod connectivity;
mod demand;
mod env;
mod error;
mod fetcher;
mod queue;
pub mod source;
pub mod subscription;

pub use crate::buffer::*;
pub use crate::config::*;
pub use crate::connectivity::*;
pub use crate::demand::*;
pub use crate::env::*;
pub use crate::error::{FetchError, Result};
pub use crate::fetcher::*;
pub use crate::queue::*;
pub use crate::subscription::{ChunkStream, Completion, Subscriber, Subscription};
