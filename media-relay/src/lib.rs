//! media-relay library crate.
//!
//! Resumable, progress-tracked transcoding of remote media, streamed to
//! HTTP clients. The binary in `main.rs` wires these pieces together.

pub mod api;
pub mod config;
pub mod download;
pub mod error;
pub mod logging;
pub mod pipeline;
#[doc(hidden)]
pub mod testing;
pub mod utils;

pub use error::{Error, Result};
