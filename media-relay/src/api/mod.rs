//! REST API: streamed downloads, their status and the logging filter.

pub mod error;
pub mod routes;
pub mod server;

pub use server::{ApiServer, ApiServerConfig, AppState};
