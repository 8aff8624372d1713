//! gharchive common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling, logging setup and checksum helpers for the
//! gharchive workspace members.
//!
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Logging**: `tracing` subscriber configuration driven by `LOG_*` variables
//! - **Checksums**: SHA-256 digests recorded alongside fallback blobs
//!
//! # Example
//!
//! ```no_run
//! use gharchive_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> gharchive_common::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!("logging ready");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
