//! gharchive ingest library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Exactly-once ingestion of hourly GH Archive payloads (gzip-compressed,
//! newline-delimited JSON) into a document store.
//!
//! - **archive**: local cache, streaming download and line reader
//! - **engine**: per-unit ingestion with fallback routing and rollback
//! - **store**: primary store, fallback store and ledger interfaces with
//!   PostgreSQL/S3 and in-memory implementations
//! - **drivers**: sequential day, month and year batches
//!
//! # Example
//!
//! ```no_run
//! use gharchive_ingest::archive::ArchiveSource;
//! use gharchive_ingest::config::IngestConfig;
//! use gharchive_ingest::engine::Ingestor;
//! use gharchive_ingest::store::memory::{MemoryFallbackStore, MemoryLedger, MemoryPrimaryStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> gharchive_ingest::Result<()> {
//!     let config = IngestConfig::load(None)?;
//!     let ingestor = Ingestor::new(
//!         ArchiveSource::new(&config.archive)?,
//!         Arc::new(MemoryPrimaryStore::new()),
//!         Arc::new(MemoryFallbackStore::new()),
//!         Arc::new(MemoryLedger::new()),
//!         config.engine,
//!     );
//!
//!     let date = chrono::NaiveDate::from_ymd_opt(2015, 1, 1).unwrap_or_default();
//!     println!("{}", ingestor.ingest_unit(date, 15).await);
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod config;
pub mod drivers;
pub mod engine;
pub mod error;
pub mod store;
pub mod unit;

pub use engine::{IngestReport, Ingestor};
pub use error::{IngestError, Result};
pub use unit::{Outcome, Unit};
