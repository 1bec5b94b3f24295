//! prodsync common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging setup, and error handling for the prodsync workspace.
//!
//! - **Error Handling**: [`SyncError`] and the [`Result`] alias
//! - **Logging**: [`logging::LogConfig`] and [`logging::init_logging`]
//! - **Types**: source precedence ([`SourceRank`]) and the canonical wire shape
//!
//! # Example
//!
//! ```
//! use prodsync_common::SourceRank;
//!
//! assert!(SourceRank::Catalog > SourceRank::Enrichment);
//! assert!(SourceRank::Enrichment > SourceRank::Identity);
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{Result, SyncError};
pub use types::{normalize_id, SourceRank, WireRecord, ID_FIELD};
