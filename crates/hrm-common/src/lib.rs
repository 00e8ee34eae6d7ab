//! HRM Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, error handling, and logging for the HRM migration workspace.
//!
//! # Overview
//!
//! - **Types**: the three record shapes (departments, jobs, hired employees),
//!   the tagged [`types::Record`] union and the raw per-kind input records
//! - **Rejections**: the business-rule rejection taxonomy returned by validation
//! - **Error Handling**: [`HrmError`] and the [`Result`] alias
//! - **Logging**: `tracing` subscriber setup
//!
//! # Example
//!
//! ```no_run
//! use hrm_common::types::{RawRecord, TableKind};
//!
//! fn parse(table: &str, payload: &serde_json::Value) -> hrm_common::Result<RawRecord> {
//!     let kind: TableKind = table.parse()?;
//!     RawRecord::from_payload(kind, payload)
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{HrmError, Result};
