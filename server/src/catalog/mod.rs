//! Video catalog persistence
//!
//! The [`SegmentCatalog`](camgate_supervisor::SegmentCatalog) trait lives in
//! the supervisor crate; this module provides the SQLite-backed store.

pub mod sqlite;

pub use sqlite::SqliteCatalog;

use camgate_supervisor::CatalogError;

/// `rusqlite` errors surface as catalog database errors.
pub(crate) fn db_error(e: rusqlite::Error) -> CatalogError {
    CatalogError::Database(e.to_string())
}
