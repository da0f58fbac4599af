//! Recording segment catalog
//!
//! The catalog is the source of truth for which recorded files exist. The
//! SQLite implementation lives in the server crate; this trait is what the
//! Recording Supervisor and the retention sweep talk to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A completed segment about to be registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSegment {
    pub filename: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Exempt from the retention sweep
    pub retain: bool,
}

/// One catalog row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub id: i64,
    pub filename: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub retain: bool,
}

#[async_trait::async_trait]
pub trait SegmentCatalog: Send + Sync {
    /// Register a completed segment.
    async fn insert(&self, segment: NewSegment) -> Result<SegmentRecord, CatalogError>;

    /// Flag a segment for retention. Returns `false` when no row has that filename.
    async fn mark_retained(&self, filename: &str) -> Result<bool, CatalogError>;

    /// Unretained rows created before `cutoff`.
    async fn expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<SegmentRecord>, CatalogError>;

    /// Retained rows, newest first.
    async fn retained(&self) -> Result<Vec<SegmentRecord>, CatalogError>;

    async fn find(&self, filename: &str) -> Result<Option<SegmentRecord>, CatalogError>;

    async fn delete(&self, id: i64) -> Result<(), CatalogError>;
}
