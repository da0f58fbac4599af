//! SQLite implementation of the SegmentCatalog trait

use super::db_error;
use camgate_supervisor::{CatalogError, NewSegment, SegmentCatalog, SegmentRecord};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// SQLite-backed video catalog
pub struct SqliteCatalog {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCatalog {
    /// Open (or create) the catalog at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, CatalogError> {
        let conn = Connection::open(db_path).map_err(db_error)?;
        let catalog = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        catalog.init_schema()?;
        Ok(catalog)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> Result<(), CatalogError> {
        let conn = self.lock();

        // timestamp is milliseconds since the Unix epoch
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS videos (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT NOT NULL,
                path TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                retain INTEGER NOT NULL DEFAULT 0
            )
            "#,
            [],
        )
        .map_err(db_error)?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_videos_retention ON videos(retain, timestamp)",
            [],
        )
        .map_err(db_error)?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_videos_filename ON videos(filename)",
            [],
        )
        .map_err(db_error)?;

        info!("Video catalog schema initialized");
        Ok(())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<SegmentRecord> {
        let millis: i64 = row.get(3)?;
        let path: String = row.get(2)?;
        Ok(SegmentRecord {
            id: row.get(0)?,
            filename: row.get(1)?,
            path: PathBuf::from(path),
            created_at: Utc
                .timestamp_millis_opt(millis)
                .single()
                .unwrap_or(DateTime::UNIX_EPOCH),
            retain: row.get::<_, i64>(4)? != 0,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT id, filename, path, timestamp, retain FROM videos";

#[async_trait::async_trait]
impl SegmentCatalog for SqliteCatalog {
    async fn insert(&self, segment: NewSegment) -> Result<SegmentRecord, CatalogError> {
        let conn = self.lock();
        let path = segment.path.to_string_lossy().to_string();
        conn.execute(
            "INSERT INTO videos (filename, path, timestamp, retain) VALUES (?1, ?2, ?3, ?4)",
            params![
                segment.filename,
                path,
                segment.created_at.timestamp_millis(),
                segment.retain as i64
            ],
        )
        .map_err(db_error)?;
        let id = conn.last_insert_rowid();
        debug!("Cataloged {} as id {}", segment.filename, id);

        Ok(SegmentRecord {
            id,
            filename: segment.filename,
            path: segment.path,
            created_at: segment.created_at,
            retain: segment.retain,
        })
    }

    async fn mark_retained(&self, filename: &str) -> Result<bool, CatalogError> {
        let conn = self.lock();
        let changed = conn
            .execute(
                "UPDATE videos SET retain = 1 WHERE filename = ?1",
                params![filename],
            )
            .map_err(db_error)?;
        Ok(changed > 0)
    }

    async fn expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<SegmentRecord>, CatalogError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "{} WHERE retain = 0 AND timestamp < ?1 ORDER BY timestamp ASC",
                SELECT_COLUMNS
            ))
            .map_err(db_error)?;
        let rows = stmt
            .query_map(params![cutoff.timestamp_millis()], Self::from_row)
            .map_err(db_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_error)?;
        Ok(rows)
    }

    async fn retained(&self) -> Result<Vec<SegmentRecord>, CatalogError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "{} WHERE retain = 1 ORDER BY timestamp DESC",
                SELECT_COLUMNS
            ))
            .map_err(db_error)?;
        let rows = stmt
            .query_map([], Self::from_row)
            .map_err(db_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_error)?;
        Ok(rows)
    }

    async fn find(&self, filename: &str) -> Result<Option<SegmentRecord>, CatalogError> {
        let conn = self.lock();
        conn.query_row(
            &format!("{} WHERE filename = ?1 LIMIT 1", SELECT_COLUMNS),
            params![filename],
            Self::from_row,
        )
        .optional()
        .map_err(db_error)
    }

    async fn delete(&self, id: i64) -> Result<(), CatalogError> {
        let conn = self.lock();
        conn.execute("DELETE FROM videos WHERE id = ?1", params![id])
            .map_err(db_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn segment(filename: &str, age_secs: i64, retain: bool) -> NewSegment {
        NewSegment {
            filename: filename.to_string(),
            path: PathBuf::from("/recordings").join(filename),
            created_at: Utc::now() - Duration::seconds(age_secs),
            retain,
        }
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = SqliteCatalog::new(temp_dir.path().join("videos.db")).unwrap();

        let record = catalog.insert(segment("camera1-a.mp4", 0, false)).await.unwrap();
        assert_eq!(record.id, 1);

        let found = catalog.find("camera1-a.mp4").await.unwrap().unwrap();
        assert_eq!(found.id, record.id);
        assert_eq!(found.path, PathBuf::from("/recordings/camera1-a.mp4"));
        assert!(!found.retain);
        assert_eq!(
            found.created_at.timestamp_millis(),
            record.created_at.timestamp_millis()
        );

        assert!(catalog.find("missing.mp4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_retained() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = SqliteCatalog::new(temp_dir.path().join("videos.db")).unwrap();
        catalog.insert(segment("camera1-a.mp4", 0, false)).await.unwrap();

        assert!(catalog.mark_retained("camera1-a.mp4").await.unwrap());
        assert!(!catalog.mark_retained("nope.mp4").await.unwrap());

        let retained = catalog.retained().await.unwrap();
        assert_eq!(retained.len(), 1);
        assert!(retained[0].retain);
    }

    #[tokio::test]
    async fn test_expired_excludes_retained_and_recent() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = SqliteCatalog::new(temp_dir.path().join("videos.db")).unwrap();
        catalog.insert(segment("old.mp4", 3600, false)).await.unwrap();
        catalog.insert(segment("old-kept.mp4", 3600, true)).await.unwrap();
        catalog.insert(segment("fresh.mp4", 5, false)).await.unwrap();

        let cutoff = Utc::now() - Duration::seconds(600);
        let expired = catalog.expired(cutoff).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].filename, "old.mp4");

        catalog.delete(expired[0].id).await.unwrap();
        assert!(catalog.find("old.mp4").await.unwrap().is_none());
        assert!(catalog.find("fresh.mp4").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reopen_keeps_rows() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("videos.db");
        {
            let catalog = SqliteCatalog::new(&db_path).unwrap();
            catalog.insert(segment("camera2-a.mp4", 0, true)).await.unwrap();
        }
        let catalog = SqliteCatalog::new(&db_path).unwrap();
        assert_eq!(catalog.retained().await.unwrap().len(), 1);
    }
}
