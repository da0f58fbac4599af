//! HLS output directories
//!
//! The set of segment and playlist files is never tracked in memory; it is
//! inferred from a directory listing whenever somebody asks.

use serde::Serialize;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Summary of one camera's live directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HlsOutputStats {
    pub total_files: usize,
    pub ts_files: usize,
    pub m3u8_files: usize,
    /// Files modified within the freshness window
    pub recent_files: usize,
    pub has_recent_activity: bool,
    #[serde(skip)]
    pub newest_age: Option<Duration>,
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ext)
}

/// Count files in `dir`. A missing directory is simply empty.
pub async fn output_stats(dir: &Path, recent_window: Duration) -> io::Result<HlsOutputStats> {
    let mut stats = HlsOutputStats::default();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(stats),
        Err(e) => return Err(e),
    };

    let now = SystemTime::now();
    while let Some(entry) = entries.next_entry().await? {
        let metadata = match entry.metadata().await {
            Ok(m) if m.is_file() => m,
            // Raced with ffmpeg's delete_segments
            _ => continue,
        };
        let path = entry.path();
        stats.total_files += 1;
        if has_extension(&path, "ts") {
            stats.ts_files += 1;
        } else if has_extension(&path, "m3u8") {
            stats.m3u8_files += 1;
        }

        if let Ok(modified) = metadata.modified() {
            let age = now.duration_since(modified).unwrap_or_default();
            if age <= recent_window {
                stats.recent_files += 1;
            }
            stats.newest_age = Some(stats.newest_age.map_or(age, |newest| newest.min(age)));
        }
    }
    stats.has_recent_activity = stats.recent_files > 0;
    Ok(stats)
}

/// Remove every file in `dir`, leaving the directory itself. Returns the
/// number of files removed.
pub async fn clear_dir(dir: &Path) -> io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        match entry.file_type().await {
            Ok(ft) if ft.is_file() => {}
            _ => continue,
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {:?}: {}", path, e),
        }
    }
    debug!("Cleared {} files from {:?}", removed, dir);
    Ok(removed)
}

/// Remove `.ts` and `.m3u8` files from every camera directory under `root`.
pub async fn wipe_hls_root(root: &Path) -> io::Result<usize> {
    let mut cameras = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(camera_dir) = cameras.next_entry().await? {
        if !camera_dir.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let mut files = tokio::fs::read_dir(camera_dir.path()).await?;
        while let Some(file) = files.next_entry().await? {
            let path = file.path();
            if has_extension(&path, "ts") || has_extension(&path, "m3u8") {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Failed to remove {:?}: {}", path, e),
                }
            }
        }
    }
    Ok(removed)
}
