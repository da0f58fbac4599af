use crate::RecordingFile;
use chrono::{DateTime, Utc};
use std::io;
use std::path::Path;
use tokio_stream::wrappers::ReadDirStream;
use tokio_stream::StreamExt;

/// `.mp4` files in the recordings directory, newest first.
pub async fn list_recordings(dir: &Path) -> io::Result<Vec<RecordingFile>> {
    let mut recordings = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => ReadDirStream::new(entries),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(recordings),
        Err(e) => return Err(e),
    };

    while let Some(entry) = entries.next().await {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("mp4") {
            continue;
        }
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let Some(filename) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        recordings.push(RecordingFile {
            url: format!("/recordings/{}", filename),
            filename,
            size: metadata.len(),
            modified,
        });
    }

    // Sort by modification time, newest first
    recordings.sort_by(|a, b| b.modified.cmp(&a.modified));
    Ok(recordings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_lists_only_mp4() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("camera1-a.mp4"), b"1234").unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::create_dir(temp_dir.path().join("nested.mp4")).unwrap();

        let files = list_recordings(temp_dir.path()).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].filename, "camera1-a.mp4");
        assert_eq!(files[0].size, 4);
        assert_eq!(files[0].url, "/recordings/camera1-a.mp4");
    }

    #[tokio::test]
    async fn test_missing_dir_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let files = list_recordings(&temp_dir.path().join("nope")).await.unwrap();
        assert!(files.is_empty());
    }
}
