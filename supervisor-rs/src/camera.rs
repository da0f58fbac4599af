//! Camera identity and ingest stream-path parsing

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable key identifying a logical camera (the ingest stream name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(String);

impl CameraId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Camera names end up in file names and URLs, so only a conservative
    /// character set is accepted.
    pub fn is_valid_name(name: &str) -> bool {
        !name.is_empty()
            && name.len() <= 64
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CameraId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl AsRef<str> for CameraId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Role a supervised subprocess plays for a camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamRole {
    Hls,
    Recording,
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamRole::Hls => f.write_str("hls"),
            StreamRole::Recording => f.write_str("recording"),
        }
    }
}

/// Extract the camera name from an ingest stream path.
///
/// Accepts `/live/camera1`, `live/camera1`, `rtmp://host:1935/live/camera1`
/// and tolerates a trailing query string (`/live/camera1?key=...`). The camera
/// is the path segment right after `app`.
pub fn parse_stream_path(stream_path: &str, app: &str) -> Option<CameraId> {
    let without_scheme = match stream_path.find("://") {
        Some(idx) => {
            let rest = &stream_path[idx + 3..];
            // Drop the authority part
            rest.find('/').map(|slash| &rest[slash..]).unwrap_or("")
        }
        None => stream_path,
    };

    let path = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or_default();

    let mut segments = path.split('/').filter(|s| !s.is_empty());
    while let Some(segment) = segments.next() {
        if segment == app {
            let name = segments.next()?;
            return CameraId::is_valid_name(name).then(|| CameraId::new(name));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stream_path_variants() {
        assert_eq!(parse_stream_path("/live/camera1", "live"), Some("camera1".into()));
        assert_eq!(parse_stream_path("live/camera2", "live"), Some("camera2".into()));
        assert_eq!(
            parse_stream_path("rtmp://10.0.0.5:1935/live/camera3", "live"),
            Some("camera3".into())
        );
        assert_eq!(
            parse_stream_path("/live/camera4?token=abc", "live"),
            Some("camera4".into())
        );
    }

    #[test]
    fn test_parse_stream_path_rejects_wrong_app_or_bad_name() {
        assert_eq!(parse_stream_path("/vod/camera1", "live"), None);
        assert_eq!(parse_stream_path("/live/", "live"), None);
        assert_eq!(parse_stream_path("/live/../etc", "live"), None);
    }
}
