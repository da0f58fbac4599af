//! Locating and validating the external ffmpeg binary

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

const WELL_KNOWN_LOCATIONS: &[&str] = &[
    "/usr/bin/ffmpeg",
    "/usr/local/bin/ffmpeg",
    "/opt/homebrew/bin/ffmpeg",
    "/snap/bin/ffmpeg",
];

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("ffmpeg not found (looked at {searched:?} and PATH)")]
    NotFound { searched: Vec<PathBuf> },

    #[error("failed to run {path}: {source}")]
    Run {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} {arg} timed out")]
    Timeout { path: PathBuf, arg: &'static str },

    #[error("{path} {arg} exited with {code:?}")]
    Failed {
        path: PathBuf,
        arg: &'static str,
        code: Option<i32>,
    },
}

/// Result of running `-version` and `-codecs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInfo {
    pub path: PathBuf,
    pub version: String,
    pub has_h264: bool,
    pub has_aac: bool,
}

fn executable_name() -> &'static str {
    if cfg!(windows) {
        "ffmpeg.exe"
    } else {
        "ffmpeg"
    }
}

fn search_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Resolve the ffmpeg executable: an explicitly configured path wins, then
/// `PATH`, then the usual install locations.
pub fn locate_ffmpeg(configured: Option<&Path>) -> Result<PathBuf, ToolError> {
    let mut searched = Vec::new();
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        // A bare name like "ffmpeg" is resolved through PATH below
        if path.components().count() > 1 {
            warn!("Configured ffmpeg {:?} does not exist, searching", path);
        }
        searched.push(path.to_path_buf());
    }

    let name = configured
        .filter(|p| p.components().count() == 1)
        .and_then(|p| p.to_str())
        .unwrap_or(executable_name());
    if let Some(found) = search_path(name) {
        return Ok(found);
    }

    for location in WELL_KNOWN_LOCATIONS {
        let candidate = PathBuf::from(location);
        if candidate.is_file() {
            return Ok(candidate);
        }
        searched.push(candidate);
    }
    Err(ToolError::NotFound { searched })
}

async fn run(path: &Path, arg: &'static str) -> Result<String, ToolError> {
    let output = Command::new(path)
        .arg("-hide_banner")
        .arg(arg)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(PROBE_TIMEOUT, output)
        .await
        .map_err(|_| ToolError::Timeout {
            path: path.to_path_buf(),
            arg,
        })?
        .map_err(|source| ToolError::Run {
            path: path.to_path_buf(),
            source,
        })?;
    if !output.status.success() {
        return Err(ToolError::Failed {
            path: path.to_path_buf(),
            arg,
            code: output.status.code(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Whether a `-codecs` listing has an encoder or decoder named `codec`.
pub fn lists_codec(codecs: &str, codec: &str) -> bool {
    codecs.lines().any(|line| {
        let mut fields = line.split_whitespace();
        // " DEV.LS h264  H.264 / AVC ..."
        matches!((fields.next(), fields.next()), (Some(flags), Some(name))
            if flags.len() == 6 && name == codec)
    })
}

/// Run the binary once to make sure it works. Missing codecs only warn.
pub async fn probe_ffmpeg(path: &Path) -> Result<ToolInfo, ToolError> {
    let version_output = run(path, "-version").await?;
    let version = version_output
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();

    let codecs = run(path, "-codecs").await?;
    let info = ToolInfo {
        path: path.to_path_buf(),
        version,
        has_h264: lists_codec(&codecs, "h264"),
        has_aac: lists_codec(&codecs, "aac"),
    };

    info!("🎞️  Using {} ({:?})", info.version, info.path);
    if !info.has_h264 {
        warn!("⚠️  ffmpeg at {:?} lacks h264; transcoding fallback will fail", info.path);
    }
    if !info.has_aac {
        warn!("⚠️  ffmpeg at {:?} lacks aac; audio re-encode will fail", info.path);
    }
    Ok(info)
}
