//! Codec-fallback detection over ffmpeg diagnostic output
//!
//! Everything here is a pure function of its inputs so the retry policy can be
//! exercised without spawning a process.

use serde::{Deserialize, Serialize};

/// How the live preview re-muxes the incoming stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Re-package without re-encoding (`-c:v copy`)
    DirectCopy,
    /// Re-encode video to H.264 (`-c:v libx264`)
    Transcode,
}

impl Strategy {
    pub fn is_transcoding(self) -> bool {
        matches!(self, Strategy::Transcode)
    }
}

/// Outcome of inspecting one diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    SwitchToFallback,
    FatalError,
}

/// Lines meaning the input video codec cannot be copied into the output container.
const CODEC_FAILURE_MARKERS: &[&str] = &[
    "Could not find tag for codec",
    "codec not currently supported in container",
    "Codec not currently supported in container",
    "Unsupported codec with id",
];

/// Lines meaning the input or output is gone for good.
const FATAL_MARKERS: &[&str] = &[
    "Connection refused",
    "Connection reset by peer",
    "Input/output error",
    "Broken pipe",
    "Server returned 404 Not Found",
    "Error opening input",
];

/// Fatal only when reported against the ingest input; the HLS muxer prints
/// the same errors for housekeeping such as deleting an expired segment.
const INPUT_FATAL_MARKERS: &[&str] = &["No such file or directory", "Permission denied"];

/// Prefix of input URLs in ffmpeg's `<url>: <error>` lines.
const INPUT_URL_PREFIX: &str = "rtmp://";

/// ffmpeg exit statuses that indicate a codec the copy path cannot handle
/// (`AVERROR(ENOSYS)` as a raw and as a wrapped unix status, and
/// `AVERROR_PATCHWELCOME`).
pub const FALLBACK_EXIT_CODES: &[i32] = &[-38, 218, -1163346256];

/// Whether a line reports the "Video codec ... is not implemented" failure
/// or one of its container-level siblings.
pub fn is_codec_failure(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    if lower.contains("video codec") && lower.contains("is not implemented") {
        return true;
    }
    CODEC_FAILURE_MARKERS.iter().any(|m| line.contains(m))
}

pub fn is_fatal(line: &str) -> bool {
    if FATAL_MARKERS.iter().any(|m| line.contains(m)) {
        return true;
    }
    line.trim_start().starts_with(INPUT_URL_PREFIX)
        && INPUT_FATAL_MARKERS.iter().any(|m| line.contains(m))
}

/// Classify one diagnostic line for a process running with `strategy`.
///
/// A codec failure while already transcoding is fatal, which is what keeps the
/// fallback from looping.
pub fn inspect(line: &str, strategy: Strategy) -> Decision {
    if is_codec_failure(line) {
        return match strategy {
            Strategy::DirectCopy => Decision::SwitchToFallback,
            Strategy::Transcode => Decision::FatalError,
        };
    }
    if is_fatal(line) {
        return Decision::FatalError;
    }
    Decision::Continue
}

/// Whether an exit status from a copy-mode process warrants one transcoding retry.
pub fn exit_needs_fallback(code: Option<i32>, strategy: Strategy) -> bool {
    match (strategy, code) {
        (Strategy::DirectCopy, Some(code)) => FALLBACK_EXIT_CODES.contains(&code),
        _ => false,
    }
}
