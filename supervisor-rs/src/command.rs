//! ffmpeg argument builders for the live preview and segment capture

use crate::detector::Strategy;
use std::path::Path;

/// Playlist file name inside each camera's live directory.
pub const PLAYLIST_NAME: &str = "index.m3u8";

#[derive(Debug, Clone)]
pub struct HlsCommandBuilder {
    input_url: String,
    output_dir: String,
    strategy: Strategy,
    hls_time: u32,
    hls_list_size: u32,
    framerate: u32,
    rw_timeout_us: u64,
}

impl HlsCommandBuilder {
    pub fn new(input_url: impl Into<String>, output_dir: &Path) -> Self {
        Self {
            input_url: input_url.into(),
            output_dir: output_dir.to_string_lossy().to_string(),
            strategy: Strategy::DirectCopy,
            hls_time: 2,
            hls_list_size: 3,
            framerate: 25,
            rw_timeout_us: 10_000_000,
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_playlist_window(mut self, hls_time: u32, hls_list_size: u32) -> Self {
        self.hls_time = hls_time;
        self.hls_list_size = hls_list_size;
        self
    }

    pub fn with_framerate(mut self, framerate: u32) -> Self {
        self.framerate = framerate;
        self
    }

    pub fn build(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "warning".into(),
            "-rw_timeout".into(),
            self.rw_timeout_us.to_string(),
            "-i".into(),
            self.input_url.clone(),
        ];

        match self.strategy {
            Strategy::DirectCopy => {
                args.extend(["-c:v".into(), "copy".into()]);
            }
            Strategy::Transcode => {
                args.extend([
                    "-c:v".into(),
                    "libx264".into(),
                    "-preset".into(),
                    "veryfast".into(),
                    "-tune".into(),
                    "zerolatency".into(),
                    "-pix_fmt".into(),
                    "yuv420p".into(),
                    "-g".into(),
                    (self.framerate * 2).to_string(),
                ]);
            }
        }

        args.extend([
            "-c:a".into(),
            "aac".into(),
            "-ac".into(),
            "1".into(),
            "-ar".into(),
            "44100".into(),
            "-b:a".into(),
            "96k".into(),
            "-f".into(),
            "hls".into(),
            "-hls_time".into(),
            self.hls_time.to_string(),
            "-hls_list_size".into(),
            self.hls_list_size.to_string(),
            "-hls_flags".into(),
            "delete_segments+omit_endlist".into(),
            "-hls_allow_cache".into(),
            "0".into(),
            format!("{}/{}", self.output_dir.trim_end_matches('/'), PLAYLIST_NAME),
        ]);
        args
    }
}

/// Fixed-duration capture of the ingest stream into one MP4 file.
#[derive(Debug, Clone)]
pub struct SegmentCommandBuilder {
    input_url: String,
    output_path: String,
    duration_secs: u64,
}

impl SegmentCommandBuilder {
    pub fn new(input_url: impl Into<String>, output_path: &Path) -> Self {
        Self {
            input_url: input_url.into(),
            output_path: output_path.to_string_lossy().to_string(),
            duration_secs: 60,
        }
    }

    pub fn with_duration(mut self, secs: u64) -> Self {
        self.duration_secs = secs;
        self
    }

    pub fn build(&self) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "warning".into(),
            "-i".into(),
            self.input_url.clone(),
            "-c".into(),
            "copy".into(),
            "-f".into(),
            "mp4".into(),
            "-t".into(),
            self.duration_secs.to_string(),
            "-y".into(),
            self.output_path.clone(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(|s| s.as_str())
    }

    #[test]
    fn test_hls_copy_defaults() {
        let args = HlsCommandBuilder::new("rtmp://127.0.0.1:1935/live/camera1", Path::new("/media/live/camera1/")).build();

        assert_eq!(value_after(&args, "-i"), Some("rtmp://127.0.0.1:1935/live/camera1"));
        assert_eq!(value_after(&args, "-c:v"), Some("copy"));
        assert_eq!(value_after(&args, "-hls_time"), Some("2"));
        assert_eq!(value_after(&args, "-hls_list_size"), Some("3"));
        assert_eq!(value_after(&args, "-hls_flags"), Some("delete_segments+omit_endlist"));
        assert_eq!(args.last().unwrap(), "/media/live/camera1/index.m3u8");
        assert!(!args.iter().any(|a| a == "libx264"));
    }

    #[test]
    fn test_hls_transcode() {
        let args = HlsCommandBuilder::new("rtmp://x/live/c", Path::new("/tmp/c"))
            .with_strategy(Strategy::Transcode)
            .with_framerate(15)
            .with_playlist_window(4, 5)
            .build();

        assert_eq!(value_after(&args, "-c:v"), Some("libx264"));
        assert_eq!(value_after(&args, "-g"), Some("30"));
        assert_eq!(value_after(&args, "-hls_time"), Some("4"));
        assert_eq!(value_after(&args, "-hls_list_size"), Some("5"));
    }

    #[test]
    fn test_segment_capture() {
        let args = SegmentCommandBuilder::new("rtmp://x/live/c", Path::new("/rec/c-1.mp4"))
            .with_duration(45)
            .build();

        assert_eq!(value_after(&args, "-c"), Some("copy"));
        assert_eq!(value_after(&args, "-t"), Some("45"));
        assert_eq!(args.last().unwrap(), "/rec/c-1.mp4");
    }
}
