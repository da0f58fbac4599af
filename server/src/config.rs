//! Environment configuration
//!
//! Every setting has a default; `CAMGATE_*` variables override them. A few
//! legacy names (`PORT`, `RTMP_PORT`, `HTTP_PORT`) are honoured as fallbacks.

use camgate_supervisor::{CameraId, HlsConfig, MonitorConfig, RecordingConfig};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CAMERAS: &[&str] = &["camera1", "camera2", "camera3", "camera4", "camera5", "camera6"];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: String, value: String },

    #[error("invalid camera name {0:?}")]
    InvalidCamera(String),

    #[error("no cameras configured")]
    NoCameras,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: IpAddr,
    pub api_port: u16,
    pub rtmp_host: String,
    pub rtmp_port: u16,
    pub rtmp_app: String,
    pub http_port: u16,
    pub storage_dir: PathBuf,
    pub cameras: Vec<CameraId>,
    /// Explicit ffmpeg path; discovered when unset
    pub ffmpeg: Option<PathBuf>,
    pub segment_duration: Duration,
    pub retention: Duration,
    pub sweep_interval: Duration,
    pub health_interval: Duration,
    pub stop_grace: Duration,
    pub cleanup_debounce: Duration,
    pub hls_time: u32,
    pub hls_list_size: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::from([127, 0, 0, 1]),
            api_port: 3000,
            rtmp_host: "127.0.0.1".to_string(),
            rtmp_port: 1935,
            rtmp_app: "live".to_string(),
            http_port: 8000,
            storage_dir: PathBuf::from("./camgate-storage"),
            cameras: DEFAULT_CAMERAS.iter().map(|c| CameraId::from(*c)).collect(),
            ffmpeg: None,
            segment_duration: Duration::from_secs(60),
            retention: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            health_interval: Duration::from_secs(30),
            stop_grace: Duration::from_millis(3000),
            cleanup_debounce: Duration::from_millis(1000),
            hls_time: 2,
            hls_list_size: 3,
        }
    }
}

/// Variable lookup, so tests need not touch the process environment.
struct Vars<F: Fn(&str) -> Option<String>>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn get(&self, keys: &[&str]) -> Option<(String, String)> {
        keys.iter().find_map(|key| {
            (self.0)(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(|v| (key.to_string(), v))
        })
    }

    fn parse<T: FromStr>(&self, keys: &[&str], default: T) -> Result<T, ConfigError> {
        match self.get(keys) {
            Some((key, value)) => value
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value }),
            None => Ok(default),
        }
    }

    fn secs(&self, keys: &[&str], default: Duration) -> Result<Duration, ConfigError> {
        self.parse(keys, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, keys: &[&str], default: Duration) -> Result<Duration, ConfigError> {
        self.parse(keys, default.as_millis() as u64)
            .map(Duration::from_millis)
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(lookup);
        let d = Self::default();

        let cameras = match vars.get(&["CAMGATE_CAMERAS"]) {
            Some((_, list)) => parse_cameras(&list)?,
            None => d.cameras,
        };

        let config = Self {
            bind_addr: vars.parse(&["CAMGATE_BIND_ADDR"], d.bind_addr)?,
            api_port: vars.parse(&["CAMGATE_API_PORT", "PORT"], d.api_port)?,
            rtmp_host: vars.get(&["CAMGATE_RTMP_HOST"]).map(|(_, v)| v).unwrap_or(d.rtmp_host),
            rtmp_port: vars.parse(&["CAMGATE_RTMP_PORT", "RTMP_PORT"], d.rtmp_port)?,
            rtmp_app: vars.get(&["CAMGATE_RTMP_APP"]).map(|(_, v)| v).unwrap_or(d.rtmp_app),
            http_port: vars.parse(&["CAMGATE_HTTP_PORT", "HTTP_PORT"], d.http_port)?,
            storage_dir: vars
                .get(&["CAMGATE_STORAGE_DIR"])
                .map(|(_, v)| PathBuf::from(v))
                .unwrap_or(d.storage_dir),
            cameras,
            ffmpeg: vars.get(&["CAMGATE_FFMPEG"]).map(|(_, v)| PathBuf::from(v)),
            segment_duration: vars.secs(&["CAMGATE_SEGMENT_SECS"], d.segment_duration)?,
            retention: vars.secs(&["CAMGATE_RETENTION_SECS"], d.retention)?,
            sweep_interval: vars.secs(&["CAMGATE_SWEEP_INTERVAL_SECS"], d.sweep_interval)?,
            health_interval: vars.secs(&["CAMGATE_HEALTH_INTERVAL_SECS"], d.health_interval)?,
            stop_grace: vars.millis(&["CAMGATE_STOP_GRACE_MS"], d.stop_grace)?,
            cleanup_debounce: vars.millis(&["CAMGATE_CLEANUP_DEBOUNCE_MS"], d.cleanup_debounce)?,
            hls_time: vars.parse(&["CAMGATE_HLS_TIME"], d.hls_time)?,
            hls_list_size: vars.parse(&["CAMGATE_HLS_LIST_SIZE"], d.hls_list_size)?,
        };

        for (key, value) in [
            ("CAMGATE_SEGMENT_SECS", config.segment_duration),
            ("CAMGATE_SWEEP_INTERVAL_SECS", config.sweep_interval),
            ("CAMGATE_HEALTH_INTERVAL_SECS", config.health_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    value: "0".to_string(),
                });
            }
        }
        Ok(config)
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.storage_dir.join("recordings")
    }

    pub fn hls_root(&self) -> PathBuf {
        self.storage_dir.join("media").join("live")
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join("videos.db")
    }

    /// `rtmp://host:port/app`, to which camera names are appended.
    pub fn ingest_base_url(&self) -> String {
        format!("rtmp://{}:{}/{}", self.rtmp_host, self.rtmp_port, self.rtmp_app)
    }

    pub fn hls_config(&self, program: PathBuf) -> HlsConfig {
        HlsConfig {
            program,
            ingest_base_url: self.ingest_base_url(),
            output_root: self.hls_root(),
            hls_time: self.hls_time,
            hls_list_size: self.hls_list_size,
            stop_grace: self.stop_grace,
            cleanup_debounce: self.cleanup_debounce,
            ..HlsConfig::default()
        }
    }

    pub fn recording_config(&self, program: PathBuf) -> RecordingConfig {
        RecordingConfig {
            program,
            ingest_base_url: self.ingest_base_url(),
            output_dir: self.recordings_dir(),
            segment_duration: self.segment_duration,
            stop_grace: self.stop_grace,
            ..RecordingConfig::default()
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            period: self.health_interval,
            ..MonitorConfig::default()
        }
    }
}

fn parse_cameras(list: &str) -> Result<Vec<CameraId>, ConfigError> {
    let mut cameras: Vec<CameraId> = Vec::new();
    for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        if !CameraId::is_valid_name(name) {
            return Err(ConfigError::InvalidCamera(name.to_string()));
        }
        let camera = CameraId::from(name);
        if !cameras.contains(&camera) {
            cameras.push(camera);
        }
    }
    if cameras.is_empty() {
        return Err(ConfigError::NoCameras);
    }
    Ok(cameras)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::from_map(&HashMap::new()).unwrap();
        assert_eq!(config.api_port, 3000);
        assert_eq!(config.rtmp_port, 1935);
        assert_eq!(config.http_port, 8000);
        assert_eq!(config.cameras.len(), 6);
        assert_eq!(config.retention, Duration::from_secs(600));
        assert_eq!(config.ingest_base_url(), "rtmp://127.0.0.1:1935/live");
        assert_eq!(
            config.database_path(),
            PathBuf::from("./camgate-storage/videos.db")
        );
    }

    #[test]
    fn test_overrides_and_legacy_names() {
        let config = GatewayConfig::from_map(&vars(&[
            ("PORT", "8080"),
            ("CAMGATE_RTMP_PORT", "19350"),
            ("RTMP_PORT", "1"),
            ("CAMGATE_CAMERAS", "front, back,front"),
            ("CAMGATE_STOP_GRACE_MS", "500"),
            ("CAMGATE_STORAGE_DIR", "/var/lib/camgate"),
        ]))
        .unwrap();

        assert_eq!(config.api_port, 8080);
        // Namespaced variable beats the legacy one
        assert_eq!(config.rtmp_port, 19350);
        assert_eq!(config.cameras, vec![CameraId::from("front"), CameraId::from("back")]);
        assert_eq!(config.stop_grace, Duration::from_millis(500));
        assert_eq!(config.hls_root(), PathBuf::from("/var/lib/camgate/media/live"));
    }

    #[test]
    fn test_invalid_values() {
        assert_eq!(
            GatewayConfig::from_map(&vars(&[("CAMGATE_API_PORT", "eighty")])).unwrap_err(),
            ConfigError::Invalid {
                key: "CAMGATE_API_PORT".to_string(),
                value: "eighty".to_string()
            }
        );
        assert_eq!(
            GatewayConfig::from_map(&vars(&[("CAMGATE_CAMERAS", "ok,../etc")])).unwrap_err(),
            ConfigError::InvalidCamera("../etc".to_string())
        );
        assert!(GatewayConfig::from_map(&vars(&[("CAMGATE_SEGMENT_SECS", "0")])).is_err());
    }
}
