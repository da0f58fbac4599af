pub mod catalog;
pub mod config;
pub mod retention;
pub mod server;
pub mod storage;

// Re-export commonly used types
pub use catalog::SqliteCatalog;
pub use config::{ConfigError, GatewayConfig};

use camgate_supervisor::{Gateway, SegmentCatalog};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordingFile {
    pub filename: String,
    pub url: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

pub type AppState = Arc<GatewayState>;

pub struct GatewayState {
    pub gateway: Gateway,
    pub catalog: Arc<dyn SegmentCatalog>,
    /// Ingest application name, used to parse webhook stream paths
    pub rtmp_app: String,
    pub recordings_dir: PathBuf,
}

impl std::fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayState")
            .field("gateway", &"<Gateway>")
            .field("catalog", &"<dyn SegmentCatalog>")
            .field("rtmp_app", &self.rtmp_app)
            .field("recordings_dir", &self.recordings_dir)
            .finish()
    }
}
