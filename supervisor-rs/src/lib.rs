pub mod camera;
pub mod catalog;
pub mod command;
pub mod detector;
pub mod events;
pub mod gateway;
pub mod health;
pub mod hls;
pub mod launcher;
pub mod output;
pub mod recording;
pub mod registry;
pub mod schedule;
pub mod testing;
pub mod tool;

pub use camera::{parse_stream_path, CameraId, StreamRole};
pub use catalog::{CatalogError, NewSegment, SegmentCatalog, SegmentRecord};
pub use detector::{Decision, Strategy};
pub use events::{SupervisorEvent, EVENT_CHANNEL_CAPACITY};
pub use gateway::{CameraStatusView, CleanupReport, Gateway, GatewayError};
pub use health::{HealthMonitor, MonitorConfig, SweepReport};
pub use hls::{HlsConfig, HlsSnapshot, HlsState, HlsSupervisor, SupervisorError};
pub use launcher::{
    ExitReport, LaunchError, LaunchSpec, ProcessControl, ProcessEvent, ProcessHandle, ProcessLauncher,
    TokioLauncher,
};
pub use output::HlsOutputStats;
pub use recording::{RecordingConfig, RecordingError, RecordingSupervisor};
pub use registry::{CameraEntry, CameraMetrics, CameraRegistry, CameraStatus, RegistryError};
pub use schedule::{IntervalSchedule, PeriodicTask, Schedule, Ticker};
pub use tool::{locate_ffmpeg, probe_ffmpeg, ToolError, ToolInfo};
