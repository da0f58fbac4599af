//! Notifications published by the supervisors

use crate::camera::CameraId;
use crate::detector::Strategy;
use crate::hls::HlsState;
use serde::Serialize;

/// Capacity of the supervisor event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorEvent {
    HlsState {
        camera: CameraId,
        state: HlsState,
        strategy: Option<Strategy>,
    },
    StrategySwitched {
        camera: CameraId,
        strategy: Strategy,
    },
    HlsFailed {
        camera: CameraId,
        error: String,
    },
    StaleHandleReaped {
        camera: CameraId,
    },
    OutputStale {
        camera: CameraId,
        idle_secs: u64,
    },
    SegmentStarted {
        camera: CameraId,
        filename: String,
    },
    SegmentCompleted {
        camera: CameraId,
        filename: String,
        retained: bool,
    },
    SegmentFailed {
        camera: CameraId,
        filename: String,
        error: String,
    },
    SegmentSkipped {
        camera: CameraId,
    },
    SegmentOverrun {
        camera: CameraId,
        filename: String,
        running_secs: u64,
    },
}

impl SupervisorEvent {
    pub fn camera(&self) -> &CameraId {
        match self {
            SupervisorEvent::HlsState { camera, .. }
            | SupervisorEvent::StrategySwitched { camera, .. }
            | SupervisorEvent::HlsFailed { camera, .. }
            | SupervisorEvent::StaleHandleReaped { camera }
            | SupervisorEvent::OutputStale { camera, .. }
            | SupervisorEvent::SegmentStarted { camera, .. }
            | SupervisorEvent::SegmentCompleted { camera, .. }
            | SupervisorEvent::SegmentFailed { camera, .. }
            | SupervisorEvent::SegmentSkipped { camera }
            | SupervisorEvent::SegmentOverrun { camera, .. } => camera,
        }
    }
}
