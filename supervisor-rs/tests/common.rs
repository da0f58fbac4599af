#![allow(dead_code)]

use camgate_supervisor::testing::{ManualSchedule, MemoryCatalog, ScriptedLauncher};
use camgate_supervisor::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub const CAMERAS: &[&str] = &["camera1", "camera2", "camera3"];

/// A codec failure as ffmpeg prints it when `-c:v copy` meets HEVC-in-FLV.
pub const CODEC_LINE: &str =
    "[flv @ 0x55d0c8a4e2c0] Video codec 12 is not implemented. Update your FFmpeg version to the newest one from Git.";

pub const DEBOUNCE: Duration = Duration::from_millis(50);
pub const GRACE: Duration = Duration::from_millis(200);

pub struct Harness {
    pub dir: TempDir,
    pub launcher: ScriptedLauncher,
    pub schedule: ManualSchedule,
    pub catalog: Arc<MemoryCatalog>,
    pub events: broadcast::Sender<SupervisorEvent>,
    pub registry: Arc<CameraRegistry>,
    pub hls: HlsSupervisor,
    pub recording: RecordingSupervisor,
    pub gateway: Gateway,
}

impl Harness {
    pub fn hls_dir(&self, camera: &str) -> PathBuf {
        self.hls.output_dir(&CameraId::from(camera))
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.recording.config().output_dir.clone()
    }

    pub fn monitor(&self, config: MonitorConfig) -> HealthMonitor {
        HealthMonitor::new(
            self.hls.clone(),
            Arc::clone(&self.registry),
            self.events.clone(),
            config,
        )
    }
}

/// Everything wired to fakes, rooted in a fresh temp dir. Needs a runtime.
pub fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let launcher = ScriptedLauncher::new();
    let schedule = ManualSchedule::new();
    let catalog = Arc::new(MemoryCatalog::new());
    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

    let hls = HlsSupervisor::new(
        Arc::new(launcher.clone()),
        HlsConfig {
            program: PathBuf::from("ffmpeg"),
            output_root: dir.path().join("media").join("live"),
            stop_grace: GRACE,
            cleanup_debounce: DEBOUNCE,
            ..HlsConfig::default()
        },
        events.clone(),
    );
    let recording = RecordingSupervisor::new(
        Arc::new(launcher.clone()),
        catalog.clone(),
        Arc::new(schedule.clone()),
        RecordingConfig {
            output_dir: dir.path().join("recordings"),
            stop_grace: GRACE,
            ..RecordingConfig::default()
        },
        events.clone(),
    );
    let registry = Arc::new(CameraRegistry::new(CAMERAS.iter().map(|c| CameraId::from(*c))));
    let gateway = Gateway::new(
        Arc::clone(&registry),
        hls.clone(),
        recording.clone(),
        &events,
        Duration::from_secs(30),
    );

    Harness {
        dir,
        launcher,
        schedule,
        catalog,
        events,
        registry,
        hls,
        recording,
        gateway,
    }
}

/// Poll `check` until it holds, failing the test after 5s.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Next event matching `pick`, skipping the rest; fails after 5s.
pub async fn next_matching<T>(
    rx: &mut broadcast::Receiver<SupervisorEvent>,
    mut pick: impl FnMut(&SupervisorEvent) -> Option<T>,
) -> T {
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(value) = pick(&event) {
                        return value;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await;
    found.expect("expected event never arrived")
}

/// HLS states published for `camera`, collected until `last` is seen.
pub async fn collect_states_until(
    rx: &mut broadcast::Receiver<SupervisorEvent>,
    camera: &str,
    last: HlsState,
    occurrences: usize,
) -> Vec<HlsState> {
    let mut states = Vec::new();
    let mut seen = 0;
    while seen < occurrences {
        let state = next_matching(rx, |event| match event {
            SupervisorEvent::HlsState { camera: c, state, .. } if c.as_str() == camera => Some(*state),
            _ => None,
        })
        .await;
        if state == last {
            seen += 1;
        }
        states.push(state);
    }
    states
}

pub fn file_count(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(Result::ok).count())
        .unwrap_or(0)
}

/// Pretend ffmpeg wrote a playlist and a segment.
pub fn write_hls_output(dir: &std::path::Path) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("index.m3u8"), "#EXTM3U\n").unwrap();
    std::fs::write(dir.join("index0.ts"), [0u8; 188]).unwrap();
}
