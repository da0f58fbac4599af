//! Recording Supervisor
//!
//! Continuous recording is a chain of fixed-duration capture subprocesses,
//! one per period, never overlapping for the same camera. On-demand captures
//! run beside the chain and write to their own files.

use crate::camera::{CameraId, StreamRole};
use crate::catalog::{CatalogError, NewSegment, SegmentCatalog};
use crate::command::SegmentCommandBuilder;
use crate::events::SupervisorEvent;
use crate::launcher::{ExitReport, LaunchError, LaunchSpec, ProcessHandle, ProcessLauncher, DEFAULT_STOP_GRACE};
use crate::schedule::Schedule;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("launch failed: {0}")]
    Launch(#[from] LaunchError),

    #[error("capture for {camera} exited unsuccessfully (code {code:?}, signal {signal:?})")]
    Failed {
        camera: CameraId,
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("capture for {camera} overran its {limit_secs}s bound")]
    Overrun { camera: CameraId, limit_secs: u64 },

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct RecordingConfig {
    pub program: PathBuf,
    /// Pull URL prefix; the camera name is appended
    pub ingest_base_url: String,
    pub output_dir: PathBuf,
    /// Length of each segment and period of the continuous trigger
    pub segment_duration: Duration,
    pub stop_grace: Duration,
    /// Slack past `segment_duration` before a capture counts as overrunning
    pub overrun_tolerance: Duration,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            ingest_base_url: "rtmp://127.0.0.1:1935/live".to_string(),
            output_dir: PathBuf::from("recordings"),
            segment_duration: Duration::from_secs(60),
            stop_grace: DEFAULT_STOP_GRACE,
            overrun_tolerance: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureKind {
    Continuous,
    OnDemand,
}

struct ActiveSegment {
    handle: ProcessHandle,
    filename: String,
    path: PathBuf,
    started: Instant,
    overrun_reported: bool,
}

struct ContinuousSession {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

struct RecordingInner {
    launcher: Arc<dyn ProcessLauncher>,
    catalog: Arc<dyn SegmentCatalog>,
    schedule: Arc<dyn Schedule>,
    config: RecordingConfig,
    events: broadcast::Sender<SupervisorEvent>,
    sessions: Mutex<HashMap<CameraId, ContinuousSession>>,
    /// Held by a camera's continuous task for its whole life, so a new task
    /// cannot launch until the previous one has seen its capture exit.
    slots: Mutex<HashMap<CameraId, Arc<AsyncMutex<()>>>>,
}

#[derive(Clone)]
pub struct RecordingSupervisor {
    inner: Arc<RecordingInner>,
}

impl RecordingSupervisor {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        catalog: Arc<dyn SegmentCatalog>,
        schedule: Arc<dyn Schedule>,
        config: RecordingConfig,
        events: broadcast::Sender<SupervisorEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(RecordingInner {
                launcher,
                catalog,
                schedule,
                config,
                events,
                sessions: Mutex::new(HashMap::new()),
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &RecordingConfig {
        &self.inner.config
    }

    pub fn is_active(&self, camera: &CameraId) -> bool {
        let sessions = self.inner.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions
            .get(camera)
            .map(|s| !s.join.is_finished())
            .unwrap_or(false)
    }

    pub fn active_cameras(&self) -> Vec<CameraId> {
        let sessions = self.inner.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let mut cameras: Vec<CameraId> = sessions
            .iter()
            .filter(|(_, s)| !s.join.is_finished())
            .map(|(c, _)| c.clone())
            .collect();
        cameras.sort();
        cameras
    }

    /// Begin continuous recording. Returns `false` (and does nothing) when the
    /// camera is already recording.
    pub fn start_continuous(&self, camera: &CameraId) -> bool {
        let mut sessions = self.inner.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = sessions.get(camera) {
            if !session.join.is_finished() {
                debug!("Continuous recording for {} already active", camera);
                return false;
            }
            warn!("Continuous recording task for {} had died, restarting", camera);
        }

        info!("⏺️  Starting continuous recording for {}", camera);
        let slot = self.inner.slot(camera);
        let held = Arc::clone(&slot).try_lock_owned().ok();
        let cancel = CancellationToken::new();
        let join = tokio::spawn(run_continuous(
            Arc::clone(&self.inner),
            camera.clone(),
            cancel.clone(),
            slot,
            held,
        ));
        sessions.insert(camera.clone(), ContinuousSession { cancel, join });
        true
    }

    /// Disarm the trigger and terminate the running segment, waiting for it
    /// to exit. Idempotent.
    pub async fn stop_continuous(&self, camera: &CameraId) {
        let session = {
            let mut sessions = self.inner.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            sessions.remove(camera)
        };
        if let Some(session) = session {
            info!("⏹️  Stopping continuous recording for {}", camera);
            session.cancel.cancel();
            if let Err(e) = session.join.await {
                error!("Recording task for {} ended abnormally: {}", camera, e);
            }
        }
    }

    pub async fn stop_all(&self) {
        let cameras: Vec<CameraId> = {
            let sessions = self.inner.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            sessions.keys().cloned().collect()
        };
        let stops = cameras.iter().map(|camera| self.stop_continuous(camera));
        futures::future::join_all(stops).await;
    }

    /// One out-of-band capture, registered as retained. Returns the file name.
    pub async fn capture_on_demand(&self, camera: &CameraId) -> Result<String, RecordingError> {
        let inner = &self.inner;
        let mut segment = inner.launch_capture(camera, CaptureKind::OnDemand).await?;
        info!("📸 On-demand capture for {} -> {}", camera, segment.filename);

        let limit = inner.config.segment_duration + inner.config.overrun_tolerance;
        let label = segment.handle.label().to_string();
        let waited = tokio::time::timeout(
            limit,
            segment
                .handle
                .wait_for_exit(|line| debug!("[{}] {}", label, line)),
        )
        .await;

        let report = match waited {
            Ok(report) => report,
            Err(_) => {
                inner.report_overrun(camera, &segment);
                let _ = segment.handle.stop(inner.config.stop_grace).await;
                inner.discard_file(&segment.path).await;
                return Err(RecordingError::Overrun {
                    camera: camera.clone(),
                    limit_secs: limit.as_secs(),
                });
            }
        };

        inner.complete(camera, segment.filename, segment.path, report, true).await
    }
}

impl RecordingInner {
    fn slot(&self, camera: &CameraId) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(camera.clone()).or_default())
    }

    fn input_url(&self, camera: &CameraId) -> String {
        format!("{}/{}", self.config.ingest_base_url.trim_end_matches('/'), camera)
    }

    fn segment_filename(camera: &CameraId, kind: CaptureKind) -> String {
        let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%S-%3fZ");
        match kind {
            CaptureKind::Continuous => format!("{}-{}.mp4", camera, timestamp),
            CaptureKind::OnDemand => format!("{}-manual-{}.mp4", camera, timestamp),
        }
    }

    async fn launch_capture(
        &self,
        camera: &CameraId,
        kind: CaptureKind,
    ) -> Result<ActiveSegment, RecordingError> {
        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        let filename = Self::segment_filename(camera, kind);
        let path = self.config.output_dir.join(&filename);
        let args = SegmentCommandBuilder::new(self.input_url(camera), &path)
            .with_duration(self.config.segment_duration.as_secs().max(1))
            .build();
        let label = match kind {
            CaptureKind::Continuous => format!("{}:{}", StreamRole::Recording, camera),
            CaptureKind::OnDemand => format!("capture:{}", camera),
        };
        let spec = LaunchSpec::new(self.config.program.clone(), args, label);
        let handle = self.launcher.launch(&spec).await?;

        let _ = self.events.send(SupervisorEvent::SegmentStarted {
            camera: camera.clone(),
            filename: filename.clone(),
        });
        Ok(ActiveSegment {
            handle,
            filename,
            path,
            started: Instant::now(),
            overrun_reported: false,
        })
    }

    /// Register a finished capture, or discard it if it failed.
    async fn complete(
        &self,
        camera: &CameraId,
        filename: String,
        path: PathBuf,
        report: ExitReport,
        retain: bool,
    ) -> Result<String, RecordingError> {
        if !report.success() {
            let error = RecordingError::Failed {
                camera: camera.clone(),
                code: report.code,
                signal: report.signal,
            };
            self.report_failure(camera, &filename, &error);
            self.discard_file(&path).await;
            return Err(error);
        }

        let segment = NewSegment {
            filename: filename.clone(),
            path,
            created_at: Utc::now(),
            retain,
        };
        match self.catalog.insert(segment).await {
            Ok(record) => {
                info!("💾 Recorded {} (id {}, retain={})", filename, record.id, retain);
                let _ = self.events.send(SupervisorEvent::SegmentCompleted {
                    camera: camera.clone(),
                    filename: filename.clone(),
                    retained: retain,
                });
                Ok(filename)
            }
            Err(e) => {
                let error = RecordingError::Catalog(e);
                self.report_failure(camera, &filename, &error);
                Err(error)
            }
        }
    }

    fn report_failure(&self, camera: &CameraId, filename: &str, error: &RecordingError) {
        warn!("❌ Recording {} for {} failed: {}", filename, camera, error);
        let _ = self.events.send(SupervisorEvent::SegmentFailed {
            camera: camera.clone(),
            filename: filename.to_string(),
            error: error.to_string(),
        });
    }

    fn report_overrun(&self, camera: &CameraId, segment: &ActiveSegment) {
        let running = segment.started.elapsed().as_secs();
        warn!(
            "⏱️  Capture {} for {} still running after {}s",
            segment.filename, camera, running
        );
        let _ = self.events.send(SupervisorEvent::SegmentOverrun {
            camera: camera.clone(),
            filename: segment.filename.clone(),
            running_secs: running,
        });
    }

    /// Files that never made it into the catalog would escape retention.
    async fn discard_file(&self, path: &PathBuf) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!("Removed partial capture {:?}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove partial capture {:?}: {}", path, e),
        }
    }
}

async fn segment_exit(current: &mut Option<ActiveSegment>) -> ExitReport {
    match current {
        Some(segment) => {
            let label = segment.handle.label().to_string();
            segment
                .handle
                .wait_for_exit(|line| debug!("[{}] {}", label, line))
                .await
        }
        None => std::future::pending().await,
    }
}

async fn run_continuous(
    inner: Arc<RecordingInner>,
    camera: CameraId,
    cancel: CancellationToken,
    slot: Arc<AsyncMutex<()>>,
    held: Option<OwnedMutexGuard<()>>,
) {
    let _slot = match held {
        Some(guard) => guard,
        None => {
            debug!("Waiting for the previous recording task of {} to finish", camera);
            tokio::select! {
                _ = cancel.cancelled() => return,
                guard = slot.lock_owned() => guard,
            }
        }
    };

    let mut ticker = inner.schedule.ticker(inner.config.segment_duration);
    let overrun_limit = inner.config.segment_duration + inner.config.overrun_tolerance;

    let mut current = match inner.launch_capture(&camera, CaptureKind::Continuous).await {
        Ok(segment) => Some(segment),
        Err(e) => {
            error!("❌ First segment for {} failed to launch: {}", camera, e);
            None
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            report = segment_exit(&mut current) => {
                if let Some(segment) = current.take() {
                    let _ = inner
                        .complete(&camera, segment.filename, segment.path, report, false)
                        .await;
                }
            }
            _ = ticker.tick() => {
                if let Some(segment) = current.as_mut() {
                    if segment.started.elapsed() > overrun_limit && !segment.overrun_reported {
                        inner.report_overrun(&camera, segment);
                        segment.overrun_reported = true;
                    }
                    debug!("⏭️  Segment for {} still running, skipping tick", camera);
                    let _ = inner.events.send(SupervisorEvent::SegmentSkipped {
                        camera: camera.clone(),
                    });
                    continue;
                }
                match inner.launch_capture(&camera, CaptureKind::Continuous).await {
                    Ok(segment) => current = Some(segment),
                    Err(e) => {
                        error!("❌ Segment launch for {} failed: {}", camera, e);
                        let _ = inner.events.send(SupervisorEvent::SegmentFailed {
                            camera: camera.clone(),
                            filename: String::new(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    if let Some(segment) = current.take() {
        let report = segment.handle.stop(inner.config.stop_grace).await;
        let _ = inner
            .complete(&camera, segment.filename, segment.path, report, false)
            .await;
    }
    debug!("Continuous recording loop for {} finished", camera);
}
