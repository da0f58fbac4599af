//! Ingest-facing facade
//!
//! The ingest server reports connect/publish/unpublish here. The gateway
//! updates the registry and drives both supervisors, and it folds supervisor
//! events back into the registry.

use crate::camera::CameraId;
use crate::events::SupervisorEvent;
use crate::hls::{HlsState, HlsSupervisor, SupervisorError};
use crate::output::{self, HlsOutputStats};
use crate::recording::{RecordingError, RecordingSupervisor};
use crate::registry::{CameraEntry, CameraMetrics, CameraRegistry, CameraStatus, RegistryError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("live preview: {0}")]
    Hls(#[from] SupervisorError),

    #[error("recording: {0}")]
    Recording(#[from] RecordingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything the status endpoint reports for one camera.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraStatusView {
    pub status: CameraStatus,
    pub metrics: CameraMetrics,
    pub has_process: bool,
    pub hls_files: HlsOutputStats,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub stopped: usize,
    pub removed_files: usize,
}

struct GatewayInner {
    registry: Arc<CameraRegistry>,
    hls: HlsSupervisor,
    recording: RecordingSupervisor,
    /// Ingest session id -> camera bound by connect or publish
    sessions: Mutex<HashMap<String, Option<CameraId>>>,
    freshness_window: Duration,
    listener: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    /// Must be called inside a tokio runtime: the event listener is spawned here.
    pub fn new(
        registry: Arc<CameraRegistry>,
        hls: HlsSupervisor,
        recording: RecordingSupervisor,
        events: &broadcast::Sender<SupervisorEvent>,
        freshness_window: Duration,
    ) -> Self {
        let inner = Arc::new(GatewayInner {
            registry,
            hls,
            recording,
            sessions: Mutex::new(HashMap::new()),
            freshness_window,
            listener: Mutex::new(None),
        });
        let listener = tokio::spawn(listen(Arc::downgrade(&inner), events.subscribe()));
        *inner.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);
        Self { inner }
    }

    pub fn registry(&self) -> &Arc<CameraRegistry> {
        &self.inner.registry
    }

    pub fn hls(&self) -> &HlsSupervisor {
        &self.inner.hls
    }

    pub fn recording(&self) -> &RecordingSupervisor {
        &self.inner.recording
    }

    fn bind_session(&self, session_id: &str, camera: &CameraId) -> Result<(), RegistryError> {
        let newly_bound = {
            let mut sessions = self.inner.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            let slot = sessions.entry(session_id.to_string()).or_insert(None);
            if slot.as_ref() == Some(camera) {
                false
            } else {
                *slot = Some(camera.clone());
                true
            }
        };
        if newly_bound {
            self.inner.registry.on_connect(camera)?;
        }
        Ok(())
    }

    /// A client opened an ingest session. The camera is usually unknown until
    /// it publishes.
    pub fn on_client_connect(
        &self,
        session_id: &str,
        camera: Option<&CameraId>,
    ) -> Result<(), GatewayError> {
        match camera {
            Some(camera) => {
                if !self.inner.registry.contains(camera) {
                    return Err(RegistryError::UnknownCamera(camera.clone()).into());
                }
                info!("🔌 Session {} connected for {}", session_id, camera);
                self.bind_session(session_id, camera)?;
            }
            None => {
                debug!("🔌 Session {} connected", session_id);
                let mut sessions = self.inner.sessions.lock().unwrap_or_else(PoisonError::into_inner);
                sessions.entry(session_id.to_string()).or_insert(None);
            }
        }
        Ok(())
    }

    /// A client started publishing `camera`. Recording starts even if the
    /// live preview fails to launch; the preview error is returned.
    pub async fn on_publish_start(&self, session_id: &str, camera: &CameraId) -> Result<(), GatewayError> {
        if !self.inner.registry.contains(camera) {
            warn!("🚫 Publish for unconfigured camera {} rejected", camera);
            return Err(RegistryError::UnknownCamera(camera.clone()).into());
        }
        self.bind_session(session_id, camera)?;
        self.inner.registry.on_publish_start(camera)?;
        info!("📡 {} is publishing (session {})", camera, session_id);

        let preview = self.inner.hls.start(camera).await;
        self.inner.recording.start_continuous(camera);
        if let Err(e) = preview {
            self.inner.registry.record_error(camera, e.to_string())?;
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn on_publish_end(&self, session_id: &str, camera: &CameraId) -> Result<(), GatewayError> {
        if !self.inner.registry.contains(camera) {
            return Err(RegistryError::UnknownCamera(camera.clone()).into());
        }
        {
            let mut sessions = self.inner.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            sessions.remove(session_id);
        }
        self.inner.registry.on_publish_end(camera)?;
        info!("📴 {} stopped publishing (session {})", camera, session_id);

        let (hls, ()) = tokio::join!(
            self.inner.hls.stop(camera),
            self.inner.recording.stop_continuous(camera)
        );
        hls?;
        self.inner.registry.set_transcoding(camera, false)?;
        Ok(())
    }

    /// Status, metrics and live-output summary; `None` for unknown cameras.
    pub async fn camera_status(&self, camera: &CameraId) -> Option<CameraStatusView> {
        let (status, metrics) = self.inner.registry.get(camera)?;
        let has_process = self
            .inner
            .hls
            .snapshot(camera)
            .map(|s| s.has_process)
            .unwrap_or(false);
        let dir = self.inner.hls.output_dir(camera);
        let hls_files = match output::output_stats(&dir, self.inner.freshness_window).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Cannot read HLS output for {}: {}", camera, e);
                HlsOutputStats::default()
            }
        };
        Some(CameraStatusView {
            status,
            metrics,
            has_process,
            hls_files,
        })
    }

    pub fn cameras(&self) -> Vec<CameraEntry> {
        self.inner.registry.all()
    }

    /// On-demand capture for a configured camera. Returns the file name.
    pub async fn save_now(&self, camera: &CameraId) -> Result<String, GatewayError> {
        if !self.inner.registry.contains(camera) {
            return Err(RegistryError::UnknownCamera(camera.clone()).into());
        }
        match self.inner.recording.capture_on_demand(camera).await {
            Ok(filename) => Ok(filename),
            Err(e) => {
                self.inner.registry.record_error(camera, e.to_string())?;
                Err(e.into())
            }
        }
    }

    /// Stop every live preview and wipe all HLS output.
    pub async fn cleanup(&self) -> Result<CleanupReport, GatewayError> {
        let running: Vec<CameraId> = self
            .inner
            .hls
            .cameras()
            .into_iter()
            .filter(|c| self.inner.hls.snapshot(c).map(|s| s.has_process).unwrap_or(false))
            .collect();
        self.inner.hls.stop_all().await;
        let removed_files = output::wipe_hls_root(&self.inner.hls.config().output_root).await?;
        for camera in self.inner.registry.cameras() {
            let _ = self.inner.registry.set_transcoding(&camera, false);
        }
        info!(
            "🧹 Cleanup stopped {} preview(s), removed {} file(s)",
            running.len(),
            removed_files
        );
        Ok(CleanupReport {
            stopped: running.len(),
            removed_files,
        })
    }

    /// Stop every subprocess and the event listener.
    pub async fn shutdown(&self) {
        info!("🛑 Stopping all camera subprocesses");
        tokio::join!(self.inner.hls.shutdown(), self.inner.recording.stop_all());
        let listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            listener.abort();
        }
    }
}

fn apply_event(inner: &GatewayInner, event: &SupervisorEvent) {
    let registry = &inner.registry;
    let result = match event {
        SupervisorEvent::HlsState {
            camera,
            state,
            strategy,
        } => {
            let active = *state == HlsState::Running && strategy.map(|s| s.is_transcoding()).unwrap_or(false);
            registry.set_transcoding(camera, active).map(|_| ())
        }
        SupervisorEvent::HlsFailed { camera, error } => registry.record_error(camera, error.clone()),
        SupervisorEvent::SegmentFailed { camera, error, .. } => {
            registry.record_error(camera, error.clone())
        }
        _ => Ok(()),
    };
    if let Err(e) = result {
        debug!("Ignoring event for {}: {}", event.camera(), e);
    }
}

fn resync(inner: &GatewayInner) {
    for camera in inner.hls.cameras() {
        if let Some(snapshot) = inner.hls.snapshot(&camera) {
            let _ = inner
                .registry
                .set_transcoding(&camera, snapshot.transcoding_active());
        }
    }
}

async fn listen(inner: std::sync::Weak<GatewayInner>, mut events: broadcast::Receiver<SupervisorEvent>) {
    loop {
        let event = events.recv().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            Ok(event) => apply_event(&inner, &event),
            Err(RecvError::Lagged(missed)) => {
                warn!("Gateway missed {} supervisor events, re-syncing", missed);
                resync(&inner);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
