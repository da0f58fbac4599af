//! Health Monitor
//!
//! A periodic sweep that drives the HLS supervisor's view back to what the
//! OS and filesystem say. It never starts anything; it only reaps, re-syncs
//! and reports.

use crate::camera::CameraId;
use crate::events::SupervisorEvent;
use crate::hls::{HlsState, HlsSupervisor};
use crate::output;
use crate::registry::CameraRegistry;
use crate::schedule::{PeriodicTask, Schedule};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub period: Duration,
    /// A running preview with no file newer than this is reported stale
    pub freshness_window: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(30),
            freshness_window: Duration::from_secs(30),
        }
    }
}

/// What one sweep changed or found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reaped: Vec<CameraId>,
    pub stale_output: Vec<CameraId>,
    pub transcoding_resynced: Vec<CameraId>,
}

#[derive(Clone)]
pub struct HealthMonitor {
    hls: HlsSupervisor,
    registry: Arc<CameraRegistry>,
    events: broadcast::Sender<SupervisorEvent>,
    config: MonitorConfig,
}

impl HealthMonitor {
    pub fn new(
        hls: HlsSupervisor,
        registry: Arc<CameraRegistry>,
        events: broadcast::Sender<SupervisorEvent>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            hls,
            registry,
            events,
            config,
        }
    }

    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport {
            reaped: self.hls.reconcile_all().await,
            ..SweepReport::default()
        };

        for camera in self.hls.cameras() {
            let Some(snapshot) = self.hls.snapshot(&camera) else {
                continue;
            };

            if let Ok(true) = self.registry.set_transcoding(&camera, snapshot.transcoding_active()) {
                debug!("🩺 {} transcodingActive re-synced to {}", camera, snapshot.transcoding_active());
                report.transcoding_resynced.push(camera.clone());
            }

            if snapshot.state != HlsState::Running {
                continue;
            }
            // Give a fresh process one window to produce its first segment
            let window = self.config.freshness_window;
            let running_for = snapshot
                .started_at
                .and_then(|t| (Utc::now() - t).to_std().ok())
                .unwrap_or_default();
            if running_for < window {
                continue;
            }

            let dir = self.hls.output_dir(&camera);
            match output::output_stats(&dir, window).await {
                Ok(stats) if !stats.has_recent_activity => {
                    let idle = stats.newest_age.unwrap_or(running_for);
                    warn!(
                        "🩺 {} HLS running but no output for {}s",
                        camera,
                        idle.as_secs()
                    );
                    let _ = self.events.send(SupervisorEvent::OutputStale {
                        camera: camera.clone(),
                        idle_secs: idle.as_secs(),
                    });
                    report.stale_output.push(camera);
                }
                Ok(_) => {}
                Err(e) => warn!("🩺 Cannot inspect HLS output for {}: {}", camera, e),
            }
        }

        if !report.reaped.is_empty() {
            info!("🩺 Health sweep reaped {} stale handle(s)", report.reaped.len());
        }
        report
    }

    /// Run `sweep` every `period` until the returned task is cancelled.
    pub fn spawn(&self, schedule: &dyn Schedule) -> PeriodicTask {
        let monitor = self.clone();
        PeriodicTask::spawn(
            "health-monitor",
            schedule.ticker(self.config.period),
            move || {
                let monitor = monitor.clone();
                async move {
                    monitor.sweep().await;
                }
            },
        )
    }
}
