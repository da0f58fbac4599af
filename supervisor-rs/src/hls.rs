//! HLS Stream Supervisor
//!
//! Each camera gets one worker task that owns the live-preview subprocess.
//! Start/stop requests, diagnostic lines, exit notifications and the
//! debounced cleanup timer are all handled inside that task, so there is no
//! shared mutable state between them and at most one subprocess per camera.
//!
//! ```text
//! Idle -> Starting -> Running -> Stopping -> Idle
//!                        |
//!                        +-> Restarting -> Starting   (codec fallback, once per start)
//! ```

use crate::camera::{CameraId, StreamRole};
use crate::command::HlsCommandBuilder;
use crate::detector::{self, Decision, Strategy};
use crate::events::SupervisorEvent;
use crate::launcher::{LaunchError, LaunchSpec, ProcessEvent, ProcessHandle, ProcessLauncher, DEFAULT_STOP_GRACE};
use crate::output;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HlsState {
    Idle,
    Starting,
    Running,
    Restarting,
    Stopping,
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("launch failed: {0}")]
    Launch(#[from] LaunchError),

    #[error("output directory error: {0}")]
    Io(#[from] std::io::Error),

    #[error("supervisor for {0} is no longer running")]
    WorkerGone(CameraId),
}

#[derive(Debug, Clone)]
pub struct HlsConfig {
    /// ffmpeg executable
    pub program: PathBuf,
    /// Pull URL prefix; the camera name is appended (`rtmp://127.0.0.1:1935/live`)
    pub ingest_base_url: String,
    /// Parent of the per-camera live directories
    pub output_root: PathBuf,
    pub hls_time: u32,
    pub hls_list_size: u32,
    pub framerate: u32,
    pub stop_grace: Duration,
    pub cleanup_debounce: Duration,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            ingest_base_url: "rtmp://127.0.0.1:1935/live".to_string(),
            output_root: PathBuf::from("media/live"),
            hls_time: 2,
            hls_list_size: 3,
            framerate: 25,
            stop_grace: DEFAULT_STOP_GRACE,
            cleanup_debounce: Duration::from_secs(1),
        }
    }
}

/// Point-in-time view of one camera's live preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HlsSnapshot {
    pub state: HlsState,
    pub strategy: Option<Strategy>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    /// Fallback relaunches in the current start cycle
    pub retries: u32,
    pub last_error: Option<String>,
    pub has_process: bool,
}

impl HlsSnapshot {
    fn idle() -> Self {
        Self {
            state: HlsState::Idle,
            strategy: None,
            pid: None,
            started_at: None,
            retries: 0,
            last_error: None,
            has_process: false,
        }
    }

    pub fn transcoding_active(&self) -> bool {
        self.has_process && self.strategy == Some(Strategy::Transcode)
    }
}

enum HlsCommand {
    Start(oneshot::Sender<Result<(), SupervisorError>>),
    Stop(oneshot::Sender<()>),
    Reconcile(oneshot::Sender<bool>),
}

struct WorkerHandle {
    commands: mpsc::UnboundedSender<HlsCommand>,
    state: watch::Receiver<HlsSnapshot>,
    join: JoinHandle<()>,
}

struct HlsInner {
    launcher: Arc<dyn ProcessLauncher>,
    config: HlsConfig,
    events: broadcast::Sender<SupervisorEvent>,
    workers: Mutex<HashMap<CameraId, WorkerHandle>>,
}

/// Owner of every camera's live-preview worker.
#[derive(Clone)]
pub struct HlsSupervisor {
    inner: Arc<HlsInner>,
}

impl HlsSupervisor {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        config: HlsConfig,
        events: broadcast::Sender<SupervisorEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(HlsInner {
                launcher,
                config,
                events,
                workers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &HlsConfig {
        &self.inner.config
    }

    pub fn output_dir(&self, camera: &CameraId) -> PathBuf {
        self.inner.config.output_root.join(camera.as_str())
    }

    /// Cameras that have a worker.
    pub fn cameras(&self) -> Vec<CameraId> {
        let workers = self.inner.workers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut cameras: Vec<CameraId> = workers.keys().cloned().collect();
        cameras.sort();
        cameras
    }

    pub fn snapshot(&self, camera: &CameraId) -> Option<HlsSnapshot> {
        let workers = self.inner.workers.lock().unwrap_or_else(PoisonError::into_inner);
        workers.get(camera).map(|w| w.state.borrow().clone())
    }

    /// Watch a camera's state; creates the worker if needed.
    pub fn watch(&self, camera: &CameraId) -> watch::Receiver<HlsSnapshot> {
        let mut workers = self.inner.workers.lock().unwrap_or_else(PoisonError::into_inner);
        self.worker_locked(&mut workers, camera).state.clone()
    }

    fn worker_locked<'a>(
        &self,
        workers: &'a mut HashMap<CameraId, WorkerHandle>,
        camera: &CameraId,
    ) -> &'a WorkerHandle {
        let dead = workers
            .get(camera)
            .map(|w| w.join.is_finished() || w.commands.is_closed())
            .unwrap_or(false);
        if dead {
            error!("💥 HLS worker for {} died, recreating", camera);
            workers.remove(camera);
        }
        workers
            .entry(camera.clone())
            .or_insert_with(|| spawn_worker(camera.clone(), Arc::clone(&self.inner)))
    }

    fn sender(&self, camera: &CameraId) -> mpsc::UnboundedSender<HlsCommand> {
        let mut workers = self.inner.workers.lock().unwrap_or_else(PoisonError::into_inner);
        self.worker_locked(&mut workers, camera).commands.clone()
    }

    /// Start (or restart) the live preview. Resolves once the subprocess has
    /// been launched; any previous subprocess has confirmed its exit by then.
    pub async fn start(&self, camera: &CameraId) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.sender(camera)
            .send(HlsCommand::Start(tx))
            .map_err(|_| SupervisorError::WorkerGone(camera.clone()))?;
        rx.await.map_err(|_| SupervisorError::WorkerGone(camera.clone()))?
    }

    /// Stop the live preview. Resolves after the subprocess exit is confirmed;
    /// output cleanup follows after the debounce.
    pub async fn stop(&self, camera: &CameraId) -> Result<(), SupervisorError> {
        let sender = {
            let workers = self.inner.workers.lock().unwrap_or_else(PoisonError::into_inner);
            match workers.get(camera) {
                Some(worker) => worker.commands.clone(),
                None => return Ok(()),
            }
        };
        let (tx, rx) = oneshot::channel();
        sender
            .send(HlsCommand::Stop(tx))
            .map_err(|_| SupervisorError::WorkerGone(camera.clone()))?;
        rx.await.map_err(|_| SupervisorError::WorkerGone(camera.clone()))
    }

    pub async fn stop_all(&self) {
        let cameras = self.cameras();
        let stops = cameras.iter().map(|camera| async move {
            if let Err(e) = self.stop(camera).await {
                warn!("Failed to stop HLS for {}: {}", camera, e);
            }
        });
        futures::future::join_all(stops).await;
    }

    /// Drop a handle whose process is gone but whose exit was never processed.
    /// Returns `true` if a stale entry was removed.
    pub async fn reconcile(&self, camera: &CameraId) -> bool {
        let sender = {
            let workers = self.inner.workers.lock().unwrap_or_else(PoisonError::into_inner);
            match workers.get(camera) {
                Some(worker) => worker.commands.clone(),
                None => return false,
            }
        };
        let (tx, rx) = oneshot::channel();
        if sender.send(HlsCommand::Reconcile(tx)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Reconcile every camera and forget workers whose task has died.
    pub async fn reconcile_all(&self) -> Vec<CameraId> {
        {
            let mut workers = self.inner.workers.lock().unwrap_or_else(PoisonError::into_inner);
            workers.retain(|camera, worker| {
                let alive = !worker.join.is_finished();
                if !alive {
                    warn!("🧹 Removing dead HLS worker for {}", camera);
                }
                alive
            });
        }

        let mut reaped = Vec::new();
        for camera in self.cameras() {
            if self.reconcile(&camera).await {
                reaped.push(camera);
            }
        }
        reaped
    }

    /// Stop every worker task (and its subprocess) for good.
    pub async fn shutdown(&self) {
        self.stop_all().await;
        let workers: Vec<WorkerHandle> = {
            let mut workers = self.inner.workers.lock().unwrap_or_else(PoisonError::into_inner);
            workers.drain().map(|(_, w)| w).collect()
        };
        for worker in workers {
            drop(worker.commands);
            let _ = worker.join.await;
        }
    }
}

fn spawn_worker(camera: CameraId, inner: Arc<HlsInner>) -> WorkerHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(HlsSnapshot::idle());
    let worker = HlsWorker {
        output_dir: inner.config.output_root.join(camera.as_str()),
        camera,
        inner,
        state: state_tx,
        process: None,
        strategy: Strategy::DirectCopy,
        fallback_used: false,
        retries: 0,
        last_error: None,
        cleanup_at: None,
    };
    let join = tokio::spawn(worker.run(commands_rx));
    WorkerHandle {
        commands: commands_tx,
        state: state_rx,
        join,
    }
}

struct HlsWorker {
    camera: CameraId,
    inner: Arc<HlsInner>,
    output_dir: PathBuf,
    state: watch::Sender<HlsSnapshot>,
    process: Option<ProcessHandle>,
    strategy: Strategy,
    fallback_used: bool,
    retries: u32,
    last_error: Option<String>,
    cleanup_at: Option<Instant>,
}

async fn next_process_event(process: &mut Option<ProcessHandle>) -> ProcessEvent {
    match process {
        Some(handle) => match handle.next_event().await {
            Some(event) => event,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl HlsWorker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<HlsCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = next_process_event(&mut self.process) => self.handle_process_event(event).await,
                _ = sleep_until_opt(self.cleanup_at) => {
                    self.cleanup_at = None;
                    self.cleanup().await;
                }
            }
        }

        if let Some(process) = self.process.take() {
            process.stop(self.inner.config.stop_grace).await;
        }
        debug!("HLS worker for {} exiting", self.camera);
    }

    fn label(&self) -> String {
        format!("{}:{}", StreamRole::Hls, self.camera)
    }

    fn set_state(&mut self, state: HlsState) {
        let snapshot = HlsSnapshot {
            state,
            strategy: (state != HlsState::Idle).then_some(self.strategy),
            pid: self.process.as_ref().and_then(|p| p.pid()),
            started_at: self.process.as_ref().map(|p| p.started_at()),
            retries: self.retries,
            last_error: self.last_error.clone(),
            has_process: self.process.is_some(),
        };
        debug!("📺 {} HLS -> {:?}", self.camera, state);
        let strategy = snapshot.strategy;
        self.state.send_replace(snapshot);
        let _ = self.inner.events.send(SupervisorEvent::HlsState {
            camera: self.camera.clone(),
            state,
            strategy,
        });
    }

    fn current_state(&self) -> HlsState {
        self.state.borrow().state
    }

    fn report_failure(&mut self, error: String) {
        warn!("❌ {} HLS failure: {}", self.camera, error);
        self.last_error = Some(error.clone());
        let _ = self.inner.events.send(SupervisorEvent::HlsFailed {
            camera: self.camera.clone(),
            error,
        });
    }

    fn schedule_cleanup(&mut self) {
        self.cleanup_at = Some(Instant::now() + self.inner.config.cleanup_debounce);
    }

    async fn cleanup(&mut self) {
        // Never touch the directory while a writer may be alive
        if self.process.is_some() {
            return;
        }
        match output::clear_dir(&self.output_dir).await {
            Ok(removed) if removed > 0 => info!("🧹 Removed {} HLS files for {}", removed, self.camera),
            Ok(_) => {}
            Err(e) => warn!("Failed to clean HLS output for {}: {}", self.camera, e),
        }
    }

    async fn handle_command(&mut self, command: HlsCommand) {
        match command {
            HlsCommand::Start(reply) => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            HlsCommand::Stop(reply) => {
                self.stop().await;
                let _ = reply.send(());
            }
            HlsCommand::Reconcile(reply) => {
                let reaped = self.reconcile().await;
                let _ = reply.send(reaped);
            }
        }
    }

    /// Stop whatever is running and wait for the confirmed exit.
    async fn terminate_current(&mut self) {
        if let Some(process) = self.process.take() {
            let report = process.stop(self.inner.config.stop_grace).await;
            debug!("{} HLS process ended: {:?}", self.camera, report);
        }
    }

    async fn start(&mut self) -> Result<(), SupervisorError> {
        if self.process.is_some() {
            info!("🔁 {} HLS already running, restarting", self.camera);
            self.set_state(HlsState::Stopping);
            self.terminate_current().await;
        }

        // Previous generation is confirmed gone; wipe it before the new writer starts
        self.cleanup_at = None;
        if let Err(e) = output::clear_dir(&self.output_dir).await {
            warn!("Failed to clear stale HLS output for {}: {}", self.camera, e);
        }
        if let Err(e) = tokio::fs::create_dir_all(&self.output_dir).await {
            self.report_failure(format!("cannot create {:?}: {}", self.output_dir, e));
            self.set_state(HlsState::Idle);
            return Err(e.into());
        }

        self.strategy = Strategy::DirectCopy;
        self.fallback_used = false;
        self.retries = 0;
        self.last_error = None;
        self.launch().await
    }

    async fn launch(&mut self) -> Result<(), SupervisorError> {
        self.set_state(HlsState::Starting);
        let config = &self.inner.config;
        let input = format!("{}/{}", config.ingest_base_url.trim_end_matches('/'), self.camera);
        let args = HlsCommandBuilder::new(input, &self.output_dir)
            .with_strategy(self.strategy)
            .with_playlist_window(config.hls_time, config.hls_list_size)
            .with_framerate(config.framerate)
            .build();
        let spec = LaunchSpec::new(config.program.clone(), args, self.label());

        match self.inner.launcher.launch(&spec).await {
            Ok(handle) => {
                info!(
                    "▶️  {} HLS started ({:?}, pid {:?})",
                    self.camera,
                    self.strategy,
                    handle.pid()
                );
                self.process = Some(handle);
                self.set_state(HlsState::Running);
                Ok(())
            }
            Err(e) => {
                error!("❌ {} HLS launch failed: {}", self.camera, e);
                self.report_failure(e.to_string());
                self.set_state(HlsState::Idle);
                Err(e.into())
            }
        }
    }

    async fn stop(&mut self) {
        if self.process.is_some() {
            info!("⏹️  Stopping HLS for {}", self.camera);
            self.set_state(HlsState::Stopping);
            self.terminate_current().await;
        }
        if self.current_state() != HlsState::Idle {
            self.set_state(HlsState::Idle);
        }
        self.schedule_cleanup();
    }

    /// One transcoding relaunch per start cycle.
    async fn restart_with_fallback(&mut self, reason: &str) {
        info!(
            "🔄 {} switching to transcoding fallback ({})",
            self.camera, reason
        );
        self.set_state(HlsState::Restarting);
        self.terminate_current().await;
        self.cleanup_at = None;
        if let Err(e) = output::clear_dir(&self.output_dir).await {
            warn!("Failed to clear HLS output for {}: {}", self.camera, e);
        }

        self.fallback_used = true;
        self.retries += 1;
        self.strategy = Strategy::Transcode;
        let _ = self.inner.events.send(SupervisorEvent::StrategySwitched {
            camera: self.camera.clone(),
            strategy: Strategy::Transcode,
        });
        if self.launch().await.is_err() {
            self.schedule_cleanup();
        }
    }

    async fn fail(&mut self, error: String) {
        self.report_failure(error);
        if self.process.is_some() {
            self.set_state(HlsState::Stopping);
            self.terminate_current().await;
        }
        self.set_state(HlsState::Idle);
        self.schedule_cleanup();
    }

    async fn handle_process_event(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Line(line) => {
                debug!("[{}] {}", self.label(), line);
                match detector::inspect(&line, self.strategy) {
                    Decision::Continue => {}
                    Decision::SwitchToFallback if !self.fallback_used => {
                        self.restart_with_fallback("unsupported codec for copy").await;
                    }
                    Decision::SwitchToFallback | Decision::FatalError => {
                        self.fail(line).await;
                    }
                }
            }
            ProcessEvent::Exited(report) => {
                self.process = None;
                if !self.fallback_used && detector::exit_needs_fallback(report.code, self.strategy) {
                    self.restart_with_fallback(&format!("exit code {:?}", report.code))
                        .await;
                    return;
                }
                match report.code {
                    Some(code) if code != 0 => {
                        self.report_failure(format!("ffmpeg exited with code {}", code));
                        self.set_state(HlsState::Idle);
                        self.schedule_cleanup();
                    }
                    _ => {
                        info!("{} HLS process ended ({:?})", self.camera, report);
                        self.set_state(HlsState::Idle);
                    }
                }
            }
        }
    }

    async fn reconcile(&mut self) -> bool {
        // Anything already queued is handled normally first
        while let Some(event) = self.process.as_mut().and_then(|p| p.try_next_event()) {
            self.handle_process_event(event).await;
        }

        let stale = self
            .process
            .as_ref()
            .map(|p| p.exit_report().is_some() || p.control().has_exited())
            .unwrap_or(false);
        if !stale {
            return false;
        }
        warn!("🩺 {} HLS handle outlived its process, reaping", self.camera);
        self.process = None;
        self.set_state(HlsState::Idle);
        self.schedule_cleanup();
        let _ = self.inner.events.send(SupervisorEvent::StaleHandleReaped {
            camera: self.camera.clone(),
        });
        true
    }
}
