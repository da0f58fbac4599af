//! Process Launcher: spawning and monitoring one external subprocess
//!
//! Supervisors only see [`ProcessLauncher`] and [`ProcessHandle`]. The real
//! implementation ([`TokioLauncher`]) drives `tokio::process`; tests swap in
//! [`crate::testing::ScriptedLauncher`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default time a process gets to exit after a graceful stop request.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

/// Program plus arguments for one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Short tag used in logs, e.g. `hls:camera1`
    pub label: String,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, label: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args,
            label: label.into(),
        }
    }
}

/// Failure to start a process at all. Never reported as an exit.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("executable not found: {0}")]
    NotFound(PathBuf),

    #[error("permission denied launching {0}")]
    PermissionDenied(PathBuf),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LaunchError {
    pub fn from_spawn(program: PathBuf, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => LaunchError::NotFound(program),
            io::ErrorKind::PermissionDenied => LaunchError::PermissionDenied(program),
            _ => LaunchError::Spawn { program, source },
        }
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// The process had to be killed after the grace period
    pub forced: bool,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Synthesised when the event stream closes without an exit notification.
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
            forced: false,
        }
    }

    fn from_status(status: io::Result<std::process::ExitStatus>, forced: bool) -> Self {
        match status {
            Ok(status) => {
                #[cfg(unix)]
                let signal = std::os::unix::process::ExitStatusExt::signal(&status);
                #[cfg(not(unix))]
                let signal = None;
                Self {
                    code: status.code(),
                    signal,
                    forced,
                }
            }
            Err(e) => {
                warn!("Failed to collect exit status: {}", e);
                Self {
                    forced,
                    ..Self::unknown()
                }
            }
        }
    }
}

/// Observable output of a running process, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// One line of diagnostic (stderr) output
    Line(String),
    /// Terminal event, delivered exactly once
    Exited(ExitReport),
}

/// Out-of-band control over a process, shareable with observers that do not
/// own the handle (the health monitor only ever asks `has_exited`).
pub trait ProcessControl: Send + Sync {
    /// Ask the process to finish cleanly.
    fn terminate(&self);
    /// Forcefully kill the process.
    fn kill(&self);
    /// Ground truth about whether the OS process is gone.
    fn has_exited(&self) -> bool;
    fn pid(&self) -> Option<u32>;
}

/// Owned handle to one running subprocess.
pub struct ProcessHandle {
    label: String,
    started_at: DateTime<Utc>,
    events: mpsc::UnboundedReceiver<ProcessEvent>,
    control: Arc<dyn ProcessControl>,
    exit: Option<ExitReport>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("label", &self.label)
            .field("pid", &self.control.pid())
            .field("started_at", &self.started_at)
            .field("exit", &self.exit)
            .finish()
    }
}

impl ProcessHandle {
    pub fn new(
        label: impl Into<String>,
        events: mpsc::UnboundedReceiver<ProcessEvent>,
        control: Arc<dyn ProcessControl>,
    ) -> Self {
        Self {
            label: label.into(),
            started_at: Utc::now(),
            events,
            control,
            exit: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.control.pid()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn control(&self) -> Arc<dyn ProcessControl> {
        Arc::clone(&self.control)
    }

    /// Exit already delivered through [`next_event`](Self::next_event), if any.
    pub fn exit_report(&self) -> Option<ExitReport> {
        self.exit
    }

    /// Next line or the exit. Returns `None` once the exit has been delivered.
    ///
    /// Cancel-safe: usable as a `tokio::select!` branch.
    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        if self.exit.is_some() {
            return None;
        }
        let event = match self.events.recv().await {
            Some(event) => event,
            None => ProcessEvent::Exited(ExitReport::unknown()),
        };
        if let ProcessEvent::Exited(report) = event {
            self.exit = Some(report);
        }
        Some(event)
    }

    /// Next already-queued event, without waiting.
    pub fn try_next_event(&mut self) -> Option<ProcessEvent> {
        if self.exit.is_some() {
            return None;
        }
        let event = match self.events.try_recv() {
            Ok(event) => event,
            Err(mpsc::error::TryRecvError::Empty) => return None,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                ProcessEvent::Exited(ExitReport::unknown())
            }
        };
        if let ProcessEvent::Exited(report) = event {
            self.exit = Some(report);
        }
        Some(event)
    }

    /// Drain events until the process exits, handing each line to `on_line`.
    pub async fn wait_for_exit(&mut self, mut on_line: impl FnMut(&str)) -> ExitReport {
        loop {
            match self.next_event().await {
                Some(ProcessEvent::Line(line)) => on_line(&line),
                Some(ProcessEvent::Exited(report)) => return report,
                None => return self.exit.unwrap_or_else(ExitReport::unknown),
            }
        }
    }

    /// Graceful stop with escalation: request termination, wait up to `grace`,
    /// then kill and wait for the confirmed exit. Consumes the handle.
    pub async fn stop(mut self, grace: Duration) -> ExitReport {
        if let Some(report) = self.exit {
            return report;
        }
        let label = self.label.clone();
        self.control.terminate();
        let graceful = tokio::time::timeout(
            grace,
            self.wait_for_exit(|line| debug!("[{}] {}", label, line)),
        )
        .await;

        match graceful {
            Ok(report) => report,
            Err(_) => {
                warn!(
                    "⏱️  [{}] did not exit within {:?}, killing pid {:?}",
                    self.label,
                    grace,
                    self.control.pid()
                );
                self.control.kill();
                let mut report = self.wait_for_exit(|line| debug!("[{}] {}", label, line)).await;
                report.forced = true;
                report
            }
        }
    }
}

/// Narrow seam between supervisors and the OS.
#[async_trait::async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle, LaunchError>;
}

/// `tokio::process` backed launcher.
///
/// Graceful termination writes `q` to the child's stdin and closes it, which
/// is how ffmpeg expects to be asked to finalise its outputs.
#[derive(Debug, Default, Clone)]
pub struct TokioLauncher;

enum Signal {
    Terminate,
    Kill,
}

struct TokioControl {
    pid: Option<u32>,
    signals: mpsc::UnboundedSender<Signal>,
    exited: Arc<AtomicBool>,
}

impl ProcessControl for TokioControl {
    fn terminate(&self) {
        let _ = self.signals.send(Signal::Terminate);
    }

    fn kill(&self) {
        let _ = self.signals.send(Signal::Kill);
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// How long the stderr reader may lag behind the exit before it is abandoned
/// (grandchildren can hold the pipe open).
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[async_trait::async_trait]
impl ProcessLauncher for TokioLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle, LaunchError> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LaunchError::from_spawn(spec.program.clone(), e))?;

        let pid = child.id();
        debug!("🚀 [{}] spawned pid {:?}", spec.label, pid);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let exited = Arc::new(AtomicBool::new(false));

        let reader = child.stderr.take().map(|stderr| {
            let tx = event_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(ProcessEvent::Line(line)).is_err() {
                        break;
                    }
                }
            })
        });

        let mut stdin = child.stdin.take();
        let exited_flag = Arc::clone(&exited);
        let label = spec.label.clone();
        tokio::spawn(async move {
            let mut forced = false;
            let mut control_open = true;
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    signal = signal_rx.recv(), if control_open => match signal {
                        Some(Signal::Terminate) => {
                            if let Some(mut pipe) = stdin.take() {
                                let _ = pipe.write_all(b"q\n").await;
                                let _ = pipe.shutdown().await;
                            }
                        }
                        Some(Signal::Kill) => {
                            forced = true;
                            if let Err(e) = child.start_kill() {
                                warn!("[{}] kill failed: {}", label, e);
                            }
                        }
                        None => {
                            // Handle dropped without a stop: nobody can observe
                            // this process any more.
                            control_open = false;
                            forced = true;
                            let _ = child.start_kill();
                        }
                    },
                }
            };

            if let Some(reader) = reader {
                let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await;
            }
            exited_flag.store(true, Ordering::SeqCst);
            let report = ExitReport::from_status(status, forced);
            debug!("🏁 [{}] exited: {:?}", label, report);
            let _ = event_tx.send(ProcessEvent::Exited(report));
        });

        let control = Arc::new(TokioControl {
            pid,
            signals: signal_tx,
            exited,
        });
        Ok(ProcessHandle::new(spec.label.clone(), event_rx, control))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::new("/bin/sh", vec!["-c".to_string(), script.to_string()], "test")
    }

    #[tokio::test]
    async fn test_lines_then_exit_code() {
        let mut handle = TokioLauncher
            .launch(&sh("echo one >&2; echo two >&2; exit 3"))
            .await
            .unwrap();

        let mut lines = Vec::new();
        let report = handle.wait_for_exit(|l| lines.push(l.to_string())).await;

        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(report.code, Some(3));
        assert!(!report.forced);
        assert!(handle.control().has_exited());
        // Exit is reported once only
        assert!(handle.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_failure() {
        let spec = LaunchSpec::new("/definitely/not/here/ffmpeg", vec![], "missing");
        match TokioLauncher.launch(&spec).await {
            Err(LaunchError::NotFound(path)) => {
                assert_eq!(path, PathBuf::from("/definitely/not/here/ffmpeg"))
            }
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_graceful_stop_via_stdin() {
        let handle = TokioLauncher
            .launch(&sh("read cmd; [ \"$cmd\" = q ] && exit 0; exit 9"))
            .await
            .unwrap();

        let report = handle.stop(Duration::from_secs(3)).await;
        assert_eq!(report.code, Some(0));
        assert!(!report.forced);
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let handle = TokioLauncher
            .launch(&sh("trap '' TERM; exec 0</dev/null; sleep 30"))
            .await
            .unwrap();
        let control = handle.control();

        let started = std::time::Instant::now();
        let report = handle.stop(Duration::from_millis(200)).await;

        assert!(report.forced);
        assert_eq!(report.code, None);
        assert_eq!(report.signal, Some(9));
        assert!(control.has_exited());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
