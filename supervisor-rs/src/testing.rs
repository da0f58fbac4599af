//! Test doubles for the supervisor seams
//!
//! [`ScriptedLauncher`] stands in for ffmpeg, [`ManualSchedule`] for the wall
//! clock and [`MemoryCatalog`] for SQLite. The server crate's tests use them
//! too, which is why this module is always compiled.

use crate::catalog::{CatalogError, NewSegment, SegmentCatalog, SegmentRecord};
use crate::launcher::{
    ExitReport, LaunchError, LaunchSpec, ProcessControl, ProcessEvent, ProcessHandle, ProcessLauncher,
};
use crate::schedule::{Schedule, Ticker};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// What a fake process does when asked to terminate gracefully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminateBehaviour {
    /// Exit with code 0, like ffmpeg after `q`
    #[default]
    ExitCleanly,
    /// Keep running until killed
    Ignore,
}

struct FakeShared {
    pid: u32,
    behaviour: TerminateBehaviour,
    /// OS-level truth
    exited: AtomicBool,
    /// Exit event delivered to the handle
    reported: AtomicBool,
    terminate_requests: AtomicUsize,
    kill_requests: AtomicUsize,
}

/// Test-side view of one launched fake process.
#[derive(Clone)]
pub struct FakeProcess {
    spec: LaunchSpec,
    events: mpsc::UnboundedSender<ProcessEvent>,
    shared: Arc<FakeShared>,
}

impl FakeProcess {
    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn label(&self) -> &str {
        &self.spec.label
    }

    pub fn args(&self) -> &[String] {
        &self.spec.args
    }

    pub fn pid(&self) -> u32 {
        self.shared.pid
    }

    /// Write one diagnostic line.
    pub fn emit(&self, line: &str) {
        let _ = self.events.send(ProcessEvent::Line(line.to_string()));
    }

    fn report(&self, report: ExitReport) {
        self.shared.exited.store(true, Ordering::SeqCst);
        if !self.shared.reported.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(ProcessEvent::Exited(report));
        }
    }

    /// Exit with `code`.
    pub fn exit(&self, code: i32) {
        self.report(ExitReport {
            code: Some(code),
            signal: None,
            forced: false,
        });
    }

    /// Die without the exit notification ever reaching the handle.
    pub fn exit_silently(&self) {
        self.shared.exited.store(true, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        !self.shared.exited.load(Ordering::SeqCst)
    }

    pub fn terminate_requests(&self) -> usize {
        self.shared.terminate_requests.load(Ordering::SeqCst)
    }

    pub fn kill_requests(&self) -> usize {
        self.shared.kill_requests.load(Ordering::SeqCst)
    }
}

struct FakeControl(FakeProcess);

impl ProcessControl for FakeControl {
    fn terminate(&self) {
        let shared = &self.0.shared;
        shared.terminate_requests.fetch_add(1, Ordering::SeqCst);
        if shared.behaviour == TerminateBehaviour::ExitCleanly && self.0.is_live() {
            self.0.exit(0);
        }
    }

    fn kill(&self) {
        self.0.shared.kill_requests.fetch_add(1, Ordering::SeqCst);
        self.0.report(ExitReport {
            code: None,
            signal: Some(9),
            forced: true,
        });
    }

    fn has_exited(&self) -> bool {
        !self.0.is_live()
    }

    fn pid(&self) -> Option<u32> {
        Some(self.0.shared.pid)
    }
}

#[derive(Default)]
struct LauncherState {
    launched: Vec<FakeProcess>,
    failures: VecDeque<LaunchError>,
    behaviour: TerminateBehaviour,
    max_live: HashMap<String, usize>,
}

/// Fake [`ProcessLauncher`] recording every launch and handing the test a
/// [`FakeProcess`] to drive.
#[derive(Clone, Default)]
pub struct ScriptedLauncher {
    state: Arc<Mutex<LauncherState>>,
    next_pid: Arc<AtomicU32>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LauncherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Behaviour of processes launched from now on.
    pub fn set_terminate_behaviour(&self, behaviour: TerminateBehaviour) {
        self.lock().behaviour = behaviour;
    }

    /// Make the next launch fail with `error`.
    pub fn fail_next_launch(&self, error: LaunchError) {
        self.lock().failures.push_back(error);
    }

    pub fn launch_count(&self) -> usize {
        self.lock().launched.len()
    }

    pub fn launched(&self) -> Vec<FakeProcess> {
        self.lock().launched.clone()
    }

    pub fn with_label(&self, label: &str) -> Vec<FakeProcess> {
        self.lock()
            .launched
            .iter()
            .filter(|p| p.label() == label)
            .cloned()
            .collect()
    }

    /// Processes with `label` that have not exited.
    pub fn live_count(&self, label: &str) -> usize {
        self.lock()
            .launched
            .iter()
            .filter(|p| p.label() == label && p.is_live())
            .count()
    }

    /// Highest number of simultaneously live processes ever seen for `label`.
    pub fn max_live(&self, label: &str) -> usize {
        self.lock().max_live.get(label).copied().unwrap_or(0)
    }

    /// The `n`th launch (0-based), waiting up to 5s for it to happen.
    pub async fn nth(&self, n: usize) -> FakeProcess {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(process) = self.lock().launched.get(n).cloned() {
                return process;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("launch #{} never happened ({} so far)", n, self.launch_count());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait::async_trait]
impl ProcessLauncher for ScriptedLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle, LaunchError> {
        let mut state = self.lock();
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let process = FakeProcess {
            spec: spec.clone(),
            events: tx,
            shared: Arc::new(FakeShared {
                pid: 10_000 + self.next_pid.fetch_add(1, Ordering::SeqCst),
                behaviour: state.behaviour,
                exited: AtomicBool::new(false),
                reported: AtomicBool::new(false),
                terminate_requests: AtomicUsize::new(0),
                kill_requests: AtomicUsize::new(0),
            }),
        };
        state.launched.push(process.clone());

        let live = state
            .launched
            .iter()
            .filter(|p| p.label() == spec.label && p.is_live())
            .count();
        let max = state.max_live.entry(spec.label.clone()).or_insert(0);
        *max = (*max).max(live);

        Ok(ProcessHandle::new(
            spec.label.clone(),
            rx,
            Arc::new(FakeControl(process)),
        ))
    }
}

struct ManualInner {
    fire: watch::Sender<u64>,
    periods: Mutex<Vec<Duration>>,
}

/// A [`Schedule`] whose tickers fire only when the test calls [`fire`](Self::fire).
#[derive(Clone)]
pub struct ManualSchedule {
    inner: Arc<ManualInner>,
}

impl Default for ManualSchedule {
    fn default() -> Self {
        Self::new()
    }
}

struct ManualTicker(watch::Receiver<u64>);

#[async_trait::async_trait]
impl Ticker for ManualTicker {
    async fn tick(&mut self) {
        if self.0.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl ManualSchedule {
    pub fn new() -> Self {
        let (fire, _) = watch::channel(0);
        Self {
            inner: Arc::new(ManualInner {
                fire,
                periods: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Tick every ticker created so far.
    pub fn fire(&self) {
        self.inner.fire.send_modify(|n| *n += 1);
    }

    pub fn ticker_count(&self) -> usize {
        self.inner
            .periods
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Periods requested, in creation order.
    pub fn periods(&self) -> Vec<Duration> {
        self.inner
            .periods
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait (up to 5s) until `n` tickers exist, so a `fire` is not missed.
    pub async fn wait_for_tickers(&self, n: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.ticker_count() < n {
            if tokio::time::Instant::now() >= deadline {
                panic!("expected {} tickers, have {}", n, self.ticker_count());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Schedule for ManualSchedule {
    fn ticker(&self, period: Duration) -> Box<dyn Ticker> {
        self.inner
            .periods
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(period);
        Box::new(ManualTicker(self.inner.fire.subscribe()))
    }
}

/// In-memory [`SegmentCatalog`].
#[derive(Default)]
pub struct MemoryCatalog {
    rows: Mutex<Vec<SegmentRecord>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<SegmentRecord> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait::async_trait]
impl SegmentCatalog for MemoryCatalog {
    async fn insert(&self, segment: NewSegment) -> Result<SegmentRecord, CatalogError> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let id = rows.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        let record = SegmentRecord {
            id,
            filename: segment.filename,
            path: segment.path,
            created_at: segment.created_at,
            retain: segment.retain,
        };
        rows.push(record.clone());
        Ok(record)
    }

    async fn mark_retained(&self, filename: &str) -> Result<bool, CatalogError> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let mut found = false;
        for row in rows.iter_mut().filter(|r| r.filename == filename) {
            row.retain = true;
            found = true;
        }
        Ok(found)
    }

    async fn expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<SegmentRecord>, CatalogError> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rows
            .iter()
            .filter(|r| !r.retain && r.created_at < cutoff)
            .cloned()
            .collect())
    }

    async fn retained(&self) -> Result<Vec<SegmentRecord>, CatalogError> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let mut retained: Vec<SegmentRecord> = rows.iter().filter(|r| r.retain).cloned().collect();
        retained.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(retained)
    }

    async fn find(&self, filename: &str) -> Result<Option<SegmentRecord>, CatalogError> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.iter().find(|r| r.filename == filename).cloned())
    }

    async fn delete(&self, id: i64) -> Result<(), CatalogError> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        rows.retain(|r| r.id != id);
        Ok(())
    }
}
