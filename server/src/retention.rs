//! Retention sweep for recorded segments
//!
//! Unretained catalog rows older than the retention threshold are removed
//! from disk and then from the catalog. Retained rows are never touched.

use camgate_supervisor::{CatalogError, PeriodicTask, Schedule, SegmentCatalog};
use chrono::{DateTime, Utc};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepOutcome {
    pub deleted: Vec<String>,
    /// Rows left in place because their file could not be removed
    pub failed: Vec<String>,
}

/// One retention pass relative to `now`. A zero `retention` disables the sweep.
pub async fn run_sweep(
    catalog: &dyn SegmentCatalog,
    retention: Duration,
    now: DateTime<Utc>,
) -> Result<SweepOutcome, CatalogError> {
    let mut outcome = SweepOutcome::default();
    if retention.is_zero() {
        return Ok(outcome);
    }
    let Ok(retention) = chrono::Duration::from_std(retention) else {
        return Ok(outcome);
    };
    let cutoff = now - retention;

    for row in catalog.expired(cutoff).await? {
        // Catalog row goes only once the file is gone, so a failure is retried
        match tokio::fs::remove_file(&row.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Expired segment {} was already gone", row.filename);
            }
            Err(e) => {
                warn!("Failed to delete expired segment {:?}: {}", row.path, e);
                outcome.failed.push(row.filename);
                continue;
            }
        }
        catalog.delete(row.id).await?;
        outcome.deleted.push(row.filename);
    }

    if !outcome.deleted.is_empty() {
        info!("🗑️ Retention sweep deleted {} segment(s)", outcome.deleted.len());
    }
    Ok(outcome)
}

/// Run [`run_sweep`] on every tick of `schedule`.
pub fn spawn(
    catalog: Arc<dyn SegmentCatalog>,
    retention: Duration,
    schedule: &dyn Schedule,
    period: Duration,
) -> PeriodicTask {
    PeriodicTask::spawn("retention-sweep", schedule.ticker(period), move || {
        let catalog = Arc::clone(&catalog);
        async move {
            if let Err(e) = run_sweep(catalog.as_ref(), retention, Utc::now()).await {
                error!("Retention sweep failed: {}", e);
            }
        }
    })
}
