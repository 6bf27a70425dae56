use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::runner::coordinator::Coordinator;
use crate::runner::store::{ReclaimReport, TaskError, TaskStore};

/// Result of one reclaimer pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: ReclaimReport,
    /// Downstream tasks inserted for completed tasks that were never expanded.
    pub repaired: usize,
}

/// Periodic watchdog that recovers tasks from dead workers.
///
/// It runs independently of any worker; several reclaimers may share a
/// store since every transition they make is conditional.
pub struct Reclaimer<S: TaskStore> {
    coordinator: Arc<Coordinator<S>>,
    interval: Duration,
    run_on_start: bool,
    repair_limit: usize,
}

impl<S: TaskStore + 'static> Reclaimer<S> {
    pub(crate) fn new(
        coordinator: Arc<Coordinator<S>>,
        interval: Duration,
        run_on_start: bool,
        repair_limit: usize,
    ) -> Self {
        Self {
            coordinator,
            interval,
            run_on_start,
            repair_limit,
        }
    }

    /// Sweep on every tick until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            run_on_start = self.run_on_start,
            "Starting reclaimer"
        );

        // Run immediately if configured
        if self.run_on_start {
            self.execute_sweep().await;
        }

        let mut ticker = interval(self.interval);
        ticker.tick().await; // Consume immediate first tick

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.execute_sweep().await,
            }
        }

        info!("Reclaimer stopped");
    }

    /// One pass: reclaim stale tasks, then repair missed expansions.
    pub async fn sweep_once(&self) -> Result<SweepReport, TaskError> {
        let reclaimed = self.coordinator.reclaim_stale(Utc::now()).await?;
        let repaired = self
            .coordinator
            .repair_expansions(self.repair_limit)
            .await?
            .len();
        Ok(SweepReport {
            reclaimed,
            repaired,
        })
    }

    async fn execute_sweep(&self) {
        debug!("Executing reclaim sweep");

        match self.sweep_once().await {
            Ok(report) if report.reclaimed.is_empty() && report.repaired == 0 => {
                debug!("Nothing to reclaim");
            }
            Ok(report) => info!(
                reset = report.reclaimed.reset.len(),
                failed = report.reclaimed.failed.len(),
                repaired = report.repaired,
                "Reclaim sweep finished"
            ),
            Err(e) => error!(error = %e, "Reclaim sweep failed"),
        }
    }
}
