use std::sync::Arc;
use std::time::Duration;

use super::job::Reclaimer;
use crate::config::ReclaimerConfig;
use crate::runner::coordinator::Coordinator;
use crate::runner::store::TaskStore;

/// Builder for configuring a Reclaimer.
pub struct ReclaimerBuilder<S: TaskStore> {
    coordinator: Arc<Coordinator<S>>,
    config: ReclaimerConfig,
    repair_limit: usize,
}

impl<S: TaskStore + 'static> ReclaimerBuilder<S> {
    /// Create a new reclaimer builder around a shared coordinator.
    pub fn new(coordinator: Arc<Coordinator<S>>) -> Self {
        Self {
            coordinator,
            config: ReclaimerConfig::default(),
            repair_limit: 100,
        }
    }

    /// Time between sweeps.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    /// Set whether to sweep once immediately on start. Defaults to true.
    pub fn run_on_start(mut self, run: bool) -> Self {
        self.config.run_on_start = run;
        self
    }

    /// Upper bound on completed tasks re-expanded per sweep.
    pub fn repair_limit(mut self, limit: usize) -> Self {
        self.repair_limit = limit;
        self
    }

    pub fn config(mut self, config: ReclaimerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the reclaimer.
    pub fn build(self) -> Reclaimer<S> {
        Reclaimer::new(
            self.coordinator,
            self.config.interval,
            self.config.run_on_start,
            self.repair_limit,
        )
    }
}
