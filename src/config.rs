//! Runtime configuration.
//!
//! Every knob has a typed default; [`Settings::from_env`] overrides them
//! from `READINGFLOW_*` environment variables (and a `.env` file if present).

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::model::{NewTask, TaskId, TaskType};
use crate::payload::TaskInput;
use crate::retry::RetryPolicy;
use crate::runner::store::GracePeriods;

/// Per-stage timing, retry and concurrency limits.
#[derive(Debug, Clone, PartialEq)]
pub struct StageConfig {
    /// A processing task without a heartbeat for this long is stale.
    pub heartbeat_timeout: Duration,
    /// How often a running task heartbeats.
    pub heartbeat_interval: Duration,
    /// How long a claimed task may go before its first heartbeat.
    pub reclaim_grace: Duration,
    /// Claims allowed before a failure becomes permanent.
    pub max_attempts: u32,
    /// Upper bound on a single producer call.
    pub processing_timeout: Duration,
    /// Tasks of this stage one worker runs at once.
    pub concurrency: usize,
    /// Retries within one attempt before the attempt fails.
    pub provider_retry: RetryPolicy,
}

impl StageConfig {
    /// Derive interval (timeout / 5) and grace (2 × timeout) from the timeout.
    pub fn new(heartbeat_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            heartbeat_timeout,
            heartbeat_interval: heartbeat_timeout / 5,
            reclaim_grace: heartbeat_timeout * 2,
            max_attempts,
            processing_timeout: Duration::from_secs(30 * 60),
            concurrency: 1,
            provider_retry: RetryPolicy::None,
        }
    }

    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_provider_retry(mut self, policy: RetryPolicy) -> Self {
        self.provider_retry = policy;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_reclaim_grace(mut self, grace: Duration) -> Self {
        self.reclaim_grace = grace;
        self
    }

    pub fn default_for(task_type: TaskType) -> Self {
        match task_type {
            TaskType::TextGeneration => Self::new(Duration::from_secs(120), 3)
                .with_processing_timeout(Duration::from_secs(15 * 60))
                .with_concurrency(4)
                .with_provider_retry(RetryPolicy::exponential(2)),
            TaskType::AudioGeneration => Self::new(Duration::from_secs(300), 3)
                .with_processing_timeout(Duration::from_secs(30 * 60))
                .with_concurrency(2)
                .with_provider_retry(RetryPolicy::exponential(2)),
            TaskType::PdfGeneration => Self::new(Duration::from_secs(60), 3)
                .with_processing_timeout(Duration::from_secs(5 * 60))
                .with_concurrency(4),
            TaskType::SongGeneration => Self::new(Duration::from_secs(600), 2)
                .with_processing_timeout(Duration::from_secs(30 * 60)),
        }
    }
}

/// Stage settings for the whole pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    stages: HashMap<TaskType, StageConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: TaskType::ALL
                .into_iter()
                .map(|t| (t, StageConfig::default_for(t)))
                .collect(),
        }
    }
}

impl PipelineConfig {
    /// Replace the settings of one stage.
    pub fn with_stage(mut self, task_type: TaskType, stage: StageConfig) -> Self {
        self.stages.insert(task_type, stage);
        self
    }

    pub fn stage(&self, task_type: TaskType) -> StageConfig {
        self.stages
            .get(&task_type)
            .cloned()
            .unwrap_or_else(|| StageConfig::default_for(task_type))
    }

    pub fn grace_periods(&self) -> GracePeriods {
        TaskType::ALL.into_iter().fold(GracePeriods::new(), |grace, t| {
            grace.with(t, self.stage(t).reclaim_grace)
        })
    }

    /// Build a task row for `input` with its stage's limits.
    pub fn new_task(&self, input: TaskInput, source_task_id: Option<TaskId>) -> NewTask {
        let task_type = input.task_type();
        let stage = self.stage(task_type);
        NewTask {
            task_type,
            sequence: input.document().number,
            source_task_id,
            input,
            max_attempts: stage.max_attempts,
            heartbeat_timeout: stage.heartbeat_timeout,
        }
    }
}

/// Settings for a worker process.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Fixed worker id. When unset every built worker gets its own
    /// `worker-{pid}-{token}` id, so workers sharing a process stay distinct.
    pub worker_id: Option<String>,
    /// Wait between claim attempts when nothing is claimable.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Settings for the stale-task sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct ReclaimerConfig {
    pub interval: Duration,
    pub run_on_start: bool,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            run_on_start: true,
        }
    }
}

/// Everything a `readingflow` process needs.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub max_connections: u32,
    pub port: u16,
    pub pipeline: PipelineConfig,
    pub worker: WorkerConfig,
    pub reclaimer: ReclaimerConfig,
}

impl Settings {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = lookup("READINGFLOW_DATABASE_URL")
            .unwrap_or_else(|| "sqlite://readingflow.db".to_string());
        let max_connections = parse_or(&lookup, "READINGFLOW_MAX_CONNECTIONS", 5)?;
        let port = parse_or(&lookup, "READINGFLOW_PORT", 8080)?;

        let worker_defaults = WorkerConfig::default();
        let worker = WorkerConfig {
            worker_id: lookup("READINGFLOW_WORKER_ID").or(worker_defaults.worker_id),
            poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "READINGFLOW_POLL_INTERVAL_MS",
                worker_defaults.poll_interval.as_millis() as u64,
            )?),
        };

        let reclaimer_defaults = ReclaimerConfig::default();
        let reclaimer = ReclaimerConfig {
            interval: Duration::from_secs(parse_or(
                &lookup,
                "READINGFLOW_RECLAIM_INTERVAL_SECS",
                reclaimer_defaults.interval.as_secs(),
            )?),
            run_on_start: parse_or(
                &lookup,
                "READINGFLOW_RECLAIM_ON_START",
                reclaimer_defaults.run_on_start,
            )?,
        };

        let mut pipeline = PipelineConfig::default();
        for task_type in TaskType::ALL {
            let stage = stage_from_lookup(&lookup, task_type)?;
            pipeline = pipeline.with_stage(task_type, stage);
        }

        Ok(Self {
            database_url,
            max_connections,
            port,
            pipeline,
            worker,
            reclaimer,
        })
    }
}

fn stage_prefix(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::TextGeneration => "READINGFLOW_TEXT",
        TaskType::AudioGeneration => "READINGFLOW_AUDIO",
        TaskType::PdfGeneration => "READINGFLOW_PDF",
        TaskType::SongGeneration => "READINGFLOW_SONG",
    }
}

fn stage_from_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    task_type: TaskType,
) -> Result<StageConfig> {
    let prefix = stage_prefix(task_type);
    let defaults = StageConfig::default_for(task_type);
    let key = |name: &str| format!("{prefix}_{name}");

    let timeout = Duration::from_secs(parse_or(
        lookup,
        &key("HEARTBEAT_TIMEOUT_SECS"),
        defaults.heartbeat_timeout.as_secs(),
    )?);
    let max_attempts = parse_or(lookup, &key("MAX_ATTEMPTS"), defaults.max_attempts)?;

    // Interval and grace follow a changed timeout unless set explicitly.
    let mut stage = StageConfig::new(timeout, max_attempts)
        .with_processing_timeout(Duration::from_secs(parse_or(
            lookup,
            &key("PROCESSING_TIMEOUT_SECS"),
            defaults.processing_timeout.as_secs(),
        )?))
        .with_concurrency(parse_or(lookup, &key("CONCURRENCY"), defaults.concurrency)?)
        .with_provider_retry(defaults.provider_retry);

    if let Some(secs) = parse_opt::<u64>(lookup, &key("HEARTBEAT_INTERVAL_SECS"))? {
        stage = stage.with_heartbeat_interval(Duration::from_secs(secs));
    }
    if let Some(secs) = parse_opt::<u64>(lookup, &key("RECLAIM_GRACE_SECS"))? {
        stage = stage.with_reclaim_grace(Duration::from_secs(secs));
    }
    Ok(stage)
}

fn parse_opt<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("{key} must be a valid value, got {raw:?}"))
        })
        .transpose()
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(parse_opt(lookup, key)?.unwrap_or(default))
}
