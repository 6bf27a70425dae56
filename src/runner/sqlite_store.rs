//! SQLite implementation of TaskStore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::store::{
    truncate_error, Expansion, FailOutcome, GracePeriods, ReclaimReport, SkipReason, TaskError,
    TaskStore,
};
use crate::model::{
    ArtifactId, ArtifactRecord, ClaimedTask, JobId, JobRecord, JobStatus, NewJob, NewTask, TaskId,
    TaskRecord, TaskStatus, TaskType, UnknownVariant,
};
use crate::payload::{TaskInput, TaskOutput};
use crate::progress::{JobSnapshot, Phase};

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS rf_jobs (
        id INTEGER PRIMARY KEY,
        owner_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        params TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'queued',
        phase TEXT NOT NULL DEFAULT 'queued',
        message TEXT,
        percent INTEGER NOT NULL DEFAULT 0,
        completed_tasks INTEGER NOT NULL DEFAULT 0,
        expected_tasks INTEGER NOT NULL,
        error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        completed_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rf_tasks (
        id INTEGER PRIMARY KEY,
        job_id INTEGER NOT NULL REFERENCES rf_jobs(id),
        task_type TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        source_task_id INTEGER REFERENCES rf_tasks(id),
        status TEXT NOT NULL DEFAULT 'pending',
        input TEXT NOT NULL,
        output TEXT,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        worker_id TEXT,
        claimed_at TEXT,
        last_heartbeat TEXT,
        heartbeat_timeout_secs INTEGER NOT NULL,
        error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        completed_at TEXT,
        UNIQUE (job_id, source_task_id, task_type)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_rf_tasks_claim
    ON rf_tasks(task_type, status, sequence, created_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_rf_tasks_status
    ON rf_tasks(status)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_rf_tasks_job
    ON rf_tasks(job_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rf_artifacts (
        id INTEGER PRIMARY KEY,
        job_id INTEGER NOT NULL REFERENCES rf_jobs(id),
        task_id INTEGER REFERENCES rf_tasks(id),
        artifact_type TEXT NOT NULL,
        storage_path TEXT NOT NULL,
        metadata TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (task_id, artifact_type)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_rf_artifacts_job
    ON rf_artifacts(job_id)
    "#,
];

const JOB_COLUMNS: &str = "id, owner_id, kind, params, status, phase, message, percent, \
    completed_tasks, expected_tasks, error, created_at, updated_at, completed_at";

const TASK_COLUMNS: &str = "id, job_id, task_type, sequence, source_task_id, status, input, \
    output, attempts, max_attempts, worker_id, claimed_at, last_heartbeat, \
    heartbeat_timeout_secs, error, created_at, updated_at, completed_at";

const CLAIM_SQL: &str = r#"
    UPDATE rf_tasks
    SET status = 'processing', worker_id = ?, claimed_at = ?, last_heartbeat = NULL,
        attempts = attempts + 1, updated_at = ?
    WHERE id = (
        SELECT t.id FROM rf_tasks t
        JOIN rf_jobs j ON j.id = t.job_id
        WHERE t.task_type = ? AND t.status = 'pending'
          AND j.status IN ('queued', 'processing')
        ORDER BY t.sequence, t.created_at, t.id
        LIMIT 1
    )
    AND status = 'pending'
    RETURNING id, job_id, task_type, sequence, source_task_id, input, attempts,
              max_attempts, heartbeat_timeout_secs
"#;

/// SQLite-backed task store.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Create a new SqliteTaskStore.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `url` in WAL mode.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, TaskError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(storage)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(storage)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run migrations to create the job, task and artifact tables.
    pub async fn run_migrations(&self) -> Result<(), TaskError> {
        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage)?;
        }
        Ok(())
    }
}

fn storage(e: sqlx::Error) -> TaskError {
    TaskError::StorageError(e.to_string())
}

fn to_json<T: Serialize>(value: &T) -> Result<String, TaskError> {
    serde_json::to_string(value).map_err(|e| TaskError::SerializationError(e.to_string()))
}

fn from_json<T: DeserializeOwned>(text: &str) -> Result<T, TaskError> {
    serde_json::from_str(text).map_err(|e| TaskError::DeserializationError(e.to_string()))
}

fn parse<T: FromStr<Err = UnknownVariant>>(text: String) -> Result<T, TaskError> {
    text.parse()
        .map_err(|e: UnknownVariant| TaskError::DeserializationError(e.to_string()))
}

fn get_u32(row: &SqliteRow, column: &str) -> Result<u32, TaskError> {
    let value: i64 = row.try_get(column).map_err(storage)?;
    u32::try_from(value)
        .map_err(|_| TaskError::DeserializationError(format!("{column} out of range: {value}")))
}

fn job_from_row(row: &SqliteRow) -> Result<JobRecord, TaskError> {
    let params: String = row.try_get("params").map_err(storage)?;
    Ok(JobRecord {
        id: JobId(row.try_get("id").map_err(storage)?),
        owner_id: row.try_get("owner_id").map_err(storage)?,
        kind: parse(row.try_get("kind").map_err(storage)?)?,
        request: from_json(&params)?,
        status: parse(row.try_get("status").map_err(storage)?)?,
        phase: row.try_get("phase").map_err(storage)?,
        message: row.try_get("message").map_err(storage)?,
        percent: get_u32(row, "percent")?,
        completed_tasks: get_u32(row, "completed_tasks")?,
        expected_tasks: get_u32(row, "expected_tasks")?,
        error: row.try_get("error").map_err(storage)?,
        created_at: row.try_get("created_at").map_err(storage)?,
        updated_at: row.try_get("updated_at").map_err(storage)?,
        completed_at: row.try_get("completed_at").map_err(storage)?,
    })
}

fn task_from_row(row: &SqliteRow) -> Result<TaskRecord, TaskError> {
    let input: String = row.try_get("input").map_err(storage)?;
    let output: Option<String> = row.try_get("output").map_err(storage)?;
    let source: Option<i64> = row.try_get("source_task_id").map_err(storage)?;
    let timeout: i64 = row.try_get("heartbeat_timeout_secs").map_err(storage)?;
    Ok(TaskRecord {
        id: TaskId(row.try_get("id").map_err(storage)?),
        job_id: JobId(row.try_get("job_id").map_err(storage)?),
        task_type: parse(row.try_get("task_type").map_err(storage)?)?,
        sequence: get_u32(row, "sequence")?,
        source_task_id: source.map(TaskId),
        status: parse(row.try_get("status").map_err(storage)?)?,
        input: from_json(&input)?,
        output: output.as_deref().map(from_json).transpose()?,
        attempts: get_u32(row, "attempts")?,
        max_attempts: get_u32(row, "max_attempts")?,
        worker_id: row.try_get("worker_id").map_err(storage)?,
        claimed_at: row.try_get("claimed_at").map_err(storage)?,
        last_heartbeat: row.try_get("last_heartbeat").map_err(storage)?,
        heartbeat_timeout_secs: timeout.max(0) as u64,
        error: row.try_get("error").map_err(storage)?,
        created_at: row.try_get("created_at").map_err(storage)?,
        updated_at: row.try_get("updated_at").map_err(storage)?,
        completed_at: row.try_get("completed_at").map_err(storage)?,
    })
}

fn artifact_from_row(row: &SqliteRow) -> Result<ArtifactRecord, TaskError> {
    let metadata: String = row.try_get("metadata").map_err(storage)?;
    let task_id: Option<i64> = row.try_get("task_id").map_err(storage)?;
    Ok(ArtifactRecord {
        id: ArtifactId(row.try_get("id").map_err(storage)?),
        job_id: JobId(row.try_get("job_id").map_err(storage)?),
        task_id: task_id.map(TaskId),
        artifact_type: parse(row.try_get("artifact_type").map_err(storage)?)?,
        storage_path: row.try_get("storage_path").map_err(storage)?,
        metadata: from_json(&metadata)?,
        created_at: row.try_get("created_at").map_err(storage)?,
    })
}

/// Insert one task unless its `(job, source, type)` slot is taken.
async fn insert_task(
    conn: &mut SqliteConnection,
    job_id: JobId,
    task: &NewTask,
    now: DateTime<Utc>,
) -> Result<Option<TaskId>, TaskError> {
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO rf_tasks (
            job_id, task_type, sequence, source_task_id, input, max_attempts,
            heartbeat_timeout_secs, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (job_id, source_task_id, task_type) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(job_id.0)
    .bind(task.task_type.as_str())
    .bind(i64::from(task.sequence))
    .bind(task.source_task_id.map(|id| id.0))
    .bind(to_json(&task.input)?)
    .bind(i64::from(task.max_attempts))
    .bind(task.heartbeat_timeout.as_secs() as i64)
    .bind(now)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await
    .map_err(storage)?;

    Ok(id.map(TaskId))
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create_job(&self, job: NewJob) -> Result<JobId, TaskError> {
        let now = Utc::now();
        let params = to_json(&job.request)?;

        let mut tx = self.pool.begin().await.map_err(storage)?;

        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO rf_jobs (owner_id, kind, params, expected_tasks, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&job.owner_id)
        .bind(job.kind.as_str())
        .bind(params)
        .bind(i64::from(job.expected_tasks))
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage)?;
        let job_id = JobId(id);

        for task in &job.tasks {
            insert_task(&mut *tx, job_id, task, now).await?;
        }

        tx.commit().await.map_err(storage)?;

        debug!(job_id = %job_id, tasks = job.tasks.len(), "job created");
        Ok(job_id)
    }

    async fn job(&self, id: JobId) -> Result<Option<JobRecord>, TaskError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM rf_jobs WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn task(&self, id: TaskId) -> Result<Option<TaskRecord>, TaskError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM rf_tasks WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn tasks_for_job(&self, id: JobId) -> Result<Vec<TaskRecord>, TaskError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM rf_tasks WHERE job_id = ? ORDER BY sequence, created_at, id"
        ))
        .bind(id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(task_from_row).collect()
    }

    async fn artifacts_for_job(&self, id: JobId) -> Result<Vec<ArtifactRecord>, TaskError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, task_id, artifact_type, storage_path, metadata, created_at
            FROM rf_artifacts
            WHERE job_id = ?
            ORDER BY id
            "#,
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(artifact_from_row).collect()
    }

    async fn claim_next(
        &self,
        task_type: TaskType,
        worker_id: &str,
    ) -> Result<Option<ClaimedTask>, TaskError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let row = sqlx::query(CLAIM_SQL)
            .bind(worker_id)
            .bind(now)
            .bind(now)
            .bind(task_type.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?;

        let Some(row) = row else {
            tx.commit().await.map_err(storage)?;
            return Ok(None);
        };

        let input: String = row.try_get("input").map_err(storage)?;
        let source: Option<i64> = row.try_get("source_task_id").map_err(storage)?;
        let timeout: i64 = row.try_get("heartbeat_timeout_secs").map_err(storage)?;
        let task = ClaimedTask {
            id: TaskId(row.try_get("id").map_err(storage)?),
            job_id: JobId(row.try_get("job_id").map_err(storage)?),
            task_type: parse(row.try_get("task_type").map_err(storage)?)?,
            sequence: get_u32(&row, "sequence")?,
            source_task_id: source.map(TaskId),
            input: from_json(&input)?,
            attempts: get_u32(&row, "attempts")?,
            max_attempts: get_u32(&row, "max_attempts")?,
            worker_id: worker_id.to_string(),
            claimed_at: now,
            heartbeat_timeout: Duration::from_secs(timeout.max(0) as u64),
        };

        sqlx::query(
            r#"
            UPDATE rf_jobs
            SET status = 'processing', phase = ?, updated_at = ?
            WHERE id = ? AND status = 'queued'
            "#,
        )
        .bind(Phase::GeneratingText.as_str())
        .bind(now)
        .bind(task.job_id.0)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        tx.commit().await.map_err(storage)?;

        Ok(Some(task))
    }

    async fn heartbeat(&self, id: TaskId, worker_id: &str) -> Result<bool, TaskError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE rf_tasks
            SET last_heartbeat = ?, updated_at = ?
            WHERE id = ? AND status = 'processing' AND worker_id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id.0)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete(
        &self,
        id: TaskId,
        worker_id: &str,
        output: &TaskOutput,
    ) -> Result<bool, TaskError> {
        let now = Utc::now();
        let output_json = to_json(output)?;

        let mut tx = self.pool.begin().await.map_err(storage)?;

        let row = sqlx::query(
            r#"
            UPDATE rf_tasks
            SET status = 'complete', output = ?, error = NULL, completed_at = ?, updated_at = ?
            WHERE id = ? AND status = 'processing' AND worker_id = ?
            RETURNING job_id, input
            "#,
        )
        .bind(output_json)
        .bind(now)
        .bind(now)
        .bind(id.0)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?;

        let Some(row) = row else {
            tx.rollback().await.map_err(storage)?;
            return Ok(false);
        };

        let job_id: i64 = row.try_get("job_id").map_err(storage)?;
        let input: String = row.try_get("input").map_err(storage)?;
        let input: TaskInput = from_json(&input)?;
        let artifact = output.artifact(input.document());

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO rf_artifacts
                (job_id, task_id, artifact_type, storage_path, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job_id)
        .bind(id.0)
        .bind(artifact.artifact_type.as_str())
        .bind(&artifact.storage_path)
        .bind(to_json(&artifact.metadata)?)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        tx.commit().await.map_err(storage)?;

        Ok(true)
    }

    async fn fail(
        &self,
        id: TaskId,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<Option<FailOutcome>, TaskError> {
        let now = Utc::now();
        let error = truncate_error(error);

        let row = sqlx::query(
            r#"
            SELECT job_id, attempts, max_attempts FROM rf_tasks
            WHERE id = ? AND status = 'processing' AND worker_id = ?
            "#,
        )
        .bind(id.0)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job_id = JobId(row.try_get("job_id").map_err(storage)?);
        let attempts = get_u32(&row, "attempts")?;
        let max_attempts = get_u32(&row, "max_attempts")?;

        let retry = retryable && attempts < max_attempts;
        let sql = if retry {
            r#"
            UPDATE rf_tasks
            SET status = 'pending', worker_id = NULL, claimed_at = NULL, last_heartbeat = NULL,
                error = ?, updated_at = ?
            WHERE id = ? AND status = 'processing' AND worker_id = ? AND attempts = ?
            "#
        } else {
            r#"
            UPDATE rf_tasks
            SET status = 'failed', error = ?, completed_at = ?, updated_at = ?
            WHERE id = ? AND status = 'processing' AND worker_id = ? AND attempts = ?
            "#
        };

        let mut query = sqlx::query(sql).bind(error).bind(now);
        if !retry {
            query = query.bind(now);
        }
        let result = query
            .bind(id.0)
            .bind(worker_id)
            .bind(i64::from(attempts))
            .execute(&self.pool)
            .await
            .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(FailOutcome {
            job_id,
            status: if retry {
                TaskStatus::Pending
            } else {
                TaskStatus::Failed
            },
            attempts,
            max_attempts,
        }))
    }

    async fn force_fail(
        &self,
        id: TaskId,
        worker_id: &str,
        error: &str,
    ) -> Result<Option<JobId>, TaskError> {
        let now = Utc::now();
        let job_id = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE rf_tasks
            SET status = 'failed', error = ?, completed_at = ?, updated_at = ?
            WHERE id = ? AND status = 'processing' AND worker_id = ?
            RETURNING job_id
            "#,
        )
        .bind(truncate_error(error))
        .bind(now)
        .bind(now)
        .bind(id.0)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        Ok(job_id.map(JobId))
    }

    async fn fail_job(&self, id: JobId, error: &str) -> Result<bool, TaskError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE rf_jobs
            SET status = 'error', phase = ?, message = ?, error = ?,
                completed_at = ?, updated_at = ?
            WHERE id = ? AND status IN ('queued', 'processing')
            "#,
        )
        .bind(Phase::Error.as_str())
        .bind("worker fault")
        .bind(truncate_error(error))
        .bind(now)
        .bind(now)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected() == 1)
    }

    async fn cancel_job(&self, id: JobId) -> Result<bool, TaskError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE rf_jobs
            SET status = 'cancelled', phase = ?, message = 'cancelled',
                completed_at = ?, updated_at = ?
            WHERE id = ? AND status IN ('queued', 'processing')
            "#,
        )
        .bind(Phase::Cancelled.as_str())
        .bind(now)
        .bind(now)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected() == 1)
    }

    async fn expand(&self, source: TaskId, tasks: Vec<NewTask>) -> Result<Expansion, TaskError> {
        let row = sqlx::query(
            r#"
            SELECT t.job_id, t.status AS task_status, j.status AS job_status
            FROM rf_tasks t
            JOIN rf_jobs j ON j.id = t.job_id
            WHERE t.id = ?
            "#,
        )
        .bind(source.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?
        .ok_or(TaskError::TaskNotFound(source))?;

        let job_id = JobId(row.try_get("job_id").map_err(storage)?);
        let task_status: TaskStatus = parse(row.try_get("task_status").map_err(storage)?)?;
        let job_status: JobStatus = parse(row.try_get("job_status").map_err(storage)?)?;

        if task_status != TaskStatus::Complete {
            return Ok(Expansion::Skipped(SkipReason::UpstreamNotComplete));
        }
        if job_status.is_terminal() {
            return Ok(Expansion::Skipped(SkipReason::JobInactive));
        }

        let now = Utc::now();
        let mut created = Vec::new();
        let mut existing = Vec::new();

        let mut tx = self.pool.begin().await.map_err(storage)?;
        for task in &tasks {
            match insert_task(&mut *tx, job_id, task, now).await? {
                Some(id) => created.push(id),
                None => {
                    let id = sqlx::query_scalar::<_, i64>(
                        r#"
                        SELECT id FROM rf_tasks
                        WHERE job_id = ? AND source_task_id = ? AND task_type = ?
                        "#,
                    )
                    .bind(job_id.0)
                    .bind(task.source_task_id.map(|id| id.0))
                    .bind(task.task_type.as_str())
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(storage)?;
                    existing.push(TaskId(id));
                }
            }
        }
        tx.commit().await.map_err(storage)?;

        Ok(Expansion::Inserted { created, existing })
    }

    async fn unexpanded_tasks(&self, limit: usize) -> Result<Vec<TaskRecord>, TaskError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM rf_tasks
            WHERE id IN (
                SELECT t.id FROM rf_tasks t
                JOIN rf_jobs j ON j.id = t.job_id
                WHERE t.status = 'complete'
                  AND (t.task_type = 'text_generation'
                       OR (t.task_type = 'audio_generation'
                           AND json_extract(t.input, '$.lyrics_path') IS NOT NULL))
                  AND j.status IN ('queued', 'processing')
                  AND NOT EXISTS (SELECT 1 FROM rf_tasks d WHERE d.source_task_id = t.id)
            )
            ORDER BY id
            LIMIT ?
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(task_from_row).collect()
    }

    async fn reclaim_stale(
        &self,
        now: DateTime<Utc>,
        grace: &GracePeriods,
    ) -> Result<ReclaimReport, TaskError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, task_type, worker_id, attempts, max_attempts,
                   claimed_at, last_heartbeat, heartbeat_timeout_secs
            FROM rf_tasks
            WHERE status = 'processing'
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        let mut report = ReclaimReport::default();

        for row in &rows {
            let id = TaskId(row.try_get("id").map_err(storage)?);
            let job_id = JobId(row.try_get("job_id").map_err(storage)?);
            let task_type: TaskType = parse(row.try_get("task_type").map_err(storage)?)?;
            let worker_id: Option<String> = row.try_get("worker_id").map_err(storage)?;
            let attempts = get_u32(row, "attempts")?;
            let max_attempts = get_u32(row, "max_attempts")?;
            let claimed_at: Option<DateTime<Utc>> = row.try_get("claimed_at").map_err(storage)?;
            let last_heartbeat: Option<DateTime<Utc>> =
                row.try_get("last_heartbeat").map_err(storage)?;
            let timeout: i64 = row.try_get("heartbeat_timeout_secs").map_err(storage)?;
            let timeout = Duration::from_secs(timeout.max(0) as u64);

            let (since, allowed) = match last_heartbeat {
                Some(beat) => (beat, timeout),
                None => (
                    claimed_at.unwrap_or(now),
                    grace.for_task(task_type, timeout),
                ),
            };
            let idle = now.signed_duration_since(since).to_std().unwrap_or_default();
            if idle <= allowed {
                continue;
            }

            if attempts < max_attempts {
                let result = sqlx::query(
                    r#"
                    UPDATE rf_tasks
                    SET status = 'pending', worker_id = NULL, claimed_at = NULL,
                        last_heartbeat = NULL, updated_at = ?
                    WHERE id = ? AND status = 'processing' AND worker_id IS ? AND attempts = ?
                    "#,
                )
                .bind(now)
                .bind(id.0)
                .bind(worker_id.as_deref())
                .bind(i64::from(attempts))
                .execute(&self.pool)
                .await
                .map_err(storage)?;

                if result.rows_affected() == 1 {
                    info!(
                        task_id = %id,
                        job_id = %job_id,
                        worker_id = worker_id.as_deref().unwrap_or("-"),
                        idle_secs = idle.as_secs(),
                        attempts,
                        "reclaimed stale task"
                    );
                    report.reset.push(id);
                }
            } else {
                let error = format!(
                    "worker {} stopped responding ({}s without heartbeat) on attempt {} of {}",
                    worker_id.as_deref().unwrap_or("unknown"),
                    idle.as_secs(),
                    attempts,
                    max_attempts
                );
                let result = sqlx::query(
                    r#"
                    UPDATE rf_tasks
                    SET status = 'failed', error = ?, completed_at = ?, updated_at = ?
                    WHERE id = ? AND status = 'processing' AND worker_id IS ? AND attempts = ?
                    "#,
                )
                .bind(truncate_error(&error))
                .bind(now)
                .bind(now)
                .bind(id.0)
                .bind(worker_id.as_deref())
                .bind(i64::from(attempts))
                .execute(&self.pool)
                .await
                .map_err(storage)?;

                if result.rows_affected() == 1 {
                    warn!(
                        task_id = %id,
                        job_id = %job_id,
                        attempts,
                        "stale task out of attempts, marked failed"
                    );
                    report.failed.push((id, job_id));
                }
            }
        }

        Ok(report)
    }

    async fn reset_task(&self, id: TaskId) -> Result<bool, TaskError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE rf_tasks
            SET status = 'pending', worker_id = NULL, claimed_at = NULL,
                last_heartbeat = NULL, updated_at = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(now)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_progress(
        &self,
        id: JobId,
        snapshot: &JobSnapshot,
    ) -> Result<bool, TaskError> {
        let now = Utc::now();
        let terminal = snapshot.status.is_terminal();
        let completed_at = terminal.then_some(now);

        let result = sqlx::query(
            r#"
            UPDATE rf_jobs
            SET status = ?, phase = ?, message = ?, percent = ?, completed_tasks = ?,
                error = ?, completed_at = COALESCE(?, completed_at), updated_at = ?
            WHERE id = ? AND status IN ('queued', 'processing')
            "#,
        )
        .bind(snapshot.status.as_str())
        .bind(snapshot.phase.as_str())
        .bind(&snapshot.message)
        .bind(i64::from(snapshot.percent))
        .bind(i64::from(snapshot.completed))
        .bind(snapshot.error.as_deref().map(truncate_error))
        .bind(completed_at)
        .bind(now)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(terminal && result.rows_affected() == 1)
    }
}
