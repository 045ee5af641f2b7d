//! Durable priority job queue
//!
//! Jobs live in the same SQLite database as the task rows, keyed by the
//! task id, so a task is queued at most once and the create+enqueue pair
//! can share one transaction. Workers claim the highest-priority due job
//! atomically, heartbeat while processing, and hand failures to the
//! retry policy: exponential backoff up to the attempt cap, immediate
//! failure for errors the caller marks non-retryable. A sweeper returns
//! jobs whose heartbeat went quiet to the claimable set.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool, Transaction};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Queue name shared by every pipeline instance
pub const QUEUE_NAME: &str = "requirement-processing";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    queue TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 3,
    state TEXT NOT NULL DEFAULT 'waiting',
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    run_at TEXT,
    heartbeat_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(queue, state, priority, created_at);
"#;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("unknown job state '{0}'")]
    BadState(String),

    #[error("no processor registered")]
    NoProcessor,
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-side lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
    Stalled,
    NotFound,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Stalled => "stalled",
            JobState::NotFound => "not-found",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "delayed" => Some(JobState::Delayed),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "stalled" => Some(JobState::Stalled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Snapshot of one job, as returned by [`JobQueue::job_status`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub state: JobState,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Counts per state plus their sum
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub delayed: i64,
    pub total: i64,
    pub timestamp: DateTime<Utc>,
}

/// Context handed to the processor for one attempt
#[derive(Debug, Clone, Copy)]
pub struct JobContext {
    pub task_id: Uuid,
    /// 1-based attempt counter
    pub attempt: u32,
    pub max_attempts: u32,
}

impl JobContext {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Failure returned by a processor
#[derive(Debug)]
pub struct ProcessError {
    pub message: String,
    /// Retryable errors re-enter the backoff schedule; others fail the
    /// job immediately regardless of attempts left.
    pub retryable: bool,
}

impl ProcessError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: true }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: false }
    }
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Work callback bound via [`JobQueue::register_processor`]
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, ctx: JobContext) -> Result<(), ProcessError>;
}

/// Tunables for the worker pool and retry policy
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Upper bound on concurrently processing workers
    pub concurrency: usize,
    /// Total attempts, the first included
    pub max_attempts: u32,
    /// First retry delay; doubles per subsequent attempt
    pub backoff_base: Duration,
    /// Idle poll interval when no job is due
    pub poll_interval: Duration,
    /// Heartbeat write cadence while a job is active
    pub heartbeat_interval: Duration,
    /// Active jobs silent longer than this are considered stalled
    pub stall_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_attempts: 3,
            backoff_base: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(15),
            stall_timeout: Duration::from_secs(60),
        }
    }
}

/// Durable priority queue plus its worker pool
pub struct JobQueue {
    pool: SqlitePool,
    config: QueueConfig,
    processor: std::sync::RwLock<Option<Arc<dyn JobProcessor>>>,
}

impl JobQueue {
    pub fn new(pool: SqlitePool, config: QueueConfig) -> Self {
        Self { pool, config, processor: std::sync::RwLock::new(None) }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub async fn init_schema(&self) -> QueueResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        debug!("job queue schema initialized");
        Ok(())
    }

    /// Bind the callback invoked for each claimed job.
    pub fn register_processor(&self, processor: Arc<dyn JobProcessor>) {
        *self.processor.write().expect("processor lock poisoned") = Some(processor);
    }

    /// Enqueue a task within an open transaction.
    ///
    /// Idempotent while an earlier job for the same task is non-terminal:
    /// the existing job is left untouched and its id (== the task id) is
    /// returned. A terminal job is reset for another run, which is the
    /// re-queue path.
    pub async fn enqueue_tx(
        &self,
        tx: &mut Transaction<'_, sqlx::Sqlite>,
        task_id: Uuid,
        priority_rank: i64,
    ) -> QueueResult<Uuid> {
        let now = Utc::now().to_rfc3339();
        let existing: Option<String> =
            sqlx::query_scalar("SELECT state FROM jobs WHERE id = ?1 AND queue = ?2")
                .bind(task_id.to_string())
                .bind(QUEUE_NAME)
                .fetch_optional(&mut **tx)
                .await?;

        match existing.as_deref().and_then(JobState::parse) {
            None => {
                sqlx::query(
                    r#"INSERT INTO jobs (id, queue, priority, state, attempts, created_at, updated_at)
                       VALUES (?1, ?2, ?3, 'waiting', 0, ?4, ?4)"#,
                )
                .bind(task_id.to_string())
                .bind(QUEUE_NAME)
                .bind(priority_rank)
                .bind(&now)
                .execute(&mut **tx)
                .await?;
                debug!(job = %task_id, priority = priority_rank, "job enqueued");
            }
            Some(state) if state.is_terminal() => {
                sqlx::query(
                    r#"UPDATE jobs SET state = 'waiting', attempts = 0, priority = ?1,
                       last_error = NULL, run_at = NULL, heartbeat_at = NULL, updated_at = ?2
                       WHERE id = ?3"#,
                )
                .bind(priority_rank)
                .bind(&now)
                .bind(task_id.to_string())
                .execute(&mut **tx)
                .await?;
                debug!(job = %task_id, "terminal job reset for re-queue");
            }
            Some(_) => {
                debug!(job = %task_id, "job already queued, enqueue is a no-op");
            }
        }
        Ok(task_id)
    }

    /// Enqueue outside any caller transaction.
    pub async fn enqueue(&self, task_id: Uuid, priority_rank: i64) -> QueueResult<Uuid> {
        let mut tx = self.pool.begin().await?;
        let id = self.enqueue_tx(&mut tx, task_id, priority_rank).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Queue-side view of one job; `NotFound` for unknown ids.
    pub async fn job_status(&self, job_id: Uuid) -> QueueResult<JobSnapshot> {
        let row = sqlx::query(
            "SELECT state, attempts, last_error FROM jobs WHERE id = ?1 AND queue = ?2",
        )
        .bind(job_id.to_string())
        .bind(QUEUE_NAME)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(JobSnapshot { id: job_id, state: JobState::NotFound, attempts: 0, last_error: None });
        };
        let state: String = row.try_get("state")?;
        Ok(JobSnapshot {
            id: job_id,
            state: JobState::parse(&state).ok_or(QueueError::BadState(state))?,
            attempts: row.try_get::<i64, _>("attempts")? as u32,
            last_error: row.try_get("last_error")?,
        })
    }

    /// Counts per state. Stalled jobs are claimable again, so they count
    /// as waiting.
    pub async fn stats(&self) -> QueueResult<QueueStats> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs WHERE queue = ?1 GROUP BY state")
            .bind(QUEUE_NAME)
            .fetch_all(&self.pool)
            .await?;

        let mut stats = QueueStats {
            waiting: 0,
            active: 0,
            completed: 0,
            failed: 0,
            delayed: 0,
            total: 0,
            timestamp: Utc::now(),
        };
        for row in rows {
            let state: String = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            match JobState::parse(&state) {
                Some(JobState::Waiting) | Some(JobState::Stalled) => stats.waiting += n,
                Some(JobState::Active) => stats.active += n,
                Some(JobState::Delayed) => stats.delayed += n,
                Some(JobState::Completed) => stats.completed += n,
                Some(JobState::Failed) => stats.failed += n,
                _ => {}
            }
            stats.total += n;
        }
        Ok(stats)
    }

    /// Purge terminal jobs older than the grace period. Idempotent once
    /// nothing is old enough to match.
    pub async fn clean(&self, grace: Duration) -> QueueResult<u64> {
        let cutoff = (Utc::now()
            - ChronoDuration::from_std(grace).unwrap_or_else(|_| ChronoDuration::zero()))
        .to_rfc3339();
        let result = sqlx::query(
            "DELETE FROM jobs WHERE queue = ?1 AND state IN ('completed', 'failed') AND updated_at < ?2",
        )
        .bind(QUEUE_NAME)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let removed = result.rows_affected();
        if removed > 0 {
            info!(removed, "cleaned terminal jobs");
        }
        Ok(removed)
    }

    /// Atomically claim the best due job: lowest priority rank first,
    /// oldest first within a rank. Stalled and due-delayed jobs are
    /// eligible alongside waiting ones.
    pub async fn claim_next(&self) -> QueueResult<Option<JobContext>> {
        let now = Utc::now().to_rfc3339();
        let row = sqlx::query(
            r#"UPDATE jobs SET state = 'active', attempts = attempts + 1,
                   heartbeat_at = ?1, updated_at = ?1
               WHERE id = (
                   SELECT id FROM jobs
                   WHERE queue = ?2 AND (
                       state IN ('waiting', 'stalled')
                       OR (state = 'delayed' AND run_at <= ?1)
                   )
                   ORDER BY priority ASC, created_at ASC
                   LIMIT 1
               )
               RETURNING id, attempts"#,
        )
        .bind(&now)
        .bind(QUEUE_NAME)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let id: String = row.try_get("id")?;
        let attempts: i64 = row.try_get("attempts")?;
        let task_id = Uuid::parse_str(&id).map_err(|_| QueueError::BadState(id))?;
        Ok(Some(JobContext {
            task_id,
            attempt: attempts as u32,
            max_attempts: self.config.max_attempts,
        }))
    }

    async fn complete_job(&self, job_id: Uuid) -> QueueResult<()> {
        sqlx::query(
            "UPDATE jobs SET state = 'completed', last_error = NULL, updated_at = ?1 WHERE id = ?2",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_or_retry(&self, ctx: JobContext, err: &ProcessError) -> QueueResult<()> {
        let now = Utc::now();
        if !err.retryable || ctx.is_final_attempt() {
            sqlx::query(
                "UPDATE jobs SET state = 'failed', last_error = ?1, updated_at = ?2 WHERE id = ?3",
            )
            .bind(&err.message)
            .bind(now.to_rfc3339())
            .bind(ctx.task_id.to_string())
            .execute(&self.pool)
            .await?;
            warn!(job = %ctx.task_id, attempt = ctx.attempt, error = %err.message, "job failed");
        } else {
            let backoff = self.config.backoff_base * 2u32.saturating_pow(ctx.attempt - 1);
            let run_at = now + ChronoDuration::from_std(backoff).unwrap_or_else(|_| ChronoDuration::zero());
            sqlx::query(
                r#"UPDATE jobs SET state = 'delayed', last_error = ?1, run_at = ?2, updated_at = ?3
                   WHERE id = ?4"#,
            )
            .bind(&err.message)
            .bind(run_at.to_rfc3339())
            .bind(now.to_rfc3339())
            .bind(ctx.task_id.to_string())
            .execute(&self.pool)
            .await?;
            debug!(job = %ctx.task_id, attempt = ctx.attempt, delay = ?backoff, "job delayed for retry");
        }
        Ok(())
    }

    /// Move active jobs with a quiet heartbeat back into the claimable set.
    pub async fn sweep_stalled(&self) -> QueueResult<u64> {
        let cutoff = (Utc::now()
            - ChronoDuration::from_std(self.config.stall_timeout)
                .unwrap_or_else(|_| ChronoDuration::zero()))
        .to_rfc3339();
        let result = sqlx::query(
            r#"UPDATE jobs SET state = 'stalled', updated_at = ?1
               WHERE queue = ?2 AND state = 'active' AND heartbeat_at < ?3"#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(QUEUE_NAME)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let stalled = result.rows_affected();
        if stalled > 0 {
            warn!(stalled, "stalled jobs returned to the queue");
        }
        Ok(stalled)
    }

    /// Start the worker pool and the stall sweeper.
    ///
    /// Spawns `concurrency` workers; each claims one job at a time and
    /// runs it to completion, which bounds concurrent processor
    /// invocations. Fails fast when no processor is registered.
    pub fn start(self: &Arc<Self>) -> QueueResult<WorkerPool> {
        if self.processor.read().expect("processor lock poisoned").is_none() {
            return Err(QueueError::NoProcessor);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        for worker in 0..self.config.concurrency {
            let queue = Arc::clone(self);
            let mut shutdown = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                debug!(worker, "worker started");
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    match queue.claim_next().await {
                        Ok(Some(ctx)) => queue.run_job(ctx).await,
                        Ok(None) => {
                            tokio::select! {
                                _ = tokio::time::sleep(queue.config.poll_interval) => {}
                                _ = shutdown.changed() => {}
                            }
                        }
                        Err(err) => {
                            error!(worker, error = %err, "claim failed");
                            tokio::time::sleep(queue.config.poll_interval).await;
                        }
                    }
                }
                debug!(worker, "worker stopped");
            }));
        }

        {
            let queue = Arc::clone(self);
            let mut shutdown = shutdown_rx;
            handles.push(tokio::spawn(async move {
                let interval = queue.config.stall_timeout / 2;
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {
                            if let Err(err) = queue.sweep_stalled().await {
                                error!(error = %err, "stall sweep failed");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        info!(workers = self.config.concurrency, "queue workers running");
        Ok(WorkerPool { shutdown: shutdown_tx, handles })
    }

    async fn run_job(&self, ctx: JobContext) {
        let processor = {
            let guard = self.processor.read().expect("processor lock poisoned");
            guard.clone()
        };
        let Some(processor) = processor else { return };

        // Keep the heartbeat fresh so the sweeper leaves this job alone.
        let heartbeat = {
            let pool = self.pool.clone();
            let interval = self.config.heartbeat_interval;
            let id = ctx.task_id.to_string();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let _ = sqlx::query(
                        "UPDATE jobs SET heartbeat_at = ?1 WHERE id = ?2 AND state = 'active'",
                    )
                    .bind(Utc::now().to_rfc3339())
                    .bind(&id)
                    .execute(&pool)
                    .await;
                }
            })
        };

        let result = processor.process(ctx).await;
        heartbeat.abort();

        let outcome = match result {
            Ok(()) => self.complete_job(ctx.task_id).await,
            Err(err) => self.fail_or_retry(ctx, &err).await,
        };
        if let Err(err) = outcome {
            error!(job = %ctx.task_id, error = %err, "failed to record job outcome");
        }
    }
}

/// Handle to the running workers; shut down to drain and join.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("queue workers stopped");
    }
}
