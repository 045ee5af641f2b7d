//! Submission façade
//!
//! The operations an HTTP layer (out of scope here) would call: submit a
//! requirement, poll task status, list tasks, inspect and clean the
//! queue, and explicitly re-queue a terminal task. Submission creates
//! the task row and its queue job in one transaction, so a job never
//! exists without its task and a concurrent double-submit of the same
//! task id cannot double-queue.

use crate::config::PipelineConfig;
use crate::llm::ProviderRegistry;
use crate::pipeline::analyzer::RequirementAnalyzer;
use crate::pipeline::generator::CodeGenerator;
use crate::pipeline::quality::QualityChecker;
use crate::pipeline::Pipeline;
use crate::queue::{JobQueue, JobSnapshot, JobState, QueueConfig, QueueError, QueueStats, WorkerPool};
use crate::store::{
    NewTask, QualityMetric, StoreError, TargetLanguage, Task, TaskFilter, TaskPriority,
    TaskStatus, TaskStore,
};
use crate::vcs::ArtifactCommitter;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("task not found: {0}")]
    NotFound(Uuid),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TaskNotFound(id) => ServiceError::NotFound(id),
            StoreError::IllegalTransition { .. } => ServiceError::Conflict(err.to_string()),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

impl From<QueueError> for ServiceError {
    fn from(err: QueueError) -> Self {
        ServiceError::Internal(err.to_string())
    }
}

/// One requirement submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub project_id: String,
    pub repository_url: String,
    pub branch: String,
    pub requirement_text: String,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default)]
    pub additional_context: Option<String>,
    #[serde(default)]
    pub language: Option<TargetLanguage>,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub template_id: Option<Uuid>,
    #[serde(default)]
    pub multi_model: bool,
}

/// Acknowledgement returned on submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub message: String,
}

/// Queue information attached to a status view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueInfo {
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

/// Metric sub-scores as exposed to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityMetricView {
    pub code_quality_score: f64,
    pub requirement_coverage_score: f64,
    pub syntax_validity_score: f64,
    pub aggregate_score: f64,
}

impl From<&QualityMetric> for QualityMetricView {
    fn from(metric: &QualityMetric) -> Self {
        Self {
            code_quality_score: metric.code_quality,
            requirement_coverage_score: metric.requirement_coverage,
            syntax_validity_score: metric.syntax_validity,
            aggregate_score: metric.aggregate(),
        }
    }
}

/// Full task view: the row, its queue state, and its metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusView {
    #[serde(flatten)]
    pub task: Task,
    pub queue_info: QueueInfo,
    pub quality_metrics: Vec<QualityMetricView>,
}

/// Process-wide service over the store and the queue
#[derive(Clone)]
pub struct RequirementService {
    store: Arc<TaskStore>,
    queue: Arc<JobQueue>,
}

impl RequirementService {
    pub fn new(store: Arc<TaskStore>, queue: Arc<JobQueue>) -> Self {
        Self { store, queue }
    }

    /// Wire the whole pipeline from configuration: pool, schemas,
    /// provider registry, stages, and the queue processor.
    pub async fn bootstrap(config: &PipelineConfig) -> anyhow::Result<Self> {
        config.validate().context("invalid pipeline configuration")?;

        let pool = crate::store::connect(&config.database_url)
            .await
            .context("failed to connect to the database")?;
        let store = Arc::new(TaskStore::new(pool.clone()));
        store.init_schema().await.context("failed to initialize task store schema")?;

        let queue_config = QueueConfig {
            concurrency: config.max_concurrent_tasks,
            ..QueueConfig::default()
        };
        let queue = Arc::new(JobQueue::new(pool, queue_config));
        queue.init_schema().await.context("failed to initialize queue schema")?;

        let registry = Arc::new(ProviderRegistry::new(config.registry.clone()));
        let pipeline = Pipeline::new(
            Arc::clone(&store),
            RequirementAnalyzer::new(Arc::clone(&registry))
                .with_timeout(config.timeouts.analysis()),
            CodeGenerator::new(Arc::clone(&registry)).with_timeout(config.timeouts.generation()),
            QualityChecker::new(Arc::clone(&registry), Arc::clone(&store))
                .with_validation_timeout(config.timeouts.validation()),
            ArtifactCommitter::new(config.git.clone()).with_timeout(config.timeouts.git()),
            config.quality_gate_enforced,
        );
        queue.register_processor(Arc::new(pipeline));

        info!(
            workers = config.max_concurrent_tasks,
            gate = config.quality_gate_enforced,
            "requirement service ready"
        );
        Ok(Self::new(store, queue))
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Start the worker pool.
    pub fn start_workers(&self) -> Result<WorkerPool, ServiceError> {
        Ok(self.queue.start()?)
    }

    /// Create the task row and enqueue its job atomically.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, ServiceError> {
        validate_submission(&request)?;

        let task = self.store.build_task(NewTask {
            project_id: request.project_id,
            repository_url: request.repository_url,
            branch: request.branch,
            requirement_text: request.requirement_text,
            priority: request.priority.unwrap_or_default(),
            additional_context: request.additional_context,
            language: request.language.unwrap_or_default(),
            output_path: request.output_path,
            template_id: request.template_id,
            multi_model: request.multi_model,
        });

        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        self.store.insert_task(&mut tx, &task).await?;
        self.queue.enqueue_tx(&mut tx, task.id, task.priority.queue_rank()).await?;
        tx.commit().await.map_err(|e| ServiceError::Internal(e.to_string()))?;

        info!(task = %task.id, priority = task.priority.as_str(), "requirement submitted");
        Ok(SubmitReceipt {
            task_id: task.id,
            status: TaskStatus::Pending,
            message: "requirement accepted for processing".to_string(),
        })
    }

    /// The row, its queue state, and its metrics for one task.
    pub async fn task_status(&self, task_id: Uuid) -> Result<TaskStatusView, ServiceError> {
        let task = self.store.get_task(task_id).await?;
        self.view_for(task).await
    }

    /// Status views for every matching task.
    pub async fn list_tasks(
        &self,
        filter: &TaskFilter,
    ) -> Result<Vec<TaskStatusView>, ServiceError> {
        let tasks = self.store.list_tasks(filter).await?;
        let mut views = Vec::with_capacity(tasks.len());
        for task in tasks {
            views.push(self.view_for(task).await?);
        }
        Ok(views)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, ServiceError> {
        Ok(self.queue.stats().await?)
    }

    pub async fn clean_queue(&self, grace: Duration) -> Result<u64, ServiceError> {
        Ok(self.queue.clean(grace).await?)
    }

    /// Explicitly re-run a terminal task: reopen the row and reset its
    /// job. Conflicts for tasks that are still moving.
    pub async fn requeue(&self, task_id: Uuid) -> Result<SubmitReceipt, ServiceError> {
        let task = self.store.get_task(task_id).await?;
        self.store.mark_requeued(task_id).await?;
        self.queue.enqueue(task_id, task.priority.queue_rank()).await?;
        info!(task = %task_id, "task re-queued");
        Ok(SubmitReceipt {
            task_id,
            status: TaskStatus::Pending,
            message: "task re-queued for processing".to_string(),
        })
    }

    async fn view_for(&self, task: Task) -> Result<TaskStatusView, ServiceError> {
        let job: JobSnapshot = self.queue.job_status(task.id).await?;
        let progress =
            (!matches!(job.state, JobState::NotFound)).then_some(task.progress);
        let metrics = self.store.metrics_by_task(task.id).await?;
        Ok(TaskStatusView {
            queue_info: QueueInfo { state: job.state, progress },
            quality_metrics: metrics.iter().map(QualityMetricView::from).collect(),
            task,
        })
    }
}

fn validate_submission(request: &SubmitRequest) -> Result<(), ServiceError> {
    let required = [
        ("projectId", &request.project_id),
        ("repositoryUrl", &request.repository_url),
        ("branch", &request.branch),
        ("requirementText", &request.requirement_text),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(ServiceError::Validation(format!("{field} must not be empty")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueConfig;

    async fn service() -> RequirementService {
        let pool = crate::store::connect("sqlite::memory:").await.unwrap();
        let store = Arc::new(TaskStore::new(pool.clone()));
        store.init_schema().await.unwrap();
        let queue = Arc::new(JobQueue::new(pool, QueueConfig::default()));
        queue.init_schema().await.unwrap();
        RequirementService::new(store, queue)
    }

    fn request() -> SubmitRequest {
        SubmitRequest {
            project_id: "p1".to_string(),
            repository_url: "git@host:o/r.git".to_string(),
            branch: "feat/auth".to_string(),
            requirement_text: "User authentication".to_string(),
            priority: None,
            additional_context: None,
            language: None,
            output_path: None,
            template_id: None,
            multi_model: false,
        }
    }

    #[tokio::test]
    async fn submit_creates_task_and_job_together() {
        let service = service().await;
        let receipt = service.submit(request()).await.unwrap();
        assert_eq!(receipt.status, TaskStatus::Pending);

        let view = service.task_status(receipt.task_id).await.unwrap();
        assert_eq!(view.task.status, TaskStatus::Pending);
        assert_eq!(view.task.progress, 0.0);
        assert_eq!(view.task.priority, TaskPriority::Medium);
        assert_eq!(view.task.language, TargetLanguage::Typescript);
        assert_eq!(view.queue_info.state, JobState::Waiting);
        assert!(view.quality_metrics.is_empty());
    }

    #[tokio::test]
    async fn blank_fields_fail_validation() {
        let service = service().await;
        let mut bad = request();
        bad.requirement_text = "   ".to_string();
        let err = service.submit(bad).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert_eq!(service.queue_stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let service = service().await;
        let err = service.task_status(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn requeue_of_a_moving_task_conflicts() {
        let service = service().await;
        let receipt = service.submit(request()).await.unwrap();
        let err = service.requeue(receipt.task_id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[tokio::test]
    async fn list_views_carry_queue_state() {
        let service = service().await;
        service.submit(request()).await.unwrap();
        let mut other = request();
        other.project_id = "p2".to_string();
        service.submit(other).await.unwrap();

        let all = service.list_tasks(&TaskFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|v| v.queue_info.state == JobState::Waiting));

        let filtered = service
            .list_tasks(&TaskFilter { project_id: Some("p2".to_string()), status: None })
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
    }
}
