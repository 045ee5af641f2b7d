//! Durable task store over SQLite
//!
//! The source of truth for every submission. Status updates go through
//! the transition relation on [`TaskStatus`]; the quality-metrics row is
//! create-or-overwrite per task; task creation itself is executed inside
//! the caller's transaction so the row and its queue job commit together.

pub mod types;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool, Transaction};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub use types::{
    aggregate_score, CodeTemplate, ComparisonBranch, NewTask, QualityMetric, Task, TaskDetails,
    TaskFilter, TaskPriority, TaskStatus, TargetLanguage,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS requirement_tasks (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    repository_url TEXT NOT NULL,
    branch TEXT NOT NULL,
    requirement_text TEXT NOT NULL,
    priority TEXT NOT NULL DEFAULT 'medium',
    additional_context TEXT,
    language TEXT NOT NULL DEFAULT 'typescript',
    output_path TEXT,
    template_id TEXT,
    multi_model INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    progress REAL NOT NULL DEFAULT 0.0,
    details TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_requirement_tasks_project ON requirement_tasks(project_id);
CREATE INDEX IF NOT EXISTS idx_requirement_tasks_status ON requirement_tasks(status);

CREATE TABLE IF NOT EXISTS quality_metrics (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL UNIQUE REFERENCES requirement_tasks(id),
    code_quality REAL NOT NULL,
    requirement_coverage REAL NOT NULL,
    syntax_validity REAL NOT NULL,
    static_analysis TEXT NOT NULL DEFAULT '{}',
    feedback TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS code_templates (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    language TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("template not found: {0}")]
    TemplateNotFound(Uuid),

    #[error("illegal status transition {from} -> {to}")]
    IllegalTransition { from: &'static str, to: &'static str },

    #[error("invalid value '{value}' in column {column}")]
    Corrupt { column: &'static str, value: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Connect a pool suitable for the given URL.
///
/// An in-memory SQLite database exists per connection, so memory URLs are
/// pinned to a single connection to keep one coherent database.
pub async fn connect(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = if database_url.contains(":memory:") {
        SqlitePoolOptions::new().max_connections(1)
    } else {
        SqlitePoolOptions::new().max_connections(8)
    };
    options.connect(database_url).await
}

/// Durable store for tasks, quality metrics and templates
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the tables if they do not exist.
    pub async fn init_schema(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        debug!("task store schema initialized");
        Ok(())
    }

    /// Materialize a pending task row from a submission.
    ///
    /// Only builds the value; persistence happens in [`Self::insert_task`]
    /// inside the caller's create+enqueue transaction.
    pub fn build_task(&self, new: NewTask) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            project_id: new.project_id,
            repository_url: new.repository_url,
            branch: new.branch,
            requirement_text: new.requirement_text,
            priority: new.priority,
            additional_context: new.additional_context,
            language: new.language,
            output_path: new.output_path,
            template_id: new.template_id,
            multi_model: new.multi_model,
            status: TaskStatus::Pending,
            progress: 0.0,
            details: TaskDetails::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Insert a task row within an open transaction.
    pub async fn insert_task(
        &self,
        tx: &mut Transaction<'_, sqlx::Sqlite>,
        task: &Task,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO requirement_tasks
               (id, project_id, repository_url, branch, requirement_text, priority,
                additional_context, language, output_path, template_id, multi_model,
                status, progress, details, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"#,
        )
        .bind(task.id.to_string())
        .bind(&task.project_id)
        .bind(&task.repository_url)
        .bind(&task.branch)
        .bind(&task.requirement_text)
        .bind(task.priority.as_str())
        .bind(&task.additional_context)
        .bind(task.language.as_str())
        .bind(&task.output_path)
        .bind(task.template_id.map(|id| id.to_string()))
        .bind(task.multi_model as i64)
        .bind(task.status.as_str())
        .bind(task.progress)
        .bind(serde_json::to_string(&task.details)?)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Single-row status write, refusing illegal transitions.
    pub async fn update_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        progress: f64,
        details: &TaskDetails,
    ) -> StoreResult<()> {
        let current = self.get_task(task_id).await?;
        if !current.status.can_transition_to(status) {
            return Err(StoreError::IllegalTransition {
                from: current.status.as_str(),
                to: status.as_str(),
            });
        }

        sqlx::query(
            "UPDATE requirement_tasks SET status = ?1, progress = ?2, details = ?3, updated_at = ?4 WHERE id = ?5",
        )
        .bind(status.as_str())
        .bind(progress.clamp(0.0, 1.0))
        .bind(serde_json::to_string(details)?)
        .bind(Utc::now().to_rfc3339())
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        debug!(task = %task_id, status = status.as_str(), progress, "task status updated");
        Ok(())
    }

    /// Re-open a terminal task for another run; the explicit re-queue path.
    pub async fn mark_requeued(&self, task_id: Uuid) -> StoreResult<()> {
        let current = self.get_task(task_id).await?;
        if !current.status.is_terminal() {
            return Err(StoreError::IllegalTransition {
                from: current.status.as_str(),
                to: TaskStatus::Pending.as_str(),
            });
        }
        sqlx::query(
            "UPDATE requirement_tasks SET status = 'pending', progress = 0.0, updated_at = ?1 WHERE id = ?2",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_task(&self, task_id: Uuid) -> StoreResult<Task> {
        let row = sqlx::query("SELECT * FROM requirement_tasks WHERE id = ?1")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::TaskNotFound(task_id))?;
        task_from_row(&row)
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> StoreResult<Vec<Task>> {
        let mut query = String::from("SELECT * FROM requirement_tasks");
        let mut conditions = Vec::new();
        if filter.project_id.is_some() {
            conditions.push("project_id = ?");
        }
        if filter.status.is_some() {
            conditions.push("status = ?");
        }
        if !conditions.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&conditions.join(" AND "));
        }
        query.push_str(" ORDER BY created_at DESC");

        let mut q = sqlx::query(&query);
        if let Some(project_id) = &filter.project_id {
            q = q.bind(project_id);
        }
        if let Some(status) = filter.status {
            q = q.bind(status.as_str());
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(task_from_row).collect()
    }

    /// Create the metrics row for a task, or overwrite the scores,
    /// payload and feedback of the existing one.
    pub async fn upsert_metrics(
        &self,
        task_id: Uuid,
        code_quality: f64,
        requirement_coverage: f64,
        syntax_validity: f64,
        static_analysis: &serde_json::Value,
        feedback: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO quality_metrics
               (id, task_id, code_quality, requirement_coverage, syntax_validity,
                static_analysis, feedback, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
               ON CONFLICT(task_id) DO UPDATE SET
                   code_quality = excluded.code_quality,
                   requirement_coverage = excluded.requirement_coverage,
                   syntax_validity = excluded.syntax_validity,
                   static_analysis = excluded.static_analysis,
                   feedback = excluded.feedback"#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(task_id.to_string())
        .bind(code_quality.clamp(0.0, 100.0))
        .bind(requirement_coverage.clamp(0.0, 100.0))
        .bind(syntax_validity.clamp(0.0, 100.0))
        .bind(serde_json::to_string(static_analysis)?)
        .bind(feedback)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn metrics_by_task(&self, task_id: Uuid) -> StoreResult<Vec<QualityMetric>> {
        let rows = sqlx::query(
            "SELECT * FROM quality_metrics WHERE task_id = ?1 ORDER BY created_at DESC",
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(metric_from_row).collect()
    }

    pub async fn insert_template(&self, template: &CodeTemplate) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO code_templates (id, name, language, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(template.id.to_string())
        .bind(&template.name)
        .bind(template.language.as_str())
        .bind(&template.content)
        .bind(template.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_template(&self, template_id: Uuid) -> StoreResult<CodeTemplate> {
        let row = sqlx::query("SELECT * FROM code_templates WHERE id = ?1")
            .bind(template_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::TemplateNotFound(template_id))?;
        Ok(CodeTemplate {
            id: parse_uuid(&row, "id")?,
            name: row.try_get("name")?,
            language: parse_language(&row)?,
            content: row.try_get("content")?,
            created_at: parse_timestamp(&row, "created_at")?,
        })
    }
}

fn parse_uuid(row: &SqliteRow, column: &'static str) -> StoreResult<Uuid> {
    let value: String = row.try_get(column)?;
    Uuid::parse_str(&value).map_err(|_| StoreError::Corrupt { column, value })
}

fn parse_timestamp(row: &SqliteRow, column: &'static str) -> StoreResult<DateTime<Utc>> {
    let value: String = row.try_get(column)?;
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt { column, value })
}

fn parse_language(row: &SqliteRow) -> StoreResult<TargetLanguage> {
    let value: String = row.try_get("language")?;
    TargetLanguage::parse(&value).ok_or(StoreError::Corrupt { column: "language", value })
}

fn task_from_row(row: &SqliteRow) -> StoreResult<Task> {
    let priority: String = row.try_get("priority")?;
    let status: String = row.try_get("status")?;
    let details: String = row.try_get("details")?;
    let template_id: Option<String> = row.try_get("template_id")?;

    Ok(Task {
        id: parse_uuid(row, "id")?,
        project_id: row.try_get("project_id")?,
        repository_url: row.try_get("repository_url")?,
        branch: row.try_get("branch")?,
        requirement_text: row.try_get("requirement_text")?,
        priority: TaskPriority::parse(&priority)
            .ok_or(StoreError::Corrupt { column: "priority", value: priority })?,
        additional_context: row.try_get("additional_context")?,
        language: parse_language(row)?,
        output_path: row.try_get("output_path")?,
        template_id: template_id
            .map(|v| Uuid::parse_str(&v).map_err(|_| StoreError::Corrupt { column: "template_id", value: v }))
            .transpose()?,
        multi_model: row.try_get::<i64, _>("multi_model")? != 0,
        status: TaskStatus::parse(&status)
            .ok_or(StoreError::Corrupt { column: "status", value: status })?,
        progress: row.try_get("progress")?,
        details: serde_json::from_str(&details)?,
        created_at: parse_timestamp(row, "created_at")?,
        updated_at: parse_timestamp(row, "updated_at")?,
    })
}

fn metric_from_row(row: &SqliteRow) -> StoreResult<QualityMetric> {
    let static_analysis: String = row.try_get("static_analysis")?;
    Ok(QualityMetric {
        id: parse_uuid(row, "id")?,
        task_id: parse_uuid(row, "task_id")?,
        code_quality: row.try_get("code_quality")?,
        requirement_coverage: row.try_get("requirement_coverage")?,
        syntax_validity: row.try_get("syntax_validity")?,
        static_analysis: serde_json::from_str(&static_analysis)?,
        feedback: row.try_get("feedback")?,
        created_at: parse_timestamp(row, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> TaskStore {
        let pool = connect("sqlite::memory:").await.unwrap();
        let store = TaskStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    fn new_task() -> NewTask {
        NewTask {
            project_id: "p1".to_string(),
            repository_url: "git@host:o/r.git".to_string(),
            branch: "main".to_string(),
            requirement_text: "user authentication".to_string(),
            priority: TaskPriority::Medium,
            additional_context: None,
            language: TargetLanguage::Typescript,
            output_path: None,
            template_id: None,
            multi_model: false,
        }
    }

    async fn insert(store: &TaskStore, new: NewTask) -> Task {
        let task = store.build_task(new);
        let mut tx = store.pool().begin().await.unwrap();
        store.insert_task(&mut tx, &task).await.unwrap();
        tx.commit().await.unwrap();
        task
    }

    #[tokio::test]
    async fn created_task_starts_pending_with_zero_progress() {
        let store = store().await;
        let task = insert(&store, new_task()).await;
        let loaded = store.get_task(task.id).await.unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.progress, 0.0);
        assert_eq!(loaded.requirement_text, "user authentication");
    }

    #[tokio::test]
    async fn illegal_transition_is_a_conflict() {
        let store = store().await;
        let task = insert(&store, new_task()).await;
        let details = TaskDetails::default();

        // pending -> completed skips in_progress
        let err = store
            .update_status(task.id, TaskStatus::Completed, 1.0, &details)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));

        store.update_status(task.id, TaskStatus::InProgress, 0.1, &details).await.unwrap();
        store.update_status(task.id, TaskStatus::InProgress, 0.5, &details).await.unwrap();
        store.update_status(task.id, TaskStatus::Completed, 1.0, &details).await.unwrap();

        let err = store
            .update_status(task.id, TaskStatus::InProgress, 0.1, &details)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn requeue_reopens_only_terminal_tasks() {
        let store = store().await;
        let task = insert(&store, new_task()).await;

        let err = store.mark_requeued(task.id).await.unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));

        let details = TaskDetails::default();
        store.update_status(task.id, TaskStatus::Failed, 0.0, &details).await.unwrap();
        store.mark_requeued(task.id).await.unwrap();

        let loaded = store.get_task(task.id).await.unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.progress, 0.0);
    }

    #[tokio::test]
    async fn metrics_upsert_overwrites_in_place() {
        let store = store().await;
        let task = insert(&store, new_task()).await;

        let payload = serde_json::json!({"correctness": 20});
        store.upsert_metrics(task.id, 40.0, 50.0, 60.0, &payload, "needs work").await.unwrap();
        store.upsert_metrics(task.id, 90.0, 80.0, 100.0, &payload, "better").await.unwrap();

        let metrics = store.metrics_by_task(task.id).await.unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].code_quality, 90.0);
        assert_eq!(metrics[0].feedback, "better");
        assert!((metrics[0].aggregate() - 89.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn metrics_scores_are_clamped() {
        let store = store().await;
        let task = insert(&store, new_task()).await;
        let payload = serde_json::json!({});
        store.upsert_metrics(task.id, 140.0, -5.0, 60.0, &payload, "").await.unwrap();
        let metrics = store.metrics_by_task(task.id).await.unwrap();
        assert_eq!(metrics[0].code_quality, 100.0);
        assert_eq!(metrics[0].requirement_coverage, 0.0);
    }

    #[tokio::test]
    async fn list_filters_by_project_and_status() {
        let store = store().await;
        let mut other = new_task();
        other.project_id = "p2".to_string();
        let a = insert(&store, new_task()).await;
        let _b = insert(&store, other).await;

        let filter = TaskFilter { project_id: Some("p1".to_string()), status: None };
        let tasks = store.list_tasks(&filter).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, a.id);

        let filter = TaskFilter { project_id: None, status: Some(TaskStatus::Pending) };
        assert_eq!(store.list_tasks(&filter).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let store = store().await;
        let err = store.get_task(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn templates_round_trip() {
        let store = store().await;
        let template = CodeTemplate {
            id: Uuid::new_v4(),
            name: "service-skeleton".to_string(),
            language: TargetLanguage::Typescript,
            content: "export class {{name}} {}".to_string(),
            created_at: Utc::now(),
        };
        store.insert_template(&template).await.unwrap();
        let loaded = store.get_template(template.id).await.unwrap();
        assert_eq!(loaded.name, "service-skeleton");
        assert_eq!(loaded.language, TargetLanguage::Typescript);
    }
}
