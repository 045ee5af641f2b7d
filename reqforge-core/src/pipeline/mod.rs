//! Pipeline orchestration
//!
//! One worker invocation drives a task through analysis → generation →
//! quality check → commit, projecting each transition into the task
//! store. Stage failures reset progress; whether the task record goes
//! terminal depends on the queue's remaining attempts, so a retry can
//! overwrite the intermediate state without leaving a terminal status.

pub mod analyzer;
pub mod extract;
pub mod generator;
pub mod quality;

use crate::queue::{JobContext, JobProcessor, ProcessError};
use crate::store::{
    ComparisonBranch, Task, TaskDetails, TaskStatus, TaskStore, StoreError,
};
use crate::vcs::{ArtifactCommitter, CommitRequest};
use analyzer::RequirementAnalyzer;
use async_trait::async_trait;
use generator::{CodeGenerator, GenerationOutcome};
use quality::{QualityChecker, QualityError, QualityOutcome};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Pipeline stage, as reported in `details.stage`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Analysis,
    Generation,
    QualityCheck,
    Commit,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Analysis => "code_analysis",
            Stage::Generation => "code_generation",
            Stage::QualityCheck => "quality_check",
            Stage::Commit => "code_commit",
        }
    }
}

/// A stage failure with its retry classification
#[derive(Debug)]
pub struct StageError {
    pub stage: Stage,
    pub message: String,
    pub retryable: bool,
}

impl StageError {
    fn new(stage: Stage, message: impl Into<String>, retryable: bool) -> Self {
        Self { stage, message: message.into(), retryable }
    }
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed: {}", self.stage.as_str(), self.message)
    }
}

/// The composed pipeline, registered as the queue's processor
pub struct Pipeline {
    store: Arc<TaskStore>,
    analyzer: RequirementAnalyzer,
    generator: CodeGenerator,
    checker: QualityChecker,
    committer: ArtifactCommitter,
    /// When set, a failing quality verdict aborts the task before commit
    enforce_gate: bool,
}

impl Pipeline {
    pub fn new(
        store: Arc<TaskStore>,
        analyzer: RequirementAnalyzer,
        generator: CodeGenerator,
        checker: QualityChecker,
        committer: ArtifactCommitter,
        enforce_gate: bool,
    ) -> Self {
        Self { store, analyzer, generator, checker, committer, enforce_gate }
    }

    async fn run_task(&self, task: &Task) -> Result<TaskDetails, StageError> {
        let mut details = TaskDetails {
            stage: Some(Stage::Analysis.as_str().to_string()),
            message: Some("analyzing requirement".to_string()),
            ..TaskDetails::default()
        };
        self.update(task.id, TaskStatus::InProgress, 0.1, &details).await?;

        // Analysis
        let template_content = match task.template_id {
            Some(template_id) => Some(
                self.store
                    .get_template(template_id)
                    .await
                    .map_err(|e| StageError::new(Stage::Analysis, e.to_string(), false))?
                    .content,
            ),
            None => None,
        };
        let (analysis, analysis_model) = self
            .analyzer
            .analyze(&task.requirement_text, task.language, template_content.as_deref())
            .await
            .map_err(|e| StageError::new(Stage::Analysis, e.to_string(), e.is_retryable()))?;
        details.analysis = serde_json::to_value(&analysis).ok();
        details.analysis_model = Some(analysis_model);
        details.message = Some("requirement analyzed".to_string());
        self.update(task.id, TaskStatus::InProgress, 0.3, &details).await?;

        // Generation
        details.stage = Some(Stage::Generation.as_str().to_string());
        let generation: GenerationOutcome = if task.multi_model {
            self.generator
                .generate_multi_model(&analysis, task.language, task.additional_context.as_deref())
                .await
        } else {
            self.generator
                .generate(&analysis, task.language, task.additional_context.as_deref())
                .await
        }
        .map_err(|e| StageError::new(Stage::Generation, e.to_string(), e.is_retryable()))?;
        details.generation_model = Some(generation.provider.clone());
        details.message = Some(format!("generated {} files", generation.artifact.len()));
        self.update(task.id, TaskStatus::InProgress, 0.5, &details).await?;

        // Quality check
        details.stage = Some(Stage::QualityCheck.as_str().to_string());
        let outcome = self
            .checker
            .check(task.id, &analysis, &generation.artifact, task.language)
            .await
            .map_err(|e| match e {
                QualityError::Provider(err) => {
                    let retryable = err.is_retryable();
                    StageError::new(Stage::QualityCheck, err.to_string(), retryable)
                }
                QualityError::Store(err) => {
                    StageError::new(Stage::QualityCheck, err.to_string(), true)
                }
            })?;
        details.quality_passed = Some(outcome.passed);
        details.quality_scores = Some(quality_scores_json(&outcome));
        details.message = Some(format!("quality check scored {:.1}", outcome.aggregate()));
        self.update(task.id, TaskStatus::InProgress, 0.7, &details).await?;

        if self.enforce_gate && !outcome.passed {
            return Err(StageError::new(
                Stage::QualityCheck,
                "Low code quality score",
                false,
            ));
        }

        // Commit
        details.stage = Some(Stage::Commit.as_str().to_string());
        details.message = Some("committing artifact".to_string());
        self.update(task.id, TaskStatus::InProgress, 0.8, &details).await?;

        let output_path = task
            .output_path
            .clone()
            .unwrap_or_else(|| generator::default_output_path(&analysis, task.language));
        let commit = self
            .committer
            .commit_and_push(CommitRequest {
                repository_url: task.repository_url.clone(),
                branch: task.branch.clone(),
                artifact: generation.artifact,
                output_path: output_path.clone(),
                title: (!analysis.title.is_empty()).then(|| analysis.title.clone()),
                requirement_text: task.requirement_text.clone(),
            })
            .await
            .map_err(|e| StageError::new(Stage::Commit, e.to_string(), e.is_retryable()))?;

        // Comparison branches ride on the main commit's success; a
        // failed comparison push is logged, not fatal.
        let mut comparison_branches = Vec::new();
        for candidate in generation.comparisons {
            let branch = format!("{}-{}", task.branch, candidate.provider);
            let file_count = candidate.artifact.len();
            let result = self
                .committer
                .commit_and_push(CommitRequest {
                    repository_url: task.repository_url.clone(),
                    branch: branch.clone(),
                    artifact: candidate.artifact,
                    output_path: output_path.clone(),
                    title: (!analysis.title.is_empty()).then(|| analysis.title.clone()),
                    requirement_text: task.requirement_text.clone(),
                })
                .await;
            match result {
                Ok(outcome) => comparison_branches.push(ComparisonBranch {
                    provider: candidate.provider,
                    branch,
                    commit_hash: outcome.commit_hash,
                    file_count,
                }),
                Err(err) => {
                    warn!(branch = %branch, error = %err, "comparison branch push failed");
                }
            }
        }

        details.commit_hash = Some(commit.commit_hash);
        details.files_changed = Some(commit.files_changed);
        if !comparison_branches.is_empty() {
            details.comparison_branches = Some(comparison_branches);
        }
        details.message = Some("completed".to_string());
        details.error = None;
        Ok(details)
    }

    async fn update(
        &self,
        task_id: uuid::Uuid,
        status: TaskStatus,
        progress: f64,
        details: &TaskDetails,
    ) -> Result<(), StageError> {
        self.store
            .update_status(task_id, status, progress, details)
            .await
            .map_err(|e| {
                let stage = details
                    .stage
                    .as_deref()
                    .map(stage_from_str)
                    .unwrap_or(Stage::Analysis);
                // Conflicts mean another writer owns the task now; retrying
                // the whole pipeline will not take ownership back.
                let retryable = !matches!(e, StoreError::IllegalTransition { .. });
                StageError::new(stage, e.to_string(), retryable)
            })
    }
}

fn stage_from_str(s: &str) -> Stage {
    match s {
        "code_generation" => Stage::Generation,
        "quality_check" => Stage::QualityCheck,
        "code_commit" => Stage::Commit,
        _ => Stage::Analysis,
    }
}

fn quality_scores_json(outcome: &QualityOutcome) -> serde_json::Value {
    serde_json::json!({
        "codeQualityScore": outcome.code_quality,
        "requirementCoverageScore": outcome.requirement_coverage,
        "syntaxValidityScore": outcome.syntax_validity,
        "aggregate": outcome.aggregate(),
    })
}

#[async_trait]
impl JobProcessor for Pipeline {
    async fn process(&self, ctx: JobContext) -> Result<(), ProcessError> {
        let task = self.store.get_task(ctx.task_id).await.map_err(|e| match e {
            StoreError::TaskNotFound(_) => ProcessError::fatal(e.to_string()),
            other => ProcessError::retryable(other.to_string()),
        })?;

        match self.run_task(&task).await {
            Ok(details) => {
                self.store
                    .update_status(ctx.task_id, TaskStatus::Completed, 1.0, &details)
                    .await
                    .map_err(|e| ProcessError::retryable(e.to_string()))?;
                info!(task = %ctx.task_id, "task completed");
                Ok(())
            }
            Err(stage_err) => {
                let will_retry = stage_err.retryable && !ctx.is_final_attempt();
                let details = TaskDetails {
                    stage: Some(stage_err.stage.as_str().to_string()),
                    error: Some(stage_err.message.clone()),
                    message: Some(if will_retry {
                        "stage failed, retry scheduled".to_string()
                    } else {
                        "task failed".to_string()
                    }),
                    ..TaskDetails::default()
                };
                // Progress resets on failure; a retry restarts from stage 1.
                let status = if will_retry { TaskStatus::InProgress } else { TaskStatus::Failed };
                if let Err(store_err) =
                    self.store.update_status(ctx.task_id, status, 0.0, &details).await
                {
                    error!(task = %ctx.task_id, error = %store_err, "failed to record stage failure");
                }
                error!(task = %ctx.task_id, stage = stage_err.stage.as_str(), error = %stage_err.message, "stage failed");
                if stage_err.retryable {
                    Err(ProcessError::retryable(stage_err.message))
                } else {
                    Err(ProcessError::fatal(stage_err.message))
                }
            }
        }
    }
}
