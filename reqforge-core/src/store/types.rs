//! Task store domain types
//!
//! Enum columns carry `as_str`/`parse` pairs so the SQLite rows stay
//! readable; the status transition relation lives on [`TaskStatus`] so
//! every writer shares one rule set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a requirement task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// The transition relation enforced by `update_status`.
    ///
    /// pending→in_progress, in_progress→in_progress (progress update),
    /// in_progress→completed, and any→failed. Leaving a terminal state
    /// requires the explicit re-queue operation.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (_, TaskStatus::Failed)
        )
    }
}

/// Submission priority, mapped onto the queue's numeric rank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(TaskPriority::Low),
            "medium" => Some(TaskPriority::Medium),
            "high" => Some(TaskPriority::High),
            "critical" => Some(TaskPriority::Critical),
            _ => None,
        }
    }

    /// Queue rank; lower dequeues sooner.
    pub fn queue_rank(&self) -> i64 {
        match self {
            TaskPriority::Critical => 1,
            TaskPriority::High => 2,
            TaskPriority::Medium => 3,
            TaskPriority::Low => 4,
        }
    }

    /// Map free-form priority text (English or Chinese tokens) onto the
    /// closed set, defaulting to medium.
    pub fn normalize(raw: &str) -> Self {
        let lower = raw.trim().to_lowercase();
        if lower.contains("critical") || lower.contains("urgent") || lower.contains("紧急") {
            TaskPriority::Critical
        } else if lower.contains("high") || lower.contains("高") {
            TaskPriority::High
        } else if lower.contains("low") || lower.contains("低") {
            TaskPriority::Low
        } else {
            TaskPriority::Medium
        }
    }
}

/// Target language of the generated artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TargetLanguage {
    #[default]
    Typescript,
    Javascript,
    Python,
    Java,
    Csharp,
    Go,
    Ruby,
    Php,
}

impl TargetLanguage {
    pub const ALL: [TargetLanguage; 8] = [
        TargetLanguage::Typescript,
        TargetLanguage::Javascript,
        TargetLanguage::Python,
        TargetLanguage::Java,
        TargetLanguage::Csharp,
        TargetLanguage::Go,
        TargetLanguage::Ruby,
        TargetLanguage::Php,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetLanguage::Typescript => "typescript",
            TargetLanguage::Javascript => "javascript",
            TargetLanguage::Python => "python",
            TargetLanguage::Java => "java",
            TargetLanguage::Csharp => "csharp",
            TargetLanguage::Go => "go",
            TargetLanguage::Ruby => "ruby",
            TargetLanguage::Php => "php",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "typescript" | "ts" => Some(TargetLanguage::Typescript),
            "javascript" | "js" => Some(TargetLanguage::Javascript),
            "python" | "py" => Some(TargetLanguage::Python),
            "java" => Some(TargetLanguage::Java),
            "csharp" | "c#" => Some(TargetLanguage::Csharp),
            "go" | "golang" => Some(TargetLanguage::Go),
            "ruby" => Some(TargetLanguage::Ruby),
            "php" => Some(TargetLanguage::Php),
            _ => None,
        }
    }

    /// Source-file extensions counted by the syntax validity check.
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            TargetLanguage::Typescript => &["ts", "tsx"],
            TargetLanguage::Javascript => &["js", "jsx"],
            TargetLanguage::Python => &["py"],
            TargetLanguage::Java => &["java"],
            TargetLanguage::Csharp => &["cs"],
            TargetLanguage::Go => &["go"],
            TargetLanguage::Ruby => &["rb"],
            TargetLanguage::Php => &["php"],
        }
    }

    /// Commit output path used when the analysis suggests no file structure.
    pub fn default_output_path(&self) -> &'static str {
        match self {
            TargetLanguage::Java => "src/main/java",
            TargetLanguage::Go => "pkg",
            TargetLanguage::Ruby => "lib",
            _ => "src",
        }
    }
}

/// Structured diagnostics carried on the task row.
///
/// Every stage replaces `stage`/`message`; the remaining fields
/// accumulate stage-specific payloads and survive until the next
/// pipeline attempt overwrites them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_passed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_scores: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_changed: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comparison_branches: Option<Vec<ComparisonBranch>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A pushed comparison branch from multi-model generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonBranch {
    pub provider: String,
    pub branch: String,
    pub commit_hash: String,
    pub file_count: usize,
}

/// A requirement task row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub project_id: String,
    pub repository_url: String,
    pub branch: String,
    pub requirement_text: String,
    pub priority: TaskPriority,
    pub additional_context: Option<String>,
    pub language: TargetLanguage,
    pub output_path: Option<String>,
    pub template_id: Option<Uuid>,
    pub multi_model: bool,
    pub status: TaskStatus,
    pub progress: f64,
    pub details: TaskDetails,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied at submission time
#[derive(Debug, Clone)]
pub struct NewTask {
    pub project_id: String,
    pub repository_url: String,
    pub branch: String,
    pub requirement_text: String,
    pub priority: TaskPriority,
    pub additional_context: Option<String>,
    pub language: TargetLanguage,
    pub output_path: Option<String>,
    pub template_id: Option<Uuid>,
    pub multi_model: bool,
}

/// Quality metric row; the aggregate is derived, never stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityMetric {
    pub id: Uuid,
    pub task_id: Uuid,
    pub code_quality: f64,
    pub requirement_coverage: f64,
    pub syntax_validity: f64,
    pub static_analysis: serde_json::Value,
    pub feedback: String,
    pub created_at: DateTime<Utc>,
}

impl QualityMetric {
    /// `0.5·code-quality + 0.3·requirement-coverage + 0.2·syntax-validity`
    pub fn aggregate(&self) -> f64 {
        aggregate_score(self.code_quality, self.requirement_coverage, self.syntax_validity)
    }
}

/// The aggregate quality formula, shared by the checker and the metric row.
pub fn aggregate_score(code_quality: f64, requirement_coverage: f64, syntax_validity: f64) -> f64 {
    0.5 * code_quality + 0.3 * requirement_coverage + 0.2 * syntax_validity
}

/// Filter for task listings
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub project_id: Option<String>,
    pub status: Option<TaskStatus>,
}

/// A stored code template referenced by `template_id` submissions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeTemplate {
    pub id: Uuid,
    pub name: String,
    pub language: TargetLanguage,
    pub content: String,
    pub created_at: DateTime<Utc>,
}
