//! Quality check stage
//!
//! Scores the generated artifact on three axes: syntactic validity of
//! the code files (per-file LLM verdicts), holistic code quality (one
//! rubric-scored evaluation), and requirement coverage (file-structure
//! match blended with an LLM-judged functional coverage score). Persists
//! one metrics row per attempt and applies the ≥85 gate to the derived
//! aggregate.

use crate::artifact::Artifact;
use crate::llm::{CallOptions, ProviderError, ProviderRegistry, ProviderResult};
use crate::pipeline::analyzer::Analysis;
use crate::pipeline::extract;
use crate::store::{aggregate_score, StoreError, TargetLanguage, TaskStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Aggregate score at or above this passes the gate
pub const QUALITY_GATE: f64 = 85.0;

/// Per-file cap fed into the evaluation prompt
const FILE_EXCERPT_CHARS: usize = 1_000;

/// Overall corpus cap for evaluation prompts
const CORPUS_CHARS: usize = 8_000;

/// Verdict of one quality check attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityOutcome {
    pub passed: bool,
    pub code_quality: f64,
    pub requirement_coverage: f64,
    pub syntax_validity: f64,
    pub feedback: String,
    pub static_analysis: Value,
}

impl QualityOutcome {
    pub fn aggregate(&self) -> f64 {
        aggregate_score(self.code_quality, self.requirement_coverage, self.syntax_validity)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QualityError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Quality check stage, bound to the registry and the metrics store
pub struct QualityChecker {
    registry: Arc<ProviderRegistry>,
    store: Arc<TaskStore>,
    validation_timeout: Duration,
}

impl QualityChecker {
    pub fn new(registry: Arc<ProviderRegistry>, store: Arc<TaskStore>) -> Self {
        Self { registry, store, validation_timeout: Duration::from_secs(30) }
    }

    pub fn with_validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = timeout;
        self
    }

    /// Run all three checks, persist the metrics row, and return the
    /// verdict.
    pub async fn check(
        &self,
        task_id: Uuid,
        analysis: &Analysis,
        artifact: &Artifact,
        language: TargetLanguage,
    ) -> Result<QualityOutcome, QualityError> {
        let syntax_validity = self.syntax_validity(artifact, language).await?;
        let (code_quality, static_analysis, feedback) =
            self.code_quality(analysis, artifact).await?;
        let requirement_coverage = self.requirement_coverage(analysis, artifact).await?;

        let outcome = QualityOutcome {
            passed: aggregate_score(code_quality, requirement_coverage, syntax_validity)
                >= QUALITY_GATE,
            code_quality,
            requirement_coverage,
            syntax_validity,
            feedback,
            static_analysis,
        };

        self.store
            .upsert_metrics(
                task_id,
                outcome.code_quality,
                outcome.requirement_coverage,
                outcome.syntax_validity,
                &outcome.static_analysis,
                &outcome.feedback,
            )
            .await?;

        debug!(
            task = %task_id,
            aggregate = outcome.aggregate(),
            passed = outcome.passed,
            "quality check recorded"
        );
        Ok(outcome)
    }

    /// Fraction of code files the validator judges syntactically valid,
    /// as a 0–100 score. No code files scores 0.
    async fn syntax_validity(
        &self,
        artifact: &Artifact,
        language: TargetLanguage,
    ) -> ProviderResult<f64> {
        let code_files: Vec<(&str, &str)> = artifact
            .iter()
            .filter(|(path, _)| has_extension(path, language.extensions()))
            .collect();
        if code_files.is_empty() {
            return Ok(0.0);
        }

        let options = CallOptions::default()
            .with_temperature(0.0)
            .with_max_tokens(8)
            .with_timeout(self.validation_timeout);
        let mut valid = 0usize;
        for (path, content) in &code_files {
            let prompt = format!(
                "Is the following {} file syntactically valid? Answer with the single word \
                 valid or invalid.\n\nFile: {}\n\n{}",
                language.as_str(),
                path,
                content
            );
            let outcome = self.registry.call(&prompt, None, &options).await?;
            if verdict_is_valid(&outcome.text) {
                valid += 1;
            } else {
                debug!(file = path, "validator judged file invalid");
            }
        }
        Ok(valid as f64 / code_files.len() as f64 * 100.0)
    }

    /// One rubric-scored evaluation over the truncated corpus.
    async fn code_quality(
        &self,
        analysis: &Analysis,
        artifact: &Artifact,
    ) -> ProviderResult<(f64, Value, String)> {
        let corpus = build_corpus(artifact);
        let prompt = format!(
            "Evaluate this implementation of \"{}\" on a 100-point rubric: correctness (30), \
             completeness (25), codeQuality (25), errorHandling (10), security (10).\n\
             Requirement: {}\n\n{}\n\n\
             Return a JSON object: {{\"totalScore\": number, \"scores\": {{\"correctness\": number, \
             \"completeness\": number, \"codeQuality\": number, \"errorHandling\": number, \
             \"security\": number}}, \"feedback\": string, \"issues\": [string]}}",
            analysis.title, analysis.functionality, corpus
        );
        let options = CallOptions::default()
            .with_temperature(0.0)
            .with_timeout(self.validation_timeout);
        let outcome = self.registry.call(&prompt, None, &options).await?;

        let value = extract::json_object(&outcome.text).ok_or_else(|| {
            ProviderError::parse(&outcome.provider, "evaluation response is not a JSON object")
        })?;
        let total = value.get("totalScore").and_then(Value::as_f64).unwrap_or(0.0);
        let scores = value.get("scores").cloned().unwrap_or(Value::Null);
        let feedback = value
            .get("feedback")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok((total.clamp(0.0, 100.0), scores, feedback))
    }

    /// 0.3 × file-structure coverage + 0.7 × LLM-judged functional
    /// coverage, both on a 100-point scale.
    async fn requirement_coverage(
        &self,
        analysis: &Analysis,
        artifact: &Artifact,
    ) -> ProviderResult<f64> {
        let structure = file_structure_coverage(analysis, artifact);

        let artifact_text = artifact
            .iter()
            .map(|(path, content)| format!("// {path}\n{content}"))
            .collect::<Vec<_>>()
            .join("\n\n");
        let joined = truncate_chars(&artifact_text, CORPUS_CHARS);
        let components = analysis.components.join(", ");
        let prompt = format!(
            "Given this required functionality:\n{}\nComponents: {}\n\n\
             And this generated code:\n{}\n\n\
             How completely does the code cover the requirement? Return a JSON object \
             {{\"coverageScore\": number from 0 to 100, \"reason\": string}}",
            analysis.functionality, components, joined
        );
        let options = CallOptions::default()
            .with_temperature(0.0)
            .with_timeout(self.validation_timeout);
        let outcome = self.registry.call(&prompt, None, &options).await?;

        let value = extract::json_object(&outcome.text).ok_or_else(|| {
            ProviderError::parse(&outcome.provider, "coverage response is not a JSON object")
        })?;
        let functional = value
            .get("coverageScore")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 100.0);

        Ok(0.3 * structure * 100.0 + 0.7 * functional)
    }
}

/// Fraction of required filenames (directories ignored) present in the
/// artifact by name equality or stem containment. 1.0 when the analysis
/// suggested no files.
pub fn file_structure_coverage(analysis: &Analysis, artifact: &Artifact) -> f64 {
    let required: Vec<&str> = analysis
        .file_structure
        .iter()
        .filter_map(|p| p.rsplit('/').next())
        .filter(|n| !n.is_empty())
        .collect();
    if required.is_empty() {
        return 1.0;
    }

    let generated = artifact.file_names();
    let matched = required
        .iter()
        .filter(|name| {
            let required_stem = stem(name);
            generated.iter().any(|g| {
                *g == **name || {
                    let generated_stem = stem(g);
                    generated_stem.contains(required_stem) || required_stem.contains(generated_stem)
                }
            })
        })
        .count();
    matched as f64 / required.len() as f64
}

fn stem(name: &str) -> &str {
    name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name)
}

fn has_extension(path: &str, extensions: &[&str]) -> bool {
    path.rsplit_once('.')
        .map(|(_, ext)| extensions.contains(&ext))
        .unwrap_or(false)
}

/// The single-word verdict; anything other than a clear "valid" counts
/// as invalid, and "invalid" is checked first since it contains "valid".
fn verdict_is_valid(text: &str) -> bool {
    let lower = text.trim().to_lowercase();
    !lower.contains("invalid") && lower.contains("valid")
}

fn build_corpus(artifact: &Artifact) -> String {
    let mut corpus = String::new();
    for (path, content) in artifact.iter() {
        if corpus.len() >= CORPUS_CHARS {
            break;
        }
        corpus.push_str(&format!("// {path}\n{}\n\n", truncate_chars(content, FILE_EXCERPT_CHARS)));
    }
    truncate_chars(&corpus, CORPUS_CHARS).to_string()
}

/// Truncate to at most `max` characters on a char boundary.
fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}
