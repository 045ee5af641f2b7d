//! Requirement analysis stage
//!
//! Turns requirement text into a structured [`Analysis`] via the provider
//! registry. The model is asked for JSON; when it answers in prose the
//! parser degrades through the extraction ladder in [`super::extract`].

use crate::llm::{CallOptions, ProviderRegistry, ProviderResult};
use crate::pipeline::extract;
use crate::store::TargetLanguage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const ANALYSIS_SYSTEM_PROMPT: &str =
    "You are a senior software architect. Answer with a single JSON object and nothing else.";

const SECTION_LABELS: &[(&str, &str)] = &[
    ("title", "title"),
    ("functionality", "main functionality"),
    ("components", "(?:components|modules)"),
    ("inputs_outputs", "inputs and outputs"),
    ("dependencies", "dependencies or constraints"),
    ("file_structure", "file structure"),
    ("implementation_strategy", "implementation strategy"),
];

/// Kind of a constraint surfaced by the analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintKind {
    #[default]
    Technical,
    Business,
    Security,
}

impl ConstraintKind {
    /// Map free-form kind text (English or Chinese tokens) onto the
    /// closed set; unknown tokens degrade to technical. Security stays a
    /// distinct kind.
    pub fn normalize(raw: &str) -> Self {
        let lower = raw.trim().to_lowercase();
        if lower.contains("security") || lower.contains("安全") {
            ConstraintKind::Security
        } else if lower.contains("business") || lower.contains("业务") {
            ConstraintKind::Business
        } else {
            ConstraintKind::Technical
        }
    }
}

/// A single constraint from the analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub kind: ConstraintKind,
    pub description: String,
}

/// Structured decomposition of one requirement.
///
/// Every field is always present; empty strings and lists are valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub title: String,
    pub functionality: String,
    pub components: Vec<String>,
    pub inputs_outputs: String,
    pub dependencies: String,
    pub file_structure: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implementation_strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<Constraint>,
}

impl Analysis {
    /// Build from a parsed JSON object, accepting the key spellings
    /// models actually produce.
    pub fn from_json(value: &Value) -> Self {
        let strategy = get_string(
            value,
            &["implementation_strategy", "implementationStrategy", "strategy"],
        );
        Self {
            title: get_string(value, &["title"]).unwrap_or_default(),
            functionality: get_string(
                value,
                &["functionality", "main_functionality", "mainFunctionality"],
            )
            .unwrap_or_default(),
            components: get_list(value, &["components", "modules"]),
            inputs_outputs: get_string(
                value,
                &["inputs_outputs", "inputsAndOutputs", "inputs_and_outputs", "io"],
            )
            .unwrap_or_default(),
            dependencies: get_string(
                value,
                &["dependencies", "dependenciesAndConstraints", "dependencies_or_constraints"],
            )
            .unwrap_or_default(),
            file_structure: sanitize_paths(get_list(value, &["file_structure", "fileStructure"])),
            implementation_strategy: strategy.filter(|s| !s.is_empty()),
            constraints: get_constraints(value),
        }
    }

    /// Build from prose via label-anchored section scraping. Missing
    /// labels yield empty fields.
    pub fn from_sections(text: &str) -> Self {
        let sections = extract::labeled_sections(text, SECTION_LABELS);
        let field = |key: &str| sections.get(key).cloned().unwrap_or_default();
        let strategy = field("implementation_strategy");
        Self {
            title: field("title").lines().next().unwrap_or_default().trim().to_string(),
            functionality: field("functionality"),
            components: extract::split_list(&field("components")),
            inputs_outputs: field("inputs_outputs"),
            dependencies: field("dependencies"),
            file_structure: sanitize_paths(extract::split_list(&field("file_structure"))),
            implementation_strategy: (!strategy.is_empty()).then_some(strategy),
            constraints: Vec::new(),
        }
    }

    /// Parse model output: strict JSON, extracted JSON, then sections.
    pub fn parse(text: &str) -> Self {
        match extract::json_object(text) {
            Some(value) => Self::from_json(&value),
            None => Self::from_sections(text),
        }
    }
}

fn get_string(value: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match value.get(key) {
            Some(Value::String(s)) => return Some(s.trim().to_string()),
            Some(Value::Array(items)) => {
                let joined: Vec<String> = items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.trim().to_string())
                    .collect();
                if !joined.is_empty() {
                    return Some(joined.join("\n"));
                }
            }
            _ => {}
        }
    }
    None
}

fn get_list(value: &Value, keys: &[&str]) -> Vec<String> {
    for key in keys {
        match value.get(key) {
            Some(Value::Array(items)) => {
                return items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            Some(Value::String(s)) => return extract::split_list(s),
            _ => {}
        }
    }
    Vec::new()
}

fn get_constraints(value: &Value) -> Vec<Constraint> {
    let Some(items) = value.get("constraints").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(Constraint {
                kind: ConstraintKind::Technical,
                description: s.trim().to_string(),
            }),
            Value::Object(_) => {
                let description =
                    get_string(item, &["description", "text", "constraint"])?;
                let kind = get_string(item, &["kind", "type"])
                    .map(|k| ConstraintKind::normalize(&k))
                    .unwrap_or_default();
                Some(Constraint { kind, description })
            }
            _ => None,
        })
        .filter(|c| !c.description.is_empty())
        .collect()
}

/// Keep only entries parseable as relative POSIX paths.
fn sanitize_paths(paths: Vec<String>) -> Vec<String> {
    paths
        .into_iter()
        .filter_map(|raw| {
            let cleaned = raw.trim().trim_matches('`').replace('\\', "/");
            let segments: Vec<&str> =
                cleaned.split('/').filter(|s| !s.is_empty() && *s != ".").collect();
            if segments.is_empty() || segments.contains(&"..") || cleaned.starts_with('/') {
                warn!(path = %raw, "dropping unusable file-structure entry");
                None
            } else {
                Some(segments.join("/"))
            }
        })
        .collect()
}

/// Analysis stage, bound to the provider registry
pub struct RequirementAnalyzer {
    registry: Arc<ProviderRegistry>,
    /// Provider asked first; the fallback chain still applies
    preferred_provider: Option<String>,
    timeout: Duration,
}

impl RequirementAnalyzer {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry, preferred_provider: None, timeout: Duration::from_secs(60) }
    }

    pub fn with_preferred_provider(mut self, provider: Option<String>) -> Self {
        self.preferred_provider = provider;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Analyze the requirement; returns the analysis and the provider
    /// that produced it.
    pub async fn analyze(
        &self,
        requirement: &str,
        language: TargetLanguage,
        template_content: Option<&str>,
    ) -> ProviderResult<(Analysis, String)> {
        let prompt = self.build_prompt(requirement, language, template_content);
        let mut options = CallOptions::default()
            .with_temperature(0.1)
            .with_timeout(self.timeout);
        if let Some(provider) = &self.preferred_provider {
            options = options.with_provider(provider.clone());
        }

        let outcome = self.registry.call(&prompt, Some(ANALYSIS_SYSTEM_PROMPT), &options).await?;
        let analysis = Analysis::parse(&outcome.text);
        debug!(
            provider = %outcome.provider,
            components = analysis.components.len(),
            files = analysis.file_structure.len(),
            "requirement analyzed"
        );
        Ok((analysis, outcome.provider))
    }

    fn build_prompt(
        &self,
        requirement: &str,
        language: TargetLanguage,
        template_content: Option<&str>,
    ) -> String {
        let mut prompt = format!(
            "Analyze the following software requirement for a {} project.\n\
             Produce a JSON object with these keys:\n\
             - \"title\": short name for the feature\n\
             - \"functionality\": the main functionality, one paragraph\n\
             - \"components\": array of components or modules to build\n\
             - \"inputs_outputs\": inputs and outputs, free text\n\
             - \"dependencies\": dependencies or constraints, free text\n\
             - \"file_structure\": array of suggested relative file paths\n\
             - \"implementation_strategy\": suggested implementation approach\n\n\
             Requirement:\n{}\n",
            language.as_str(),
            requirement
        );
        if let Some(template) = template_content {
            prompt.push_str("\nBase the file structure on this template:\n");
            prompt.push_str(template);
            prompt.push('\n');
        }
        prompt
    }
}
