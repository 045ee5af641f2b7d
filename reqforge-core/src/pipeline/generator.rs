//! Code generation stage
//!
//! Produces the path-to-content artifact from an [`Analysis`] and the
//! target language. The model is asked for a JSON object keyed by file
//! path; the parser degrades through path-headed code fences and
//! markdown-header/fence pairing. Multi-model mode fans the same prompt
//! out over the local ollama providers and keeps the largest artifact
//! for the main branch.

use crate::artifact::Artifact;
use crate::llm::{CallOptions, Protocol, ProviderError, ProviderRegistry, ProviderResult};
use crate::pipeline::analyzer::Analysis;
use crate::pipeline::extract;
use crate::store::TargetLanguage;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const GENERATION_SYSTEM_PROMPT: &str = "You are an expert software engineer. Answer with a single \
     JSON object whose keys are relative file paths and whose values are complete file contents. \
     No explanations outside the JSON.";

/// Style guidance per target language, keyed on the lower-cased name.
/// Unknown languages get the generic fallback.
pub fn language_context(language: &str) -> &'static str {
    match language.to_lowercase().as_str() {
        "typescript" => {
            "Use strict TypeScript: explicit types on exported APIs, interfaces for data \
             shapes, async/await over raw promises, and ES module imports."
        }
        "javascript" => {
            "Use modern JavaScript (ES2022): const/let, async/await, ES modules, and JSDoc \
             comments on exported functions."
        }
        "python" => {
            "Use Python 3 with type hints, dataclasses for records, snake_case naming, and \
             docstrings on public functions. Follow PEP 8."
        }
        "java" => {
            "Use idiomatic Java: one public class per file, constructor injection, camelCase \
             methods, and javadoc on public APIs."
        }
        "csharp" => {
            "Use idiomatic C#: PascalCase members, async/await with Task, dependency \
             injection via constructors, and XML doc comments."
        }
        "go" => {
            "Use idiomatic Go: small interfaces, error values over exceptions, gofmt layout, \
             and package-level doc comments."
        }
        "ruby" => {
            "Use idiomatic Ruby: snake_case naming, modules for namespacing, and frozen \
             string literals."
        }
        "php" => {
            "Use modern PHP (8+): strict_types, PSR-12 layout, typed properties, and \
             namespaced classes."
        }
        _ => "Follow standard conventions for the language.",
    }
}

/// Default commit output path: the mode of the leading path segments of
/// the suggested file structure, else the per-language default.
pub fn default_output_path(analysis: &Analysis, language: TargetLanguage) -> String {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    for path in &analysis.file_structure {
        if let Some((first, _)) = path.split_once('/') {
            let count = counts.entry(first).or_insert(0);
            if *count == 0 {
                order.push(first);
            }
            *count += 1;
        }
    }
    order
        .into_iter()
        .max_by_key(|segment| counts[segment])
        .map(str::to_string)
        .unwrap_or_else(|| language.default_output_path().to_string())
}

/// An artifact produced by one provider in comparison mode
#[derive(Debug, Clone)]
pub struct ComparisonArtifact {
    pub provider: String,
    pub artifact: Artifact,
}

/// Result of the generation stage
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub artifact: Artifact,
    pub provider: String,
    /// Non-selected artifacts destined for comparison branches
    pub comparisons: Vec<ComparisonArtifact>,
}

/// Generation stage, bound to the provider registry
pub struct CodeGenerator {
    registry: Arc<ProviderRegistry>,
    timeout: Duration,
}

impl CodeGenerator {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry, timeout: Duration::from_secs(120) }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Generate with the default provider (and fallback chain).
    pub async fn generate(
        &self,
        analysis: &Analysis,
        language: TargetLanguage,
        additional_context: Option<&str>,
    ) -> ProviderResult<GenerationOutcome> {
        let prompt = build_prompt(analysis, language, additional_context);
        let options = CallOptions::default()
            .with_temperature(0.2)
            .with_timeout(self.timeout);
        let outcome = self.registry.call(&prompt, Some(GENERATION_SYSTEM_PROMPT), &options).await?;
        let artifact = parse_artifact(&outcome.text);
        debug!(provider = %outcome.provider, files = artifact.len(), "artifact generated");
        Ok(GenerationOutcome { artifact, provider: outcome.provider, comparisons: Vec::new() })
    }

    /// Fan the generation prompt out over the enabled ollama providers,
    /// selecting the artifact with the most files for the main commit.
    /// Remaining non-empty artifacts become comparison candidates.
    pub async fn generate_multi_model(
        &self,
        analysis: &Analysis,
        language: TargetLanguage,
        additional_context: Option<&str>,
    ) -> ProviderResult<GenerationOutcome> {
        let providers = self.registry.providers_for_protocol(Protocol::OllamaGenerate);
        if providers.is_empty() {
            debug!("no ollama providers configured, multi-model falls back to single generation");
            return self.generate(analysis, language, additional_context).await;
        }

        let prompt = build_prompt(analysis, language, additional_context);
        let calls = providers.iter().map(|provider| {
            let options = CallOptions::default()
                .with_provider(provider.clone())
                .with_temperature(0.2)
                .with_timeout(self.timeout)
                .no_fallback();
            let registry = Arc::clone(&self.registry);
            let prompt = prompt.clone();
            async move {
                let result = registry.call(&prompt, Some(GENERATION_SYSTEM_PROMPT), &options).await;
                (provider.clone(), result)
            }
        });
        let results = futures::future::join_all(calls).await;

        let mut candidates: Vec<ComparisonArtifact> = Vec::new();
        let mut last_error: Option<ProviderError> = None;
        let attempted = results.len();
        for (provider, result) in results {
            match result {
                Ok(outcome) => {
                    let artifact = parse_artifact(&outcome.text);
                    candidates.push(ComparisonArtifact { provider, artifact });
                }
                Err(err) => {
                    warn!(provider = %provider, error = %err, "comparison candidate failed");
                    last_error = Some(err);
                }
            }
        }

        if candidates.is_empty() {
            return Err(ProviderError::Exhausted {
                attempted,
                last: Box::new(last_error.unwrap_or(ProviderError::NoProviders)),
            });
        }

        // Highest file count wins; ties keep the earlier provider.
        let best_index = candidates
            .iter()
            .enumerate()
            .max_by(|(ai, a), (bi, b)| {
                a.artifact.len().cmp(&b.artifact.len()).then(bi.cmp(ai))
            })
            .map(|(i, _)| i)
            .unwrap_or(0);
        let best = candidates.remove(best_index);
        candidates.retain(|c| !c.artifact.is_empty());

        info!(
            provider = %best.provider,
            files = best.artifact.len(),
            comparisons = candidates.len(),
            "multi-model generation selected best artifact"
        );
        Ok(GenerationOutcome {
            artifact: best.artifact,
            provider: best.provider,
            comparisons: candidates,
        })
    }
}

fn build_prompt(
    analysis: &Analysis,
    language: TargetLanguage,
    additional_context: Option<&str>,
) -> String {
    let components = if analysis.components.is_empty() {
        "(none listed)".to_string()
    } else {
        analysis
            .components
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let file_structure = if analysis.file_structure.is_empty() {
        "(choose sensible paths)".to_string()
    } else {
        analysis
            .file_structure
            .iter()
            .map(|p| format!("- {p}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let mut prompt = format!(
        "Implement the following design in {}.\n\n\
         Title: {}\n\
         Functionality: {}\n\
         Components:\n{}\n\
         Inputs and outputs: {}\n\
         Dependencies: {}\n\
         File structure:\n{}\n\n\
         Language guidance: {}\n\n\
         Return a JSON object mapping each relative file path to its full contents.",
        language.as_str(),
        analysis.title,
        analysis.functionality,
        components,
        analysis.inputs_outputs,
        analysis.dependencies,
        file_structure,
        language_context(language.as_str()),
    );
    if let Some(strategy) = &analysis.implementation_strategy {
        prompt.push_str("\nImplementation strategy: ");
        prompt.push_str(strategy);
    }
    if let Some(context) = additional_context {
        prompt.push_str("\nAdditional context: ");
        prompt.push_str(context);
    }
    prompt
}

/// Parse model output into an artifact.
///
/// Ladder: JSON object of path→content (directly or under a "files"
/// key), then path-headed code fences, then markdown filename headers
/// paired with the following fence.
pub fn parse_artifact(text: &str) -> Artifact {
    if let Some(value) = extract::json_object(text) {
        let map = match value.get("files") {
            Some(Value::Object(files)) => Some(files),
            _ => value.as_object(),
        };
        if let Some(map) = map {
            let artifact: Artifact = map
                .iter()
                .filter_map(|(path, content)| {
                    content.as_str().map(|c| (path.clone(), c.to_string()))
                })
                .collect();
            if !artifact.is_empty() {
                return artifact;
            }
        }
    }

    let fences = extract::code_fences(text);

    let mut artifact = Artifact::new();
    for fence in &fences {
        if let Some((path, body)) = extract::path_headed_fence(fence) {
            let _ = artifact.insert(path, body);
        }
    }
    if !artifact.is_empty() {
        return artifact;
    }

    // Pair each filename header with the first fence that follows it.
    let headers = extract::filename_headers(text);
    let mut artifact = Artifact::new();
    for (i, (position, name)) in headers.iter().enumerate() {
        let next_header = headers.get(i + 1).map(|(p, _)| *p).unwrap_or(usize::MAX);
        if let Some(fence) = fences
            .iter()
            .find(|f| f.start > *position && f.start < next_header)
        {
            let _ = artifact.insert(name.clone(), fence.body.trim_end().to_string());
        }
    }
    artifact
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedBackend;
    use crate::llm::{ProviderConfig, RegistryConfig};

    fn analysis_with_files(files: &[&str]) -> Analysis {
        Analysis {
            title: "Auth".to_string(),
            file_structure: files.iter().map(|s| s.to_string()).collect(),
            ..Analysis::default()
        }
    }

    #[test]
    fn json_artifact_is_parsed() {
        let text = r#"{"src/a.ts": "export const a = 1;", "src/b.ts": ""}"#;
        let artifact = parse_artifact(text);
        assert_eq!(artifact.len(), 2);
        assert_eq!(artifact.get("src/a.ts"), Some("export const a = 1;"));
        assert_eq!(artifact.get("src/b.ts"), Some(""));
    }

    #[test]
    fn files_wrapper_key_is_unwrapped() {
        let text = r#"{"files": {"src/a.ts": "x"}, "notes": "ignored"}"#;
        let artifact = parse_artifact(text);
        assert_eq!(artifact.len(), 1);
        assert_eq!(artifact.get("src/a.ts"), Some("x"));
    }

    #[test]
    fn path_headed_fences_are_collected() {
        let text = "Sure!\n```ts\n// src/a.ts\nconst a = 1;\n```\n```ts\n// src/b.ts\nconst b = 2;\n```\n";
        let artifact = parse_artifact(text);
        let paths: Vec<_> = artifact.paths().collect();
        assert_eq!(paths, vec!["src/a.ts", "src/b.ts"]);
        assert_eq!(artifact.get("src/a.ts"), Some("const a = 1;"));
    }

    #[test]
    fn markdown_headers_pair_with_following_fences() {
        let text = "\
## src/a.ts
```ts
const a = 1;
```
## src/b.ts
```ts
const b = 2;
```
";
        let artifact = parse_artifact(text);
        assert_eq!(artifact.len(), 2);
        assert_eq!(artifact.get("src/b.ts"), Some("const b = 2;"));
    }

    #[test]
    fn unparseable_output_yields_empty_artifact() {
        assert!(parse_artifact("no code here at all").is_empty());
    }

    #[test]
    fn output_path_is_the_mode_of_leading_segments() {
        let analysis = analysis_with_files(&[
            "src/a.ts",
            "src/b.ts",
            "tests/a.test.ts",
            "README.md",
        ]);
        assert_eq!(default_output_path(&analysis, TargetLanguage::Typescript), "src");
    }

    #[test]
    fn empty_file_structure_uses_language_default() {
        let analysis = analysis_with_files(&[]);
        assert_eq!(default_output_path(&analysis, TargetLanguage::Java), "src/main/java");
        assert_eq!(default_output_path(&analysis, TargetLanguage::Go), "pkg");
        assert_eq!(default_output_path(&analysis, TargetLanguage::Typescript), "src");
    }

    #[test]
    fn unknown_language_context_is_generic() {
        assert_eq!(language_context("cobol"), "Follow standard conventions for the language.");
        assert!(language_context("TypeScript").contains("TypeScript"));
    }

    fn ollama_provider(id: &str) -> ProviderConfig {
        ProviderConfig::new(id, Protocol::OllamaGenerate, "http://localhost:11434", "ollama", id)
    }

    #[tokio::test]
    async fn multi_model_selects_largest_artifact() {
        let mut registry = ProviderRegistry::new(RegistryConfig::default());
        registry.register(
            ollama_provider("ollama-small"),
            Arc::new(ScriptedBackend::replying(r#"{"src/a.ts": "a"}"#)),
        );
        registry.register(
            ollama_provider("ollama-big"),
            Arc::new(ScriptedBackend::replying(
                r#"{"src/a.ts": "a", "src/b.ts": "b", "src/c.ts": "c"}"#,
            )),
        );
        registry.register(
            ollama_provider("ollama-broken"),
            Arc::new(ScriptedBackend::failing()),
        );

        let generator = CodeGenerator::new(Arc::new(registry));
        let outcome = generator
            .generate_multi_model(&Analysis::default(), TargetLanguage::Typescript, None)
            .await
            .unwrap();
        assert_eq!(outcome.provider, "ollama-big");
        assert_eq!(outcome.artifact.len(), 3);
        assert_eq!(outcome.comparisons.len(), 1);
        assert_eq!(outcome.comparisons[0].provider, "ollama-small");
    }

    #[tokio::test]
    async fn multi_model_fails_when_every_provider_fails() {
        let mut registry = ProviderRegistry::new(RegistryConfig::default());
        registry.register(ollama_provider("ollama-a"), Arc::new(ScriptedBackend::failing()));
        registry.register(ollama_provider("ollama-b"), Arc::new(ScriptedBackend::failing()));

        let generator = CodeGenerator::new(Arc::new(registry));
        let err = generator
            .generate_multi_model(&Analysis::default(), TargetLanguage::Typescript, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Exhausted { attempted: 2, .. }));
    }

    #[tokio::test]
    async fn multi_model_without_ollama_falls_back_to_default_generation() {
        let mut registry = ProviderRegistry::new(RegistryConfig::default());
        registry.register(
            ProviderConfig::new("openai", Protocol::OpenaiChat, "http://x", "k", "m"),
            Arc::new(ScriptedBackend::replying(r#"{"src/a.ts": "a"}"#)),
        );

        let generator = CodeGenerator::new(Arc::new(registry));
        let outcome = generator
            .generate_multi_model(&Analysis::default(), TargetLanguage::Typescript, None)
            .await
            .unwrap();
        assert_eq!(outcome.provider, "openai");
        assert!(outcome.comparisons.is_empty());
    }
}
