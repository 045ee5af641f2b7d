//! End-to-end pipeline tests over scripted backends, an in-memory
//! database, and local bare repositories standing in for remotes.

use git2::{Repository, Signature};
use reqforge_core::llm::testing::ScriptedBackend;
use reqforge_core::llm::{ChatBackend, Protocol, ProviderConfig, ProviderRegistry, RegistryConfig};
use reqforge_core::pipeline::analyzer::RequirementAnalyzer;
use reqforge_core::pipeline::generator::CodeGenerator;
use reqforge_core::pipeline::quality::QualityChecker;
use reqforge_core::pipeline::Pipeline;
use reqforge_core::queue::{JobQueue, JobState, QueueConfig};
use reqforge_core::service::{RequirementService, SubmitRequest};
use reqforge_core::store::{TaskStatus, TaskStore};
use reqforge_core::vcs::{ArtifactCommitter, GitIdentity};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

const ANALYSIS_REPLY: &str = r#"{
    "title": "User Authentication",
    "functionality": "Register, login and password reset",
    "components": ["AuthService", "AuthController"],
    "inputs_outputs": "credentials in, tokens out",
    "dependencies": "bcrypt, jwt",
    "file_structure": ["src/auth.service.ts", "src/auth.controller.ts"]
}"#;

const GENERATION_REPLY: &str = r#"{
    "src/auth.service.ts": "export class AuthService { register() {} login() {} reset() {} }",
    "src/auth.controller.ts": "export class AuthController {}"
}"#;

/// Scripted replies for every pipeline prompt in one backend.
fn full_backend() -> ScriptedBackend {
    ScriptedBackend::new()
        .when("Analyze the following software requirement", ANALYSIS_REPLY)
        .when("Return a JSON object mapping each relative file path", GENERATION_REPLY)
        .when("syntactically valid", "valid")
        .when(
            "100-point rubric",
            r#"{"totalScore": 92, "scores": {"correctness": 28, "completeness": 24}, "feedback": "well structured"}"#,
        )
        .when("coverageScore", r#"{"coverageScore": 95, "reason": "covers the flows"}"#)
}

/// A bare repository with one empty seed commit on `main`.
fn bare_remote() -> (TempDir, String) {
    let dir = TempDir::new().unwrap();
    let repo = Repository::init_bare(dir.path()).unwrap();
    let tree_id = repo.treebuilder(None).unwrap().write().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let signature = Signature::now("seed", "seed@example.com").unwrap();
    repo.commit(Some("refs/heads/main"), &signature, &signature, "init", &tree, &[]).unwrap();
    repo.set_head("refs/heads/main").unwrap();
    (dir, repo.path().to_str().unwrap().trim_end_matches('/').to_string())
}

struct World {
    service: RequirementService,
    store: Arc<TaskStore>,
    queue: Arc<JobQueue>,
}

async fn build_world(
    providers: Vec<(ProviderConfig, Arc<dyn ChatBackend>)>,
    default_provider: &str,
    fallback_order: &[&str],
    enforce_gate: bool,
) -> World {
    let pool = reqforge_core::store::connect("sqlite::memory:").await.unwrap();
    let store = Arc::new(TaskStore::new(pool.clone()));
    store.init_schema().await.unwrap();

    let queue_config = QueueConfig {
        concurrency: 2,
        max_attempts: 3,
        backoff_base: Duration::from_millis(20),
        poll_interval: Duration::from_millis(10),
        heartbeat_interval: Duration::from_millis(100),
        stall_timeout: Duration::from_secs(60),
    };
    let queue = Arc::new(JobQueue::new(pool, queue_config));
    queue.init_schema().await.unwrap();

    let mut registry = ProviderRegistry::new(RegistryConfig {
        providers: Vec::new(),
        default_provider: default_provider.to_string(),
        fallback_order: fallback_order.iter().map(|s| s.to_string()).collect(),
    });
    for (config, backend) in providers {
        registry.register(config, backend);
    }
    let registry = Arc::new(registry);

    let pipeline = Pipeline::new(
        Arc::clone(&store),
        RequirementAnalyzer::new(Arc::clone(&registry)),
        CodeGenerator::new(Arc::clone(&registry)),
        QualityChecker::new(Arc::clone(&registry), Arc::clone(&store)),
        ArtifactCommitter::new(GitIdentity::default()),
        enforce_gate,
    );
    queue.register_processor(Arc::new(pipeline));

    let service = RequirementService::new(Arc::clone(&store), Arc::clone(&queue));
    World { service, store, queue }
}

fn submit_request(remote_url: &str) -> SubmitRequest {
    SubmitRequest {
        project_id: "p1".to_string(),
        repository_url: remote_url.to_string(),
        branch: "feat/auth".to_string(),
        requirement_text: "User authentication with register, login, password reset".to_string(),
        priority: None,
        additional_context: None,
        language: None,
        output_path: None,
        template_id: None,
        multi_model: false,
    }
}

async fn wait_for_terminal(world: &World, task_id: Uuid) -> TaskStatus {
    for _ in 0..500 {
        let task = world.store.get_task(task_id).await.unwrap();
        if task.status.is_terminal() {
            return task.status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never reached a terminal status");
}

fn branch_files(remote_url: &str, branch: &str) -> Option<Vec<String>> {
    let repo = Repository::open_bare(remote_url).unwrap();
    let reference = repo.find_reference(&format!("refs/heads/{branch}")).ok()?;
    let commit = reference.peel_to_commit().unwrap();
    let tree = commit.tree().unwrap();
    let mut paths = Vec::new();
    tree.walk(git2::TreeWalkMode::PreOrder, |root, entry| {
        if entry.kind() == Some(git2::ObjectType::Blob) {
            paths.push(format!("{root}{}", entry.name().unwrap_or("")));
        }
        git2::TreeWalkResult::Ok
    })
    .unwrap();
    paths.sort();
    Some(paths)
}

fn provider(id: &str, protocol: Protocol) -> ProviderConfig {
    ProviderConfig::new(id, protocol, "http://scripted", "key", "model")
}

#[tokio::test]
async fn happy_path_typescript_lands_one_commit() {
    let (_remote_dir, remote_url) = bare_remote();
    let world = build_world(
        vec![(provider("judge", Protocol::OpenaiChat), Arc::new(full_backend()))],
        "judge",
        &[],
        false,
    )
    .await;

    let receipt = world.service.submit(submit_request(&remote_url)).await.unwrap();
    let workers = world.service.start_workers().unwrap();
    let status = wait_for_terminal(&world, receipt.task_id).await;
    workers.shutdown().await;

    assert_eq!(status, TaskStatus::Completed);

    let view = world.service.task_status(receipt.task_id).await.unwrap();
    assert_eq!(view.task.progress, 1.0);
    assert_eq!(view.queue_info.state, JobState::Completed);

    let details = &view.task.details;
    let commit_hash = details.commit_hash.as_deref().unwrap();
    assert!(!commit_hash.is_empty());
    assert_eq!(
        details.files_changed.as_deref().unwrap(),
        ["src/auth.controller.ts", "src/auth.service.ts"]
    );
    assert_eq!(details.analysis_model.as_deref(), Some("judge"));
    assert_eq!(details.quality_passed, Some(true));

    // One pushed commit whose message starts with the feat prefix.
    let files = branch_files(&remote_url, "feat/auth").unwrap();
    assert_eq!(files, ["src/auth.controller.ts", "src/auth.service.ts"]);
    let repo = Repository::open_bare(&remote_url).unwrap();
    let commit = repo.find_reference("refs/heads/feat/auth").unwrap().peel_to_commit().unwrap();
    assert!(commit.message().unwrap().starts_with("feat: implement User Authentication"));
    assert_eq!(commit.id().to_string(), commit_hash);

    let metrics = &view.quality_metrics;
    assert_eq!(metrics.len(), 1);
    assert!(metrics[0].aggregate_score >= 85.0);
}

#[tokio::test]
async fn analyzer_falls_back_to_the_next_provider() {
    let (_remote_dir, remote_url) = bare_remote();
    let world = build_world(
        vec![
            (
                provider("primary", Protocol::OpenaiChat),
                Arc::new(ScriptedBackend::failing_with(503, "overloaded")),
            ),
            (provider("backup", Protocol::OpenaiChat), Arc::new(full_backend())),
        ],
        "primary",
        &["primary", "backup"],
        false,
    )
    .await;

    let receipt = world.service.submit(submit_request(&remote_url)).await.unwrap();
    let workers = world.service.start_workers().unwrap();
    let status = wait_for_terminal(&world, receipt.task_id).await;
    workers.shutdown().await;

    assert_eq!(status, TaskStatus::Completed);
    let task = world.store.get_task(receipt.task_id).await.unwrap();
    assert_eq!(task.details.analysis_model.as_deref(), Some("backup"));
    assert!(task.details.analysis.is_some());
}

#[tokio::test]
async fn quality_gate_failure_blocks_the_commit() {
    let (_remote_dir, remote_url) = bare_remote();
    let backend = ScriptedBackend::new()
        .when("Analyze the following software requirement", ANALYSIS_REPLY)
        .when("Return a JSON object mapping each relative file path", GENERATION_REPLY)
        .when("syntactically valid", "invalid")
        .when("100-point rubric", r#"{"totalScore": 40, "scores": {}, "feedback": "incomplete"}"#)
        .when("coverageScore", r#"{"coverageScore": 20, "reason": "stubs only"}"#);
    let world = build_world(
        vec![(provider("judge", Protocol::OpenaiChat), Arc::new(backend))],
        "judge",
        &[],
        true,
    )
    .await;

    let receipt = world.service.submit(submit_request(&remote_url)).await.unwrap();
    let workers = world.service.start_workers().unwrap();
    let status = wait_for_terminal(&world, receipt.task_id).await;
    workers.shutdown().await;

    assert_eq!(status, TaskStatus::Failed);
    let task = world.store.get_task(receipt.task_id).await.unwrap();
    assert_eq!(task.details.error.as_deref(), Some("Low code quality score"));
    assert_eq!(task.details.stage.as_deref(), Some("quality_check"));
    assert_eq!(task.progress, 0.0);

    // The metrics row exists even though no commit was pushed.
    let metrics = world.store.metrics_by_task(receipt.task_id).await.unwrap();
    assert_eq!(metrics.len(), 1);
    assert!(branch_files(&remote_url, "feat/auth").is_none());
}

#[tokio::test]
async fn multi_model_pushes_comparison_branches() {
    let (_remote_dir, remote_url) = bare_remote();
    let judge = ScriptedBackend::new()
        .when("Analyze the following software requirement", ANALYSIS_REPLY)
        .when("syntactically valid", "valid")
        .when("100-point rubric", r#"{"totalScore": 92, "scores": {}, "feedback": "good"}"#)
        .when("coverageScore", r#"{"coverageScore": 95, "reason": "ok"}"#);
    let two_files = r#"{"src/a.ts": "const a = 1;", "src/b.ts": "const b = 2;"}"#;
    let four_files = r#"{"src/a.ts": "1", "src/b.ts": "2", "src/c.ts": "3", "src/d.ts": "4"}"#;
    let one_file = r#"{"src/a.ts": "const a = 1;"}"#;

    let world = build_world(
        vec![
            (provider("judge", Protocol::OpenaiChat), Arc::new(judge)),
            (
                provider("ollama-small", Protocol::OllamaGenerate),
                Arc::new(ScriptedBackend::replying(two_files)),
            ),
            (
                provider("ollama-big", Protocol::OllamaGenerate),
                Arc::new(ScriptedBackend::replying(four_files)),
            ),
            (
                provider("ollama-tiny", Protocol::OllamaGenerate),
                Arc::new(ScriptedBackend::replying(one_file)),
            ),
        ],
        "judge",
        &[],
        false,
    )
    .await;

    let mut request = submit_request(&remote_url);
    request.multi_model = true;
    let receipt = world.service.submit(request).await.unwrap();
    let workers = world.service.start_workers().unwrap();
    let status = wait_for_terminal(&world, receipt.task_id).await;
    workers.shutdown().await;

    assert_eq!(status, TaskStatus::Completed);
    let task = world.store.get_task(receipt.task_id).await.unwrap();
    assert_eq!(task.details.generation_model.as_deref(), Some("ollama-big"));

    // The largest artifact landed on the main branch.
    let main_files = branch_files(&remote_url, "feat/auth").unwrap();
    assert_eq!(main_files.len(), 4);

    // The remaining non-empty artifacts landed on comparison branches.
    let comparisons = task.details.comparison_branches.as_deref().unwrap();
    assert_eq!(comparisons.len(), 2);
    for comparison in comparisons {
        assert_eq!(comparison.branch, format!("feat/auth-{}", comparison.provider));
        assert!(!comparison.commit_hash.is_empty());
        let files = branch_files(&remote_url, &comparison.branch).unwrap();
        assert_eq!(files.len(), comparison.file_count);
    }
}

#[tokio::test]
async fn transient_provider_failure_is_retried_to_completion() {
    let (_remote_dir, remote_url) = bare_remote();
    let backend = full_backend().fail_first(1);
    let world = build_world(
        vec![(provider("judge", Protocol::OpenaiChat), Arc::new(backend))],
        "judge",
        &[],
        false,
    )
    .await;

    let receipt = world.service.submit(submit_request(&remote_url)).await.unwrap();
    let workers = world.service.start_workers().unwrap();
    let status = wait_for_terminal(&world, receipt.task_id).await;
    workers.shutdown().await;

    assert_eq!(status, TaskStatus::Completed);
    let job = world.queue.job_status(receipt.task_id).await.unwrap();
    assert_eq!(job.attempts, 2);
}

#[tokio::test]
async fn attempt_exhaustion_marks_the_task_failed() {
    let (_remote_dir, remote_url) = bare_remote();
    let world = build_world(
        vec![(
            provider("judge", Protocol::OpenaiChat),
            Arc::new(ScriptedBackend::failing_with(503, "permanently overloaded")),
        )],
        "judge",
        &[],
        false,
    )
    .await;

    let receipt = world.service.submit(submit_request(&remote_url)).await.unwrap();
    let workers = world.service.start_workers().unwrap();
    let status = wait_for_terminal(&world, receipt.task_id).await;
    workers.shutdown().await;

    assert_eq!(status, TaskStatus::Failed);
    let task = world.store.get_task(receipt.task_id).await.unwrap();
    assert_eq!(task.details.stage.as_deref(), Some("code_analysis"));
    assert!(task.details.error.as_deref().unwrap().contains("overloaded"));
    assert_eq!(task.progress, 0.0);

    let job = world.queue.job_status(receipt.task_id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 3);

    // Explicit re-queue reopens the task.
    let again = world.service.requeue(receipt.task_id).await.unwrap();
    assert_eq!(again.task_id, receipt.task_id);
    let task = world.store.get_task(receipt.task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(world.queue.job_status(receipt.task_id).await.unwrap().state, JobState::Waiting);
}
