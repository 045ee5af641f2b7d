//! Command implementations
//!
//! Each command bootstraps the service from the environment, performs
//! one operation, and prints JSON so the output can be piped.

use super::{CleanArgs, ListArgs, ProvidersArgs, RunArgs, StatusArgs, SubmitArgs};
use anyhow::{bail, Context, Result};
use reqforge_core::llm::ProviderRegistry;
use reqforge_core::service::SubmitRequest;
use reqforge_core::store::{TargetLanguage, TaskFilter, TaskPriority, TaskStatus};
use reqforge_core::{PipelineConfig, RequirementService};
use std::time::Duration;
use tracing::info;

async fn bootstrap(concurrency: Option<usize>) -> Result<RequirementService> {
    let mut config = PipelineConfig::from_env();
    if let Some(concurrency) = concurrency {
        config.max_concurrent_tasks = concurrency;
    }
    RequirementService::bootstrap(&config).await
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn run(args: RunArgs) -> Result<()> {
    let service = bootstrap(args.concurrency).await?;
    let workers = service.start_workers().context("failed to start workers")?;

    info!("workers running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutting down");
    workers.shutdown().await;
    Ok(())
}

pub async fn submit(args: SubmitArgs) -> Result<()> {
    let requirement = match args.requirement.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("could not read requirement file {path}"))?,
        None => args.requirement.clone(),
    };
    let Some(language) = TargetLanguage::parse(&args.language) else {
        let supported: Vec<&str> = TargetLanguage::ALL.iter().map(|l| l.as_str()).collect();
        bail!("unsupported language '{}' (expected one of: {})", args.language, supported.join(", "));
    };

    let service = bootstrap(None).await?;
    let receipt = service
        .submit(SubmitRequest {
            project_id: args.project,
            repository_url: args.repository,
            branch: args.branch,
            requirement_text: requirement,
            priority: Some(TaskPriority::normalize(&args.priority)),
            additional_context: args.context,
            language: Some(language),
            output_path: args.output_path,
            template_id: args.template,
            multi_model: args.multi_model,
        })
        .await?;
    print_json(&receipt)
}

pub async fn status(args: StatusArgs) -> Result<()> {
    let service = bootstrap(None).await?;
    let view = service.task_status(args.task_id).await?;
    print_json(&view)
}

pub async fn list(args: ListArgs) -> Result<()> {
    let status = match args.status.as_deref() {
        Some(raw) => match TaskStatus::parse(raw) {
            Some(status) => Some(status),
            None => bail!("unknown status '{raw}'"),
        },
        None => None,
    };
    let service = bootstrap(None).await?;
    let views = service
        .list_tasks(&TaskFilter { project_id: args.project, status })
        .await?;
    print_json(&views)
}

pub async fn stats() -> Result<()> {
    let service = bootstrap(None).await?;
    let stats = service.queue_stats().await?;
    print_json(&stats)
}

pub async fn clean(args: CleanArgs) -> Result<()> {
    let service = bootstrap(None).await?;
    let removed = service.clean_queue(Duration::from_secs(args.grace)).await?;
    print_json(&serde_json::json!({ "success": true, "removed": removed }))
}

pub async fn requeue(args: StatusArgs) -> Result<()> {
    let service = bootstrap(None).await?;
    let receipt = service.requeue(args.task_id).await?;
    print_json(&receipt)
}

pub async fn providers(args: ProvidersArgs) -> Result<()> {
    let config = PipelineConfig::from_env();
    let registry = ProviderRegistry::new(config.registry.clone());

    let mut rows = Vec::new();
    for provider in registry.list_available() {
        let alive = if args.probe {
            Some(registry.probe(&provider.id).await)
        } else {
            None
        };
        rows.push(serde_json::json!({
            "id": provider.id,
            "protocol": provider.protocol.as_str(),
            "model": provider.default_model,
            "alive": alive,
        }));
    }
    print_json(&rows)
}
