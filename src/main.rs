//! Draftsmith - 内容生产工作流 runner
//!
//! 用法：`draftsmith <document-id> [brief...]`
//! 入口：加载配置、初始化日志、构建引擎，自动推进工作流并打印最终内容。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use draftsmith::config::load_config;
use draftsmith::core::shutdown::{
    run_with_graceful_shutdown, CheckpointFlushCleanup, EngineDrainCleanup, ShutdownCoordinator,
    ShutdownManager,
};
use draftsmith::core::WorkflowView;
use draftsmith::events::EventRecoveryManager;
use draftsmith::generation::GenerationAdapter;
use draftsmith::llm::create_llm_from_config;
use draftsmith::observability;
use draftsmith::quality::QualityEvaluator;
use draftsmith::workflow::{
    EngineSettings, JsonFileCheckpointStore, StepPhase, WorkflowCommand, WorkflowConfig,
    WorkflowEngine,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let mut args = std::env::args().skip(1);
    let document_id = args.next().unwrap_or_else(|| "untitled".to_string());
    let brief: Vec<String> = args.collect();

    let config_path = std::env::var("DRAFTSMITH_CONFIG").ok().map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let llm = create_llm_from_config(&cfg.llm);
    let recovery = cfg.recovery.to_recovery_config();
    let settle_wait = recovery.policy.max_delay + Duration::from_millis(500);
    let (events, directives) = EventRecoveryManager::new(recovery);
    let engine = WorkflowEngine::new(
        GenerationAdapter::new(llm),
        Arc::new(QualityEvaluator::new()),
        events,
        Arc::new(JsonFileCheckpointStore::new(&cfg.app.checkpoint_dir)),
        EngineSettings::from_config(&cfg),
    );
    engine.spawn_directive_loop(directives);

    let mut run_config = cfg.workflow.defaults.clone();
    run_config.auto_advance = true;
    if !brief.is_empty() {
        run_config.topic = Some(brief.join(" "));
    }

    let shutdown = Arc::new(ShutdownManager::new());
    let mut coordinator = ShutdownCoordinator::new(shutdown.clone());
    coordinator.register(CheckpointFlushCleanup::new(engine.clone()));
    coordinator.register(EngineDrainCleanup::new(engine.clone()));

    let app = run(engine.clone(), document_id, run_config, settle_wait);
    let result = run_with_graceful_shutdown(shutdown, app, || coordinator.run_cleanup()).await;

    let (prompt_tokens, completion_tokens, total_tokens) = engine.token_usage();
    tracing::info!(prompt_tokens, completion_tokens, total_tokens, "token usage");
    if let Err(e) = &result {
        tracing::error!(error = %e, "workflow run failed");
    }
    result
}

/// 自动推进：质量未通过时在重试额度内重试，用尽后强制接受；出错时等待自动重试，引用步骤可跳过
async fn run(
    engine: Arc<WorkflowEngine>,
    document_id: String,
    config: WorkflowConfig,
    settle_wait: Duration,
) -> anyhow::Result<()> {
    let id = engine.start_workflow(document_id, Some(config)).await?;
    let mut rx = engine.watch(&id).await?;

    loop {
        let view = rx.wait_for(WorkflowView::is_settled).await?.clone();
        print_progress(&view);

        if view.is_terminal() {
            break;
        }
        if view.failed {
            anyhow::bail!(
                "workflow {} failed: {}",
                id,
                view.last_error.unwrap_or_default()
            );
        }

        match view.phase {
            Some(StepPhase::QualityFailed) if view.retry_count < view.max_retries => {
                engine
                    .dispatch(&id, WorkflowCommand::RetryStep { guard: None })
                    .await?;
            }
            Some(StepPhase::QualityFailed) => {
                tracing::warn!(workflow_id = %id, state = %view.state, "retries exhausted, accepting output");
                engine.dispatch(&id, WorkflowCommand::OverrideQuality).await?;
            }
            Some(StepPhase::Error) => {
                // 给自动重试留出退避时间
                if matches!(tokio::time::timeout(settle_wait, rx.changed()).await, Ok(Ok(()))) {
                    continue;
                }
                let skip = engine
                    .events()
                    .latest_actionable_point(&id)
                    .filter(|p| p.option("skip").is_some_and(|o| o.enabled));
                match skip {
                    Some(point) => {
                        engine.execute_recovery_option(&point.id, "skip").await?;
                    }
                    None => anyhow::bail!(
                        "{} failed: {}",
                        view.state,
                        view.last_error.unwrap_or_default()
                    ),
                }
            }
            _ => {
                engine.dispatch(&id, WorkflowCommand::NextStep).await?;
            }
        }
    }

    let machine = engine.machine(&id).await?;
    match machine.data.accepted_content().into_values().last() {
        Some(content) => println!("\n{content}"),
        None => println!("\n(no content produced)"),
    }
    Ok(())
}

fn print_progress(view: &WorkflowView) {
    let score = view
        .last_score
        .map(|s| format!(" score={s:.2}"))
        .unwrap_or_default();
    eprintln!(
        "[{:>3}%] {}{} (retries {}/{})",
        view.overall_progress, view.state, score, view.retry_count, view.max_retries
    );
}
