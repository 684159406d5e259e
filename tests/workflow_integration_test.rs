//! 工作流集成测试

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use draftsmith::core::error::{ErrorCategory, OrchestratorError};
    use draftsmith::core::recovery::RecoveryPolicy;
    use draftsmith::core::WorkflowView;
    use draftsmith::events::{EventRecoveryManager, EventType, RecoveryConfig, WorkflowEvent};
    use draftsmith::generation::GenerationAdapter;
    use draftsmith::llm::{LlmClient, LlmError, Message, ScriptedLlmClient};
    use draftsmith::quality::{ContentEvaluator, QualityMetrics};
    use draftsmith::workflow::{
        CheckpointSnapshot, CheckpointStore, EngineSettings, InMemoryCheckpointStore,
        JsonFileCheckpointStore, Step, WorkflowCommand, WorkflowConfig, WorkflowData,
        WorkflowEngine,
    };

    /// 按步骤返回预设分数的评估器
    struct FixedEvaluator {
        scripted: Mutex<HashMap<Step, VecDeque<f64>>>,
        default: f64,
        calls: Mutex<Vec<Step>>,
    }

    impl FixedEvaluator {
        fn new(default: f64) -> Self {
            Self {
                scripted: Mutex::new(HashMap::new()),
                default,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn with(self, step: Step, scores: &[f64]) -> Self {
            self.scripted
                .lock()
                .unwrap()
                .insert(step, scores.iter().copied().collect());
            self
        }

        fn calls_for(&self, step: Step) -> usize {
            self.calls.lock().unwrap().iter().filter(|s| **s == step).count()
        }
    }

    impl ContentEvaluator for FixedEvaluator {
        fn evaluate(&self, step: Step, _content: &str, _prior: &WorkflowData) -> QualityMetrics {
            self.calls.lock().unwrap().push(step);
            let score = self
                .scripted
                .lock()
                .unwrap()
                .get_mut(&step)
                .and_then(VecDeque::pop_front)
                .unwrap_or(self.default);
            let mut metrics = QualityMetrics::with_score(score);
            if score < 0.6 {
                metrics.suggestions.push(format!("Improve the {step} output."));
            }
            metrics
        }
    }

    /// 带延迟的 LLM，用于在生成进行中发出命令
    struct SlowLlm {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for SlowLlm {
        async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok("Slow output.".to_string())
        }
    }

    /// 保存在满足条件时失败的检查点存储
    struct FailingStore {
        fail_on: fn(&CheckpointSnapshot) -> bool,
        inner: InMemoryCheckpointStore,
    }

    #[async_trait]
    impl CheckpointStore for FailingStore {
        async fn save(&self, snapshot: &CheckpointSnapshot) -> anyhow::Result<()> {
            if (self.fail_on)(snapshot) {
                anyhow::bail!("disk full");
            }
            self.inner.save(snapshot).await
        }

        async fn load(&self, workflow_id: &str) -> anyhow::Result<Option<CheckpointSnapshot>> {
            self.inner.load(workflow_id).await
        }
    }

    fn build(
        llm: Arc<dyn LlmClient>,
        evaluator: Arc<dyn ContentEvaluator>,
        store: Arc<dyn CheckpointStore>,
    ) -> Arc<WorkflowEngine> {
        build_with_backoff(llm, evaluator, store, Duration::from_millis(5))
    }

    /// 自动重试的退避固定为 backoff
    fn build_with_backoff(
        llm: Arc<dyn LlmClient>,
        evaluator: Arc<dyn ContentEvaluator>,
        store: Arc<dyn CheckpointStore>,
        backoff: Duration,
    ) -> Arc<WorkflowEngine> {
        let config = RecoveryConfig {
            policy: RecoveryPolicy::new(backoff, backoff.max(Duration::from_millis(20))),
            ..RecoveryConfig::default()
        };
        let (events, directives) = EventRecoveryManager::new(config);
        let engine = WorkflowEngine::new(
            GenerationAdapter::new(llm),
            evaluator,
            events,
            store,
            EngineSettings::default(),
        );
        engine.spawn_directive_loop(directives);
        engine
    }

    async fn wait_until(
        engine: &Arc<WorkflowEngine>,
        id: &str,
        pred: impl FnMut(&WorkflowView) -> bool,
    ) -> WorkflowView {
        let mut rx = engine.watch(id).await.unwrap();
        let view = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
            .await
            .expect("workflow did not reach the expected state")
            .unwrap()
            .clone();
        view
    }

    async fn wait_for_state(engine: &Arc<WorkflowEngine>, id: &str, state: &str) -> WorkflowView {
        wait_until(engine, id, |v| v.state == state).await
    }

    fn auto() -> WorkflowConfig {
        WorkflowConfig {
            auto_advance: true,
            ..Default::default()
        }
    }

    fn ok(text: &str) -> Result<String, LlmError> {
        Ok(text.to_string())
    }

    #[tokio::test]
    async fn test_planning_pass_then_next_step() {
        let llm = Arc::new(ScriptedLlmClient::always(ok("Some generated text.")));
        let evaluator = Arc::new(FixedEvaluator::new(0.9).with(Step::Planning, &[0.75]));
        let engine = build(llm, evaluator, Arc::new(InMemoryCheckpointStore::new()));

        let id = engine.start_workflow("doc-1", None).await.unwrap();
        let view = wait_for_state(&engine, &id, "planning.completed").await;
        assert_eq!(view.step_progress, 100);
        assert_eq!(view.last_score, Some(0.75));

        let view = engine.dispatch(&id, WorkflowCommand::NextStep).await.unwrap();
        assert_eq!(view.state, "drafting.processing");
        assert_eq!(view.current_step, Some(Step::Drafting));
        assert_eq!(view.overall_progress, 20);
        assert_eq!(view.step_progress, 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_quality_failure_override_via_recovery_point() {
        let llm = Arc::new(ScriptedLlmClient::always(ok("Generated text.")));
        let evaluator = Arc::new(FixedEvaluator::new(0.9).with(Step::Drafting, &[0.4]));
        let engine = build(llm, evaluator, Arc::new(InMemoryCheckpointStore::new()));

        let id = engine.start_workflow("doc-2", None).await.unwrap();
        wait_for_state(&engine, &id, "planning.completed").await;
        engine.dispatch(&id, WorkflowCommand::NextStep).await.unwrap();
        let view = wait_for_state(&engine, &id, "drafting.qualityFailed").await;
        assert_eq!(view.last_score, Some(0.4));

        let point = engine.events().latest_actionable_point(&id).unwrap();
        assert_eq!(point.step, Some(Step::Drafting));
        assert!(point.option("regenerate").unwrap().enabled);
        assert!(point.option("overrideQuality").unwrap().enabled);

        let view = engine
            .execute_recovery_option(&point.id, "overrideQuality")
            .await
            .unwrap();
        assert_eq!(view.state, "drafting.completed");
        assert!(view.user_override);

        let machine = engine.machine(&id).await.unwrap();
        let draft = &machine.data.step_results[&Step::Drafting];
        assert!(draft.overridden);
        assert_eq!(draft.quality_metrics.as_ref().unwrap().overall_score, 0.4);

        // 恢复点执行后即被移除
        assert_eq!(
            engine
                .execute_recovery_option(&point.id, "overrideQuality")
                .await
                .unwrap_err(),
            OrchestratorError::RecoveryPointNotFound(point.id.clone())
        );
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_network_failure_auto_retries_then_needs_manual_recovery() {
        let network = Err(LlmError::Network("connection reset".into()));
        let llm = Arc::new(ScriptedLlmClient::new(
            vec![ok("plan"), ok("draft"), ok("cited draft")],
            network,
        ));
        let evaluator = Arc::new(FixedEvaluator::new(0.95));
        let engine = build(llm.clone(), evaluator, Arc::new(InMemoryCheckpointStore::new()));

        let id = engine.start_workflow("doc-3", Some(auto())).await.unwrap();
        let view = wait_until(&engine, &id, |v| {
            v.state == "grammar.error" && v.retry_count == 3
        })
        .await;
        assert_eq!(
            view.last_error.as_deref(),
            Some("network error: connection reset")
        );
        assert_eq!(llm.calls(), 3 + 4);

        let errors = engine.events().error_history(Some(&id));
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().all(|e| e.category == ErrorCategory::NetworkError));
        assert!(errors.iter().all(|e| e.recoverable));
        assert_eq!(engine.events().pending_retries(), 0);

        let point = engine.events().latest_actionable_point(&id).unwrap();
        assert_eq!(point.step, Some(Step::Grammar));
        assert!(!point.option("retry").unwrap().enabled);
        assert!(!point.option("skip").unwrap().enabled);
        assert!(point.option("restartStep").unwrap().enabled);
        assert!(point.option("manual").unwrap().enabled);
        assert!(point.context_snapshot.is_some());

        let view = engine.execute_recovery_option(&point.id, "manual").await.unwrap();
        assert!(view.manual_mode);
        assert_eq!(view.state, "grammar.error");

        let view = engine
            .dispatch(
                &id,
                WorkflowCommand::CompleteStep {
                    content: Some("Hand-edited text.".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(view.state, "readability.processing");
        let machine = engine.machine(&id).await.unwrap();
        assert_eq!(
            machine.data.step_results[&Step::Grammar].content,
            "Hand-edited text."
        );
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_skipping_a_failed_step_cancels_its_pending_auto_retry() {
        let llm = Arc::new(ScriptedLlmClient::new(
            vec![
                ok("plan"),
                ok("draft"),
                Err(LlmError::Network("connection reset".into())),
            ],
            ok("polished text"),
        ));
        let evaluator = Arc::new(FixedEvaluator::new(0.95).with(Step::Grammar, &[0.3]));
        let engine = build_with_backoff(
            llm.clone(),
            evaluator.clone(),
            Arc::new(InMemoryCheckpointStore::new()),
            Duration::from_millis(150),
        );

        let id = engine.start_workflow("doc-3b", Some(auto())).await.unwrap();
        wait_for_state(&engine, &id, "citation.error").await;
        let view = engine.dispatch(&id, WorkflowCommand::SkipStep).await.unwrap();
        assert_eq!(view.state, "grammar.processing");

        let view = wait_for_state(&engine, &id, "grammar.qualityFailed").await;
        assert_eq!(view.retry_count, 0);

        // 等过 citation 的退避时间
        tokio::time::sleep(Duration::from_millis(400)).await;
        let view = engine.view(&id).await.unwrap();
        assert_eq!(view.state, "grammar.qualityFailed");
        assert_eq!(view.retry_count, 0);
        assert_eq!(evaluator.calls_for(Step::Grammar), 1);
        assert_eq!(llm.calls(), 4);
        assert_eq!(engine.events().pending_retries(), 0);

        let points = engine.events().recovery_points(&id);
        assert!(points
            .iter()
            .all(|p| p.step != Some(Step::Citation) || p.recovery_options.is_empty()));
        let point = engine.events().latest_actionable_point(&id).unwrap();
        assert_eq!(point.step, Some(Step::Grammar));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_auto_retry_due_while_paused_keeps_recovery_point() {
        let llm = Arc::new(ScriptedLlmClient::always(Err(LlmError::Network(
            "connection reset".into(),
        ))));
        let engine = build_with_backoff(
            llm.clone(),
            Arc::new(FixedEvaluator::new(0.9)),
            Arc::new(InMemoryCheckpointStore::new()),
            Duration::from_millis(100),
        );

        let id = engine.start_workflow("doc-3c", None).await.unwrap();
        wait_for_state(&engine, &id, "planning.error").await;
        engine
            .dispatch(&id, WorkflowCommand::PauseWorkflow)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(engine.events().pending_retries(), 0);

        let view = engine
            .dispatch(&id, WorkflowCommand::ResumeWorkflow)
            .await
            .unwrap();
        assert_eq!(view.state, "planning.error");
        assert_eq!(view.retry_count, 0);
        assert_eq!(llm.calls(), 1);

        let point = engine.events().latest_actionable_point(&id).unwrap();
        assert_eq!(point.step, Some(Step::Planning));
        assert!(point.option("retry").unwrap().enabled);

        let view = engine.execute_recovery_option(&point.id, "retry").await.unwrap();
        assert_eq!(view.state, "planning.processing");
        assert_eq!(view.retry_count, 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_bound_for_operator_retries() {
        let llm = Arc::new(ScriptedLlmClient::always(ok("thin plan")));
        let evaluator = Arc::new(FixedEvaluator::new(0.3));
        let engine = build(llm.clone(), evaluator, Arc::new(InMemoryCheckpointStore::new()));

        let id = engine.start_workflow("doc-4", None).await.unwrap();
        for attempt in 1..=3 {
            wait_until(&engine, &id, |v| {
                v.state == "planning.qualityFailed" && v.retry_count == attempt - 1
            })
            .await;
            let view = engine
                .dispatch(&id, WorkflowCommand::RetryStep { guard: None })
                .await
                .unwrap();
            assert_eq!(view.retry_count, attempt);
        }
        wait_until(&engine, &id, |v| {
            v.state == "planning.qualityFailed" && v.retry_count == 3
        })
        .await;

        let err = engine
            .dispatch(&id, WorkflowCommand::RetryStep { guard: None })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            OrchestratorError::RetryLimitReached {
                step: Step::Planning,
                max_retries: 3
            }
        );
        assert_eq!(llm.calls(), 4);

        // 恢复点上的 regenerate 也随之不可用
        let point = engine.events().latest_actionable_point(&id).unwrap();
        assert!(!point.option("regenerate").unwrap().enabled);
        assert_eq!(
            engine
                .execute_recovery_option(&point.id, "regenerate")
                .await
                .unwrap_err(),
            OrchestratorError::RecoveryOptionUnavailable("regenerate".into())
        );
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_citation_bypass_skips_generation_and_evaluation() {
        let llm = Arc::new(ScriptedLlmClient::always(ok("Generated text.")));
        let evaluator = Arc::new(FixedEvaluator::new(0.95));
        let engine = build(
            llm.clone(),
            evaluator.clone(),
            Arc::new(InMemoryCheckpointStore::new()),
        );

        let config = WorkflowConfig {
            include_citations: false,
            ..auto()
        };
        let id = engine.start_workflow("doc-5", Some(config)).await.unwrap();
        let view = wait_for_state(&engine, &id, "workflowCompleted").await;
        assert_eq!(view.overall_progress, 100);

        assert_eq!(llm.calls(), 4);
        assert_eq!(evaluator.calls_for(Step::Citation), 0);
        let machine = engine.machine(&id).await.unwrap();
        assert!(machine.data.step_results[&Step::Citation].skipped);
        assert!(!machine.data.step_data.contains_key(&Step::Citation));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_run_events_and_progress() {
        let llm = Arc::new(ScriptedLlmClient::always(ok("Generated text.")));
        let engine = build(
            llm,
            Arc::new(FixedEvaluator::new(0.99)),
            Arc::new(InMemoryCheckpointStore::new()),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine.events().subscribe(
            None,
            move |event: &WorkflowEvent| sink.lock().unwrap().push(event.clone()),
            false,
        );

        let id = engine.start_workflow("doc-6", None).await.unwrap();
        let mut rx = engine.watch(&id).await.unwrap();
        let mut last_progress = 0;
        loop {
            let view = tokio::time::timeout(
                Duration::from_secs(5),
                rx.wait_for(|v| v.is_settled()),
            )
            .await
            .unwrap()
            .unwrap()
            .clone();
            assert!(view.overall_progress >= last_progress);
            last_progress = view.overall_progress;
            if view.is_terminal() {
                break;
            }
            engine
                .dispatch(&id, WorkflowCommand::CompleteStep { content: None })
                .await
                .unwrap();
        }
        assert_eq!(last_progress, 100);

        let events = seen.lock().unwrap().clone();
        let types: Vec<EventType> = events.iter().map(WorkflowEvent::event_type).collect();
        assert_eq!(types.first(), Some(&EventType::StateChange));
        assert!(types.contains(&EventType::WorkflowStarted));
        assert_eq!(types.last(), Some(&EventType::WorkflowCompleted));
        let completed_steps = events
            .iter()
            .filter(|e| e.event_type() == EventType::StepCompleted)
            .count();
        assert_eq!(completed_steps, 5);
        assert_eq!(
            types
                .iter()
                .filter(|t| **t == EventType::AiGeneration)
                .count(),
            5
        );

        // 工作流完成后清理其恢复点
        assert!(engine.events().recovery_points(&id).is_empty());
        assert!(engine
            .dispatch(&id, WorkflowCommand::NextStep)
            .await
            .is_err());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_init_checkpoint_failure_is_fatal() {
        let llm = Arc::new(ScriptedLlmClient::always(ok("text")));
        let store = Arc::new(FailingStore {
            fail_on: |_| true,
            inner: InMemoryCheckpointStore::new(),
        });
        let engine = build(llm.clone(), Arc::new(FixedEvaluator::new(0.9)), store);

        let id = engine.start_workflow("doc-7", None).await.unwrap();
        let view = wait_until(&engine, &id, |v| v.failed).await;
        assert_eq!(view.state, "error");
        assert!(view.last_error.unwrap().contains("disk full"));
        assert_eq!(llm.calls(), 0);

        let errors = engine.events().error_history(Some(&id));
        assert_eq!(errors.len(), 1);
        assert!(!errors[0].recoverable);
        assert!(engine.events().recovery_points(&id).is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_completion_checkpoint_failure_is_logged_only() {
        let llm = Arc::new(ScriptedLlmClient::always(ok("text")));
        let store = Arc::new(FailingStore {
            fail_on: |s| s.state == "workflowCompleted",
            inner: InMemoryCheckpointStore::new(),
        });
        let engine = build(llm, Arc::new(FixedEvaluator::new(0.99)), store.clone());

        let id = engine.start_workflow("doc-8", Some(auto())).await.unwrap();
        wait_for_state(&engine, &id, "workflowCompleted").await;
        // 给完成检查点的保存结果留出时间
        tokio::time::sleep(Duration::from_millis(50)).await;

        let view = engine.view(&id).await.unwrap();
        assert_eq!(view.state, "workflowCompleted");
        assert!(!view.failed);
        let saved = store.load(&id).await.unwrap().unwrap();
        assert_eq!(saved.state, "initializing");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_pause_discards_in_flight_result_and_resume_reruns() {
        let llm = Arc::new(SlowLlm {
            delay: Duration::from_millis(50),
            calls: AtomicUsize::new(0),
        });
        let engine = build(
            llm.clone(),
            Arc::new(FixedEvaluator::new(0.9)),
            Arc::new(InMemoryCheckpointStore::new()),
        );

        let id = engine.start_workflow("doc-9", None).await.unwrap();
        wait_for_state(&engine, &id, "planning.processing").await;
        let view = engine
            .dispatch(&id, WorkflowCommand::PauseWorkflow)
            .await
            .unwrap();
        assert!(view.paused);

        tokio::time::sleep(Duration::from_millis(120)).await;
        let view = engine.view(&id).await.unwrap();
        assert_eq!(view.state, "paused");
        let machine = engine.machine(&id).await.unwrap();
        assert!(machine.data.step_data.is_empty());

        let view = engine
            .dispatch(&id, WorkflowCommand::ResumeWorkflow)
            .await
            .unwrap();
        assert_eq!(view.state, "planning.processing");
        wait_for_state(&engine, &id, "planning.completed").await;
        assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_discards_in_flight_result() {
        let llm = Arc::new(SlowLlm {
            delay: Duration::from_millis(30),
            calls: AtomicUsize::new(0),
        });
        let engine = build(
            llm,
            Arc::new(FixedEvaluator::new(0.9)),
            Arc::new(InMemoryCheckpointStore::new()),
        );

        let id = engine.start_workflow("doc-10", None).await.unwrap();
        wait_for_state(&engine, &id, "planning.processing").await;
        let view = engine
            .dispatch(&id, WorkflowCommand::CancelWorkflow)
            .await
            .unwrap();
        assert_eq!(view.state, "idle");
        assert!(view.cancelled);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let machine = engine.machine(&id).await.unwrap();
        assert!(machine.data.step_data.is_empty());
        assert!(engine
            .dispatch(&id, WorkflowCommand::ResumeWorkflow)
            .await
            .is_err());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_restore_into_fresh_engine() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileCheckpointStore::new(dir.path()));
        let llm = Arc::new(ScriptedLlmClient::always(ok("Generated text.")));
        let engine = build(llm.clone(), Arc::new(FixedEvaluator::new(0.9)), store.clone());

        let id = engine.start_workflow("doc-11", None).await.unwrap();
        wait_for_state(&engine, &id, "planning.completed").await;
        engine.dispatch(&id, WorkflowCommand::NextStep).await.unwrap();
        wait_for_state(&engine, &id, "drafting.completed").await;
        let snapshot = engine.snapshot(&id).await.unwrap();
        engine.shutdown().await;

        // 内存快照：回到 drafting.completed，继续前进
        let other = build(llm.clone(), Arc::new(FixedEvaluator::new(0.9)), store.clone());
        let view = other.restore_workflow(snapshot).await.unwrap();
        assert_eq!(view.state, "drafting.completed");
        assert_eq!(view.workflow_id, id);
        let view = other.dispatch(&id, WorkflowCommand::NextStep).await.unwrap();
        assert_eq!(view.state, "citation.processing");
        assert_eq!(view.overall_progress, 40);
        other.shutdown().await;

        // 磁盘上只有初始化检查点：从规划重新开始
        let third = build(llm, Arc::new(FixedEvaluator::new(0.9)), store);
        let view = third.load_and_restore(&id).await.unwrap();
        assert_eq!(view.state, "planning.processing");
        assert!(matches!(
            third.load_and_restore("wf_unknown").await,
            Err(OrchestratorError::Checkpoint(_))
        ));
        third.shutdown().await;
    }

    #[tokio::test]
    async fn test_independent_instances_run_concurrently() {
        let llm = Arc::new(ScriptedLlmClient::always(ok("Generated text.")));
        let engine = build(
            llm.clone(),
            Arc::new(FixedEvaluator::new(0.99)),
            Arc::new(InMemoryCheckpointStore::new()),
        );

        let a = engine.start_workflow("doc-a", Some(auto())).await.unwrap();
        let b = engine.start_workflow("doc-b", Some(auto())).await.unwrap();
        assert_ne!(a, b);
        wait_for_state(&engine, &a, "workflowCompleted").await;
        wait_for_state(&engine, &b, "workflowCompleted").await;
        assert_eq!(llm.calls(), 10);

        assert_eq!(engine.archive_finished().await, 2);
        engine.shutdown().await;
    }
}
