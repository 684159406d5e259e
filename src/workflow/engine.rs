//! 工作流引擎
//!
//! 持有所有运行实例，把命令与副作用结果送入状态机，并执行状态机返回的副作用。
//! 同一实例的转换在该实例的锁内串行执行；不同实例互不影响。

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::core::error::OrchestratorError;
use crate::core::state::WorkflowView;
use crate::events::{EventRecoveryManager, RecoveryDirective};
use crate::generation::GenerationAdapter;
use crate::quality::{ContentEvaluator, ThresholdProfile};
use crate::workflow::checkpoint::{CheckpointSnapshot, CheckpointStore};
use crate::workflow::machine::{
    transition, Effect, EffectSignal, MachineInput, TransitionContext, WorkflowCommand,
    WorkflowMachine,
};
use crate::workflow::types::{WorkflowConfig, WorkflowId, WorkflowInstance, WorkflowState};

type SignalFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// 引擎级设置（来自 `[workflow]` 与 `[quality]` 配置段）
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_retries: u32,
    /// START_WORKFLOW 未给出配置时使用
    pub defaults: WorkflowConfig,
    pub thresholds: ThresholdProfile,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            defaults: WorkflowConfig::default(),
            thresholds: ThresholdProfile::default(),
        }
    }
}

impl EngineSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            max_retries: cfg.workflow.max_retries,
            defaults: cfg.workflow.defaults.clone(),
            thresholds: cfg.quality.profile(),
        }
    }
}

/// 单个实例：状态机 + 投影通道
struct InstanceSlot {
    machine: Mutex<WorkflowMachine>,
    view: watch::Sender<WorkflowView>,
    autosave: CancellationToken,
}

impl InstanceSlot {
    fn new(machine: WorkflowMachine) -> Self {
        let (view, _) = watch::channel(WorkflowView::project(&machine));
        Self {
            machine: Mutex::new(machine),
            view,
            autosave: CancellationToken::new(),
        }
    }
}

/// 工作流引擎
pub struct WorkflowEngine {
    instances: RwLock<HashMap<WorkflowId, Arc<InstanceSlot>>>,
    adapter: GenerationAdapter,
    evaluator: Arc<dyn ContentEvaluator>,
    events: EventRecoveryManager,
    store: Arc<dyn CheckpointStore>,
    settings: EngineSettings,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl WorkflowEngine {
    pub fn new(
        adapter: GenerationAdapter,
        evaluator: Arc<dyn ContentEvaluator>,
        events: EventRecoveryManager,
        store: Arc<dyn CheckpointStore>,
        settings: EngineSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            instances: RwLock::new(HashMap::new()),
            adapter,
            evaluator,
            events,
            store,
            settings,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn events(&self) -> &EventRecoveryManager {
        &self.events
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// 生成后端累计 token 使用：(prompt, completion, total)
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.adapter.token_usage()
    }

    /// START_WORKFLOW：创建实例并启动；config 为 None 时使用默认配置
    pub async fn start_workflow(
        self: &Arc<Self>,
        document_id: impl Into<String>,
        config: Option<WorkflowConfig>,
    ) -> Result<WorkflowId, OrchestratorError> {
        let config = config.unwrap_or_else(|| self.settings.defaults.clone());
        if config.target_length == 0 {
            return Err(OrchestratorError::InvalidConfiguration(
                "target_length must be greater than zero".into(),
            ));
        }
        let autosave = config.autosave_interval_secs;
        let instance = WorkflowInstance::new(document_id, config, self.settings.max_retries);
        let workflow_id = instance.workflow_id.clone();
        let slot = self.insert(WorkflowMachine::new(instance)).await;

        info!(workflow_id = %workflow_id, "starting workflow");
        self.apply(&slot, MachineInput::Command(WorkflowCommand::StartWorkflow))
            .await?;
        if autosave > 0 {
            self.spawn_autosave(&workflow_id, &slot, Duration::from_secs(autosave));
        }
        Ok(workflow_id)
    }

    /// 向实例发送命令，返回转换后的投影
    pub async fn dispatch(
        self: &Arc<Self>,
        workflow_id: &str,
        command: WorkflowCommand,
    ) -> Result<WorkflowView, OrchestratorError> {
        let slot = self.slot(workflow_id).await?;
        debug!(workflow_id, command = command.name(), "dispatching command");
        self.apply(&slot, MachineInput::Command(command)).await
    }

    /// 用快照恢复（实例不存在时按快照中的 id 重建，并按快照配置启动自动保存）
    pub async fn restore_workflow(
        self: &Arc<Self>,
        snapshot: CheckpointSnapshot,
    ) -> Result<WorkflowView, OrchestratorError> {
        let workflow_id = snapshot.workflow_id.clone();
        let autosave = snapshot.config.autosave_interval_secs;
        let (slot, created) = match self.slot(&workflow_id).await {
            Ok(slot) => (slot, false),
            Err(_) => {
                let mut instance = WorkflowInstance::new(
                    snapshot.document_id.clone(),
                    snapshot.config.clone(),
                    self.settings.max_retries,
                );
                instance.workflow_id = workflow_id.clone();
                (self.insert(WorkflowMachine::new(instance)).await, true)
            }
        };
        info!(workflow_id = %workflow_id, step = ?snapshot.current_step, "restoring checkpoint");
        let command = WorkflowCommand::RestoreCheckpoint(Box::new(snapshot));
        let view = self.apply(&slot, MachineInput::Command(command)).await?;
        if created && autosave > 0 {
            self.spawn_autosave(&workflow_id, &slot, Duration::from_secs(autosave));
        }
        Ok(view)
    }

    /// 从检查点存储加载并恢复
    pub async fn load_and_restore(
        self: &Arc<Self>,
        workflow_id: &str,
    ) -> Result<WorkflowView, OrchestratorError> {
        let snapshot = self
            .store
            .load(workflow_id)
            .await
            .map_err(|e| OrchestratorError::Checkpoint(e.to_string()))?
            .ok_or_else(|| {
                OrchestratorError::Checkpoint(format!("no checkpoint stored for {workflow_id}"))
            })?;
        self.restore_workflow(snapshot).await
    }

    /// 执行恢复点上的选项
    pub async fn execute_recovery_option(
        self: &Arc<Self>,
        point_id: &str,
        option_id: &str,
    ) -> Result<WorkflowView, OrchestratorError> {
        let directive = self.events.resolve_recovery_option(point_id, option_id)?;
        info!(
            workflow_id = %directive.workflow_id,
            option = directive.option.as_str(),
            "executing recovery option"
        );
        self.dispatch(&directive.workflow_id, directive.command)
            .await
    }

    /// 消费恢复管理器发出的指令（自动重试等）
    pub fn spawn_directive_loop(
        self: &Arc<Self>,
        mut directives: mpsc::UnboundedReceiver<RecoveryDirective>,
    ) {
        let engine = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        self.tracker.spawn(async move {
            loop {
                let directive = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = directives.recv() => match next {
                        Some(d) => d,
                        None => break,
                    },
                };
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.handle_directive(directive).await;
            }
            debug!("directive loop stopped");
        });
    }

    /// 指令被接受后才移除恢复点；过期或被拒绝时恢复点留给操作员
    async fn handle_directive(self: &Arc<Self>, directive: RecoveryDirective) {
        let workflow_id = directive.workflow_id.clone();
        let outcome = match self.slot(&workflow_id).await {
            Ok(slot) => {
                self.apply_checked(&slot, MachineInput::Command(directive.command))
                    .await
            }
            Err(e) => Err(e),
        };
        match outcome {
            Ok((_, true)) => {
                self.events.discard_point(&directive.recovery_point_id);
            }
            Ok((view, false)) => debug!(
                workflow_id = %workflow_id,
                state = %view.state,
                option = directive.option.as_str(),
                "directive no longer matches the failure, recovery point kept"
            ),
            Err(e) => warn!(
                workflow_id = %workflow_id,
                option = directive.option.as_str(),
                automatic = directive.automatic,
                error = %e,
                "recovery directive rejected, recovery point kept"
            ),
        }
    }

    pub async fn view(&self, workflow_id: &str) -> Result<WorkflowView, OrchestratorError> {
        let slot = self.slot(workflow_id).await?;
        let view = slot.view.borrow().clone();
        Ok(view)
    }

    /// 订阅实例投影
    pub async fn watch(
        &self,
        workflow_id: &str,
    ) -> Result<watch::Receiver<WorkflowView>, OrchestratorError> {
        Ok(self.slot(workflow_id).await?.view.subscribe())
    }

    /// 完整状态的拷贝
    pub async fn machine(&self, workflow_id: &str) -> Result<WorkflowMachine, OrchestratorError> {
        let slot = self.slot(workflow_id).await?;
        let machine = slot.machine.lock().await.clone();
        Ok(machine)
    }

    pub async fn snapshot(&self, workflow_id: &str) -> Result<CheckpointSnapshot, OrchestratorError> {
        let slot = self.slot(workflow_id).await?;
        let snapshot = slot.machine.lock().await.snapshot(Utc::now());
        Ok(snapshot)
    }

    /// 移除已完成或已取消的实例，返回移除数量
    pub async fn archive_finished(&self) -> usize {
        let mut instances = self.instances.write().await;
        let before = instances.len();
        instances.retain(|id, slot| {
            let done = slot.view.borrow().is_terminal();
            if done {
                slot.autosave.cancel();
                self.events.clear_workflow(id);
            }
            !done
        });
        before - instances.len()
    }

    /// 为所有未终止的实例直接写检查点（关闭时调用）
    pub async fn checkpoint_all(&self) -> anyhow::Result<usize> {
        let slots: Vec<Arc<InstanceSlot>> = self.instances.read().await.values().cloned().collect();
        let mut saved = 0;
        for slot in slots {
            let snapshot = {
                let machine = slot.machine.lock().await;
                if machine.instance.cancelled || machine.state == WorkflowState::Idle {
                    continue;
                }
                machine.snapshot(Utc::now())
            };
            self.store.save(&snapshot).await?;
            saved += 1;
        }
        Ok(saved)
    }

    /// 停止后台任务并等待进行中的副作用结束
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for slot in self.instances.read().await.values() {
            slot.autosave.cancel();
        }
        self.tracker.close();
        self.tracker.wait().await;
        self.events.shutdown().await;
    }

    async fn slot(&self, workflow_id: &str) -> Result<Arc<InstanceSlot>, OrchestratorError> {
        self.instances
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::WorkflowNotFound(workflow_id.to_string()))
    }

    async fn insert(&self, machine: WorkflowMachine) -> Arc<InstanceSlot> {
        let id = machine.instance.workflow_id.clone();
        let slot = Arc::new(InstanceSlot::new(machine));
        self.instances.write().await.insert(id, slot.clone());
        slot
    }

    async fn apply(
        self: &Arc<Self>,
        slot: &Arc<InstanceSlot>,
        input: MachineInput,
    ) -> Result<WorkflowView, OrchestratorError> {
        self.apply_checked(slot, input).await.map(|(view, _)| view)
    }

    /// 在实例锁内完成一次转换：更新状态、发事件、发布投影、启动异步副作用。
    /// 第二个返回值为 false 表示输入已过期、状态未变
    async fn apply_checked(
        self: &Arc<Self>,
        slot: &Arc<InstanceSlot>,
        input: MachineInput,
    ) -> Result<(WorkflowView, bool), OrchestratorError> {
        let mut machine = slot.machine.lock().await;
        let ctx = TransitionContext {
            now: Utc::now(),
            thresholds: &self.settings.thresholds,
        };
        let outcome = transition(&machine, input, &ctx)?;
        if outcome.stale {
            debug!(
                workflow_id = %machine.instance.workflow_id,
                state = %machine.state.label(),
                "discarding stale input"
            );
            let view = slot.view.borrow().clone();
            return Ok((view, false));
        }

        *machine = outcome.machine;
        let workflow_id = machine.instance.workflow_id.clone();
        let mut pending = Vec::new();
        for effect in outcome.effects {
            match effect {
                Effect::Emit { event, snapshot } => self.events.emit(event, snapshot.as_deref()),
                other => pending.push(other),
            }
        }

        let view = WorkflowView::project(&machine);
        slot.view.send_replace(view.clone());
        drop(machine);

        for effect in pending {
            self.spawn_effect(&workflow_id, effect);
        }
        Ok((view, true))
    }

    fn spawn_effect(self: &Arc<Self>, workflow_id: &str, effect: Effect) {
        let engine = Arc::clone(self);
        let workflow_id = workflow_id.to_string();
        let shutdown = self.shutdown.clone();

        match effect {
            Effect::Emit { .. } => {}
            Effect::Generate {
                step,
                epoch,
                context,
            } => {
                self.tracker.spawn(async move {
                    let result = tokio::select! {
                        _ = shutdown.cancelled() => return,
                        result = engine.adapter.generate(step, &context) => result,
                    };
                    let signal = match result {
                        Ok(content) => EffectSignal::GenerationSucceeded { epoch, content },
                        Err(error) => {
                            warn!(
                                workflow_id = %workflow_id,
                                step = %step,
                                category = %error.category,
                                error = %error.message,
                                "generation failed"
                            );
                            EffectSignal::GenerationFailed { epoch, error }
                        }
                    };
                    engine.deliver(workflow_id, signal).await;
                });
            }
            Effect::EvaluateQuality {
                step,
                epoch,
                content,
                prior,
            } => {
                self.tracker.spawn(async move {
                    let metrics = engine.evaluator.evaluate(step, &content, &prior);
                    debug!(
                        workflow_id = %workflow_id,
                        step = %step,
                        score = metrics.overall_score,
                        "quality evaluated"
                    );
                    engine
                        .deliver(workflow_id, EffectSignal::QualityEvaluated { epoch, metrics })
                        .await;
                });
            }
            Effect::SaveCheckpoint {
                snapshot,
                epoch,
                fatal,
            } => {
                self.tracker.spawn(async move {
                    let signal = match engine.store.save(&snapshot).await {
                        Ok(()) => {
                            debug!(workflow_id = %workflow_id, state = %snapshot.state, "checkpoint saved");
                            EffectSignal::CheckpointSaved {
                                epoch,
                                at: snapshot.timestamp,
                                fatal,
                            }
                        }
                        Err(e) => {
                            if fatal {
                                tracing::error!(workflow_id = %workflow_id, error = %e, "checkpoint save failed");
                            } else {
                                warn!(workflow_id = %workflow_id, error = %e, "checkpoint save failed");
                            }
                            EffectSignal::CheckpointFailed {
                                epoch,
                                reason: e.to_string(),
                                fatal,
                            }
                        }
                    };
                    engine.deliver(workflow_id, signal).await;
                });
            }
        }
    }

    /// 把副作用结果送回状态机
    fn deliver(self: Arc<Self>, workflow_id: String, signal: EffectSignal) -> SignalFuture {
        Box::pin(async move {
            let slot = match self.slot(&workflow_id).await {
                Ok(slot) => slot,
                Err(_) => {
                    debug!(workflow_id = %workflow_id, "instance archived, dropping effect result");
                    return;
                }
            };
            if let Err(e) = self.apply(&slot, MachineInput::Signal(signal)).await {
                warn!(workflow_id = %workflow_id, error = %e, "effect result rejected");
            }
        })
    }

    fn spawn_autosave(self: &Arc<Self>, workflow_id: &str, slot: &Arc<InstanceSlot>, every: Duration) {
        let engine: Weak<Self> = Arc::downgrade(self);
        let token = slot.autosave.clone();
        let shutdown = self.shutdown.clone();
        let workflow_id = workflow_id.to_string();
        let mut view = slot.view.subscribe();

        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if view.borrow_and_update().is_terminal() {
                    break;
                }
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                if let Err(e) = engine.dispatch(&workflow_id, WorkflowCommand::SaveCheckpoint).await {
                    debug!(workflow_id = %workflow_id, error = %e, "autosave skipped");
                }
            }
            debug!(workflow_id = %workflow_id, "autosave stopped");
        });
    }
}
