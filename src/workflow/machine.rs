//! 工作流状态机
//!
//! `transition(machine, input, ctx)` 是唯一入口：纯函数，返回新状态与待执行的副作用列表
//! （发事件、调用生成、质量评估、保存检查点）。副作用由 `WorkflowEngine` 执行，
//! 执行结果以 `EffectSignal` 的形式再次送回状态机。
//!
//! 每个生成/评估副作用都携带实例当前的 epoch；暂停、取消、恢复检查点、重启步骤会递增 epoch，
//! 之后到达的旧结果被丢弃。

use chrono::{DateTime, Utc};

use crate::core::error::{GenerationError, OrchestratorError};
use crate::events::types::{ErrorReport, WorkflowEvent};
use crate::generation::GenerationContext;
use crate::quality::{QualityMetrics, ThresholdProfile};
use crate::workflow::checkpoint::CheckpointSnapshot;
use crate::workflow::types::{
    Step, StepPhase, StepResult, WorkflowData, WorkflowInstance, WorkflowState,
};

/// 操作员/恢复管理器发出的命令
#[derive(Debug, Clone)]
pub enum WorkflowCommand {
    StartWorkflow,
    NextStep,
    PreviousStep,
    GotoStep(Step),
    /// 无内容时等同 NextStep；带内容时把人工内容作为步骤结果
    CompleteStep { content: Option<String> },
    SkipStep,
    /// 自动重试带 guard：只对发起重试时的那次失败生效
    RetryStep { guard: Option<RetryGuard> },
    /// 以 retry_count = 0 重新进入当前步骤
    RestartStep,
    EnterManualMode,
    PauseWorkflow,
    ResumeWorkflow,
    CancelWorkflow,
    OverrideQuality,
    SaveCheckpoint,
    RestoreCheckpoint(Box<CheckpointSnapshot>),
}

impl WorkflowCommand {
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowCommand::StartWorkflow => "START_WORKFLOW",
            WorkflowCommand::NextStep => "NEXT_STEP",
            WorkflowCommand::PreviousStep => "PREVIOUS_STEP",
            WorkflowCommand::GotoStep(_) => "GOTO_STEP",
            WorkflowCommand::CompleteStep { .. } => "COMPLETE_STEP",
            WorkflowCommand::SkipStep => "SKIP_STEP",
            WorkflowCommand::RetryStep { .. } => "RETRY_STEP",
            WorkflowCommand::RestartStep => "RESTART_STEP",
            WorkflowCommand::EnterManualMode => "ENTER_MANUAL_MODE",
            WorkflowCommand::PauseWorkflow => "PAUSE_WORKFLOW",
            WorkflowCommand::ResumeWorkflow => "RESUME_WORKFLOW",
            WorkflowCommand::CancelWorkflow => "CANCEL_WORKFLOW",
            WorkflowCommand::OverrideQuality => "OVERRIDE_QUALITY",
            WorkflowCommand::SaveCheckpoint => "SAVE_CHECKPOINT",
            WorkflowCommand::RestoreCheckpoint(_) => "RESTORE_CHECKPOINT",
        }
    }
}

/// 自动重试发出时记录的失败位置：步骤、epoch 与当时的重试次数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryGuard {
    pub step: Step,
    pub epoch: u64,
    pub retry_count: u32,
}

impl RetryGuard {
    /// 实例仍停在同一次失败上
    pub fn matches(&self, machine: &WorkflowMachine) -> bool {
        let instance = &machine.instance;
        !instance.cancelled
            && machine.state
                == WorkflowState::Active {
                    step: self.step,
                    phase: StepPhase::Error,
                }
            && instance.epoch == self.epoch
            && instance.retry_count == self.retry_count
    }
}

/// 副作用执行结果
#[derive(Debug, Clone)]
pub enum EffectSignal {
    GenerationSucceeded {
        epoch: u64,
        content: String,
    },
    GenerationFailed {
        epoch: u64,
        error: GenerationError,
    },
    QualityEvaluated {
        epoch: u64,
        metrics: QualityMetrics,
    },
    CheckpointSaved {
        epoch: u64,
        at: DateTime<Utc>,
        fatal: bool,
    },
    CheckpointFailed {
        epoch: u64,
        reason: String,
        fatal: bool,
    },
}

#[derive(Debug, Clone)]
pub enum MachineInput {
    Command(WorkflowCommand),
    Signal(EffectSignal),
}

/// 状态机输出的副作用
#[derive(Debug, Clone)]
pub enum Effect {
    /// 发给事件与恢复管理器；snapshot 用于恢复点
    Emit {
        event: WorkflowEvent,
        snapshot: Option<Box<CheckpointSnapshot>>,
    },
    Generate {
        step: Step,
        epoch: u64,
        context: GenerationContext,
    },
    EvaluateQuality {
        step: Step,
        epoch: u64,
        content: String,
        prior: WorkflowData,
    },
    /// fatal 为 true 时保存失败会使工作流进入全局 error 状态
    SaveCheckpoint {
        snapshot: Box<CheckpointSnapshot>,
        epoch: u64,
        fatal: bool,
    },
}

/// 转换所需的外部输入
pub struct TransitionContext<'a> {
    pub now: DateTime<Utc>,
    pub thresholds: &'a ThresholdProfile,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub machine: WorkflowMachine,
    pub effects: Vec<Effect>,
    /// 过期信号被丢弃（状态未变化）
    pub stale: bool,
}

/// 单个工作流的完整状态
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowMachine {
    pub state: WorkflowState,
    pub instance: WorkflowInstance,
    pub data: WorkflowData,
    pub last_error: Option<String>,
}

impl WorkflowMachine {
    pub fn new(instance: WorkflowInstance) -> Self {
        Self {
            state: WorkflowState::Idle,
            instance,
            data: WorkflowData::default(),
            last_error: None,
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> CheckpointSnapshot {
        CheckpointSnapshot::capture(&self.instance, &self.data, self.state.label(), now)
    }

    /// 纳入进度计算的已完成步骤数
    fn completed_steps(&self) -> usize {
        let include_citations = self.instance.config.include_citations;
        self.data
            .step_results
            .keys()
            .filter(|s| include_citations || **s != Step::Citation)
            .count()
    }

    fn is_finished(&self) -> bool {
        matches!(self.state, WorkflowState::Completed)
    }
}

/// 状态机唯一入口
pub fn transition(
    machine: &WorkflowMachine,
    input: MachineInput,
    ctx: &TransitionContext<'_>,
) -> Result<Transition, OrchestratorError> {
    if let MachineInput::Command(WorkflowCommand::RetryStep { guard: Some(guard) }) = &input {
        if !guard.matches(machine) {
            return Ok(Transition {
                machine: machine.clone(),
                effects: Vec::new(),
                stale: true,
            });
        }
    }

    let mut b = Builder {
        m: machine.clone(),
        effects: Vec::new(),
        ctx,
    };
    let applied = match input {
        MachineInput::Command(command) => {
            b.apply_command(command)?;
            true
        }
        MachineInput::Signal(signal) => b.apply_signal(signal),
    };
    Ok(Transition {
        machine: b.m,
        effects: b.effects,
        stale: !applied,
    })
}

struct Builder<'a, 'c> {
    m: WorkflowMachine,
    effects: Vec<Effect>,
    ctx: &'a TransitionContext<'c>,
}

impl Builder<'_, '_> {
    fn invalid(&self, command: &WorkflowCommand) -> OrchestratorError {
        OrchestratorError::InvalidTransition {
            state: self.m.state.label(),
            command: command.name().to_string(),
        }
    }

    fn workflow_id(&self) -> String {
        self.m.instance.workflow_id.clone()
    }

    fn set_state(&mut self, to: WorkflowState) {
        let from = self.m.state.label();
        self.m.state = to;
        let to = self.m.state.label();
        if from != to {
            self.emit(WorkflowEvent::StateChange {
                workflow_id: self.workflow_id(),
                from,
                to,
            });
        }
    }

    fn emit(&mut self, event: WorkflowEvent) {
        self.effects.push(Effect::Emit {
            event,
            snapshot: None,
        });
    }

    fn emit_with_snapshot(&mut self, event: WorkflowEvent) {
        let snapshot = Box::new(self.m.snapshot(self.ctx.now));
        self.effects.push(Effect::Emit {
            event,
            snapshot: Some(snapshot),
        });
    }

    fn save_checkpoint(&mut self, fatal: bool) {
        let snapshot = Box::new(self.m.snapshot(self.ctx.now));
        self.effects.push(Effect::SaveCheckpoint {
            snapshot,
            epoch: self.m.instance.epoch,
            fatal,
        });
    }

    fn bump_epoch(&mut self) {
        self.m.instance.epoch += 1;
    }

    /// 当前处于某步骤的某些子状态时返回该步骤
    fn active_step(&self, phases: &[StepPhase]) -> Option<(Step, StepPhase)> {
        match self.m.state {
            WorkflowState::Active { step, phase } if phases.contains(&phase) => Some((step, phase)),
            _ => None,
        }
    }

    fn apply_command(&mut self, command: WorkflowCommand) -> Result<(), OrchestratorError> {
        if self.m.instance.cancelled {
            return Err(self.invalid(&command));
        }

        const SETTLED_FAILURE: &[StepPhase] = &[StepPhase::QualityFailed, StepPhase::Error];

        match command {
            WorkflowCommand::StartWorkflow => {
                if self.m.state != WorkflowState::Idle {
                    return Err(self.invalid(&command));
                }
                self.set_state(WorkflowState::Initializing);
                self.emit(WorkflowEvent::WorkflowStarted {
                    workflow_id: self.workflow_id(),
                    document_id: self.m.instance.document_id.clone(),
                });
                self.save_checkpoint(true);
            }

            WorkflowCommand::NextStep | WorkflowCommand::CompleteStep { content: None } => {
                if self.active_step(&[StepPhase::Completed]).is_none() {
                    return Err(self.invalid(&command));
                }
                self.advance();
            }

            WorkflowCommand::CompleteStep {
                content: Some(ref content),
            } => {
                let Some((step, _)) = self.active_step(SETTLED_FAILURE) else {
                    return Err(self.invalid(&command));
                };
                self.m.data.step_data.insert(step, content.clone());
                self.m.instance.manual_mode = true;
                self.m.last_error = None;
                let result = StepResult {
                    content: content.clone(),
                    quality_metrics: None,
                    completed_at: self.ctx.now,
                    overridden: false,
                    skipped: false,
                };
                self.complete_step(step, result, true);
                self.advance();
            }

            WorkflowCommand::PreviousStep => {
                let target = self
                    .active_step(&[StepPhase::Completed])
                    .and_then(|(step, _)| step.previous())
                    .filter(|p| self.m.data.step_results.contains_key(p));
                match target {
                    Some(prev) => self.revisit(prev),
                    None => return Err(self.invalid(&command)),
                }
            }

            WorkflowCommand::GotoStep(target) => {
                if self.active_step(&[StepPhase::Completed]).is_none()
                    || !self.m.data.step_results.contains_key(&target)
                {
                    return Err(self.invalid(&command));
                }
                self.revisit(target);
            }

            WorkflowCommand::SkipStep => {
                let Some((step, _)) = self.active_step(SETTLED_FAILURE) else {
                    return Err(self.invalid(&command));
                };
                if !step.is_skippable() {
                    return Err(OrchestratorError::NotSkippable(step));
                }
                self.m.last_error = None;
                self.complete_step(step, skipped_result(self.ctx.now), false);
                self.advance();
            }

            WorkflowCommand::RetryStep { .. } => {
                let Some((step, phase)) = self.active_step(SETTLED_FAILURE) else {
                    return Err(self.invalid(&command));
                };
                if self.m.instance.retry_count >= self.m.instance.max_retries {
                    return Err(OrchestratorError::RetryLimitReached {
                        step,
                        max_retries: self.m.instance.max_retries,
                    });
                }
                self.m.instance.retry_count += 1;
                let hints = if phase == StepPhase::QualityFailed {
                    self.m
                        .data
                        .quality_metrics
                        .get(&step)
                        .map(|m| m.suggestions.clone())
                        .unwrap_or_default()
                } else {
                    Vec::new()
                };
                self.m.last_error = None;
                self.m.instance.step_progress = 0;
                self.set_state(WorkflowState::Active {
                    step,
                    phase: StepPhase::Processing,
                });
                self.start_generation(step, hints);
            }

            WorkflowCommand::RestartStep => {
                let Some((step, _)) = self.active_step(SETTLED_FAILURE) else {
                    return Err(self.invalid(&command));
                };
                self.bump_epoch();
                self.m.last_error = None;
                self.enter_step(step);
            }

            WorkflowCommand::EnterManualMode => {
                if self.active_step(SETTLED_FAILURE).is_none() {
                    return Err(self.invalid(&command));
                }
                self.m.instance.manual_mode = true;
            }

            WorkflowCommand::OverrideQuality => {
                let Some((step, _)) = self.active_step(&[StepPhase::QualityFailed]) else {
                    return Err(self.invalid(&command));
                };
                let result = StepResult {
                    content: self
                        .m
                        .data
                        .step_data
                        .get(&step)
                        .cloned()
                        .unwrap_or_default(),
                    quality_metrics: self.m.data.quality_metrics.get(&step).cloned(),
                    completed_at: self.ctx.now,
                    overridden: true,
                    skipped: false,
                };
                self.m.instance.user_override = true;
                self.complete_step(step, result, false);
                if self.m.instance.config.auto_advance {
                    self.advance();
                }
            }

            WorkflowCommand::PauseWorkflow => {
                if !self.m.state.is_active() {
                    return Err(self.invalid(&command));
                }
                self.bump_epoch();
                let from = Box::new(self.m.state.clone());
                self.set_state(WorkflowState::Paused { from });
            }

            WorkflowCommand::ResumeWorkflow => {
                let WorkflowState::Paused { ref from } = self.m.state else {
                    return Err(self.invalid(&command));
                };
                let from = (**from).clone();
                self.resume(from);
            }

            WorkflowCommand::CancelWorkflow => {
                if self.m.is_finished() {
                    return Err(self.invalid(&command));
                }
                self.bump_epoch();
                self.m.instance.step_progress = 0;
                self.m.instance.cancelled = true;
                self.set_state(WorkflowState::Idle);
            }

            WorkflowCommand::SaveCheckpoint => {
                if self.m.state == WorkflowState::Idle {
                    return Err(self.invalid(&command));
                }
                self.save_checkpoint(false);
            }

            WorkflowCommand::RestoreCheckpoint(ref snapshot) => {
                let restorable = matches!(
                    self.m.state,
                    WorkflowState::Idle | WorkflowState::Paused { .. } | WorkflowState::Error { .. }
                );
                if !restorable {
                    return Err(self.invalid(&command));
                }
                if snapshot.workflow_id != self.m.instance.workflow_id {
                    return Err(OrchestratorError::Checkpoint(format!(
                        "snapshot belongs to {}, not {}",
                        snapshot.workflow_id, self.m.instance.workflow_id
                    )));
                }
                self.restore(snapshot);
            }
        }
        Ok(())
    }

    /// 返回 false 表示信号已过期被丢弃
    fn apply_signal(&mut self, signal: EffectSignal) -> bool {
        if self.m.instance.cancelled {
            return false;
        }
        let epoch_now = self.m.instance.epoch;

        match signal {
            EffectSignal::GenerationSucceeded { epoch, content } => {
                let Some((step, _)) = self.active_step(&[StepPhase::Processing]) else {
                    return false;
                };
                if epoch != epoch_now {
                    return false;
                }
                self.m.instance.step_progress = 60;
                self.set_state(WorkflowState::Active {
                    step,
                    phase: StepPhase::QualityChecking,
                });
                self.emit(WorkflowEvent::AiGeneration {
                    workflow_id: self.workflow_id(),
                    step,
                    attempt: self.m.instance.retry_count,
                    content_length: content.len(),
                });
                self.m.data.step_data.insert(step, content.clone());
                self.effects.push(Effect::EvaluateQuality {
                    step,
                    epoch: epoch_now,
                    content,
                    prior: self.m.data.clone(),
                });
                true
            }

            EffectSignal::GenerationFailed { epoch, error } => {
                let Some((step, _)) = self.active_step(&[StepPhase::Processing]) else {
                    return false;
                };
                if epoch != epoch_now {
                    return false;
                }
                self.m.last_error = Some(error.message.clone());
                self.set_state(WorkflowState::Active {
                    step,
                    phase: StepPhase::Error,
                });
                let report = ErrorReport {
                    workflow_id: self.workflow_id(),
                    step: Some(step),
                    message: error.message,
                    retry_count: self.m.instance.retry_count,
                    max_retries: self.m.instance.max_retries,
                    epoch: epoch_now,
                    fatal: false,
                };
                self.emit_with_snapshot(WorkflowEvent::Error(report));
                true
            }

            EffectSignal::QualityEvaluated { epoch, metrics } => {
                let Some((step, _)) = self.active_step(&[StepPhase::QualityChecking]) else {
                    return false;
                };
                if epoch != epoch_now {
                    return false;
                }
                self.apply_quality(step, metrics);
                true
            }

            EffectSignal::CheckpointSaved { epoch, at, fatal } => {
                self.m.instance.last_checkpoint_at = Some(at);
                if fatal && epoch == epoch_now && self.m.state == WorkflowState::Initializing {
                    self.enter_step(Step::Planning);
                }
                true
            }

            EffectSignal::CheckpointFailed {
                epoch,
                reason,
                fatal,
            } => {
                if !(fatal && epoch == epoch_now && self.m.state == WorkflowState::Initializing) {
                    return false;
                }
                let message = format!("checkpoint persistence failed: {reason}");
                self.m.last_error = Some(message.clone());
                self.set_state(WorkflowState::Error {
                    reason: message.clone(),
                });
                self.emit(WorkflowEvent::Error(ErrorReport {
                    workflow_id: self.workflow_id(),
                    step: None,
                    message,
                    retry_count: self.m.instance.retry_count,
                    max_retries: self.m.instance.max_retries,
                    epoch: epoch_now,
                    fatal: true,
                }));
                true
            }
        }
    }

    fn apply_quality(&mut self, step: Step, metrics: QualityMetrics) {
        let instance = &self.m.instance;
        let threshold = self
            .ctx
            .thresholds
            .threshold(instance.config.quality_level, step);
        let passed = metrics.passes(threshold);
        let event = WorkflowEvent::QualityCheckComplete {
            workflow_id: self.workflow_id(),
            step,
            score: metrics.overall_score,
            threshold,
            passed,
            suggestions: metrics.suggestions.clone(),
            retry_count: instance.retry_count,
            max_retries: instance.max_retries,
        };
        self.m.data.quality_metrics.insert(step, metrics.clone());

        if passed {
            self.emit(event);
            let result = StepResult {
                content: self
                    .m
                    .data
                    .step_data
                    .get(&step)
                    .cloned()
                    .unwrap_or_default(),
                quality_metrics: Some(metrics),
                completed_at: self.ctx.now,
                overridden: false,
                skipped: false,
            };
            self.complete_step(step, result, false);
            if self.m.instance.config.auto_advance {
                self.advance();
            }
        } else {
            self.set_state(WorkflowState::Active {
                step,
                phase: StepPhase::QualityFailed,
            });
            self.emit_with_snapshot(event);
        }
    }

    /// 进入步骤：重置步骤进度与重试计数，开始生成（引用被禁用时直接跳过）
    fn enter_step(&mut self, step: Step) {
        self.m.instance.current_step = Some(step);
        self.m.instance.step_progress = 0;
        self.m.instance.retry_count = 0;
        self.m.instance.manual_mode = false;

        if step == Step::Citation && !self.m.instance.config.include_citations {
            self.complete_step(step, skipped_result(self.ctx.now), false);
            if self.m.instance.config.auto_advance {
                self.advance();
            }
            return;
        }

        self.set_state(WorkflowState::Active {
            step,
            phase: StepPhase::Processing,
        });
        self.start_generation(step, Vec::new());
    }

    fn start_generation(&mut self, step: Step, improvement_hints: Vec<String>) {
        let instance = &self.m.instance;
        let mut context = GenerationContext::from_data(
            instance.workflow_id.clone(),
            instance.document_id.clone(),
            &instance.config,
            &self.m.data,
        );
        context.improvement_hints = improvement_hints;
        context.attempt = instance.retry_count;
        self.effects.push(Effect::Generate {
            step,
            epoch: instance.epoch,
            context,
        });
    }

    /// 记录结果并进入 completed 子状态；结果此后不可变
    fn complete_step(&mut self, step: Step, result: StepResult, manual: bool) {
        let overridden = result.overridden;
        let skipped = result.skipped;
        self.m.data.step_results.insert(step, result);
        self.m.instance.step_progress = 100;
        self.set_state(WorkflowState::Active {
            step,
            phase: StepPhase::Completed,
        });
        self.emit_with_snapshot(WorkflowEvent::StepCompleted {
            workflow_id: self.workflow_id(),
            step,
            overridden,
            skipped,
            manual,
            overall_progress: self.m.instance.overall_progress,
        });
    }

    /// 从 completed 前进：重新计算总进度，进入下一步或完成工作流
    fn advance(&mut self) {
        let Some((step, _)) = self.active_step(&[StepPhase::Completed]) else {
            return;
        };
        let total = self.m.instance.config.total_steps().max(1);
        let ratio = self.m.completed_steps() as f64 / total as f64;
        let progress = (ratio * 100.0).round().clamp(0.0, 100.0) as u8;
        self.m.instance.overall_progress = self.m.instance.overall_progress.max(progress);

        match step.next() {
            // 已有结果的步骤不重跑，直接回到其 completed
            Some(next) if self.m.data.step_results.contains_key(&next) => self.revisit(next),
            Some(next) => self.enter_step(next),
            None => {
                self.m.instance.overall_progress = 100;
                self.set_state(WorkflowState::Completed);
                self.emit(WorkflowEvent::WorkflowCompleted {
                    workflow_id: self.workflow_id(),
                    document_id: self.m.instance.document_id.clone(),
                });
                self.save_checkpoint(false);
            }
        }
    }

    /// 回到一个已完成步骤（不重新运行）
    fn revisit(&mut self, step: Step) {
        self.m.instance.current_step = Some(step);
        self.m.instance.step_progress = 100;
        self.set_state(WorkflowState::Active {
            step,
            phase: StepPhase::Completed,
        });
    }

    fn resume(&mut self, from: WorkflowState) {
        match from {
            WorkflowState::Initializing => {
                self.set_state(WorkflowState::Initializing);
                self.save_checkpoint(true);
            }
            WorkflowState::Active {
                step,
                phase: StepPhase::Processing | StepPhase::QualityChecking,
            } => {
                // 暂停时的生成/评估结果已被丢弃，重新生成
                self.m.instance.step_progress = 0;
                self.set_state(WorkflowState::Active {
                    step,
                    phase: StepPhase::Processing,
                });
                self.start_generation(step, Vec::new());
            }
            other => self.set_state(other),
        }
    }

    fn restore(&mut self, snapshot: &CheckpointSnapshot) {
        self.bump_epoch();
        let instance = &mut self.m.instance;
        instance.document_id = snapshot.document_id.clone();
        instance.current_step = snapshot.current_step;
        instance.step_progress = snapshot.step_progress;
        instance.overall_progress = snapshot.overall_progress;
        instance.config = snapshot.config.clone();
        instance.retry_count = snapshot.retry_count;
        if snapshot.max_retries > 0 {
            instance.max_retries = snapshot.max_retries;
        }
        instance.manual_mode = snapshot.manual_mode;
        instance.user_override = snapshot.user_override;
        instance.last_checkpoint_at = Some(snapshot.timestamp);
        self.m.data = snapshot.data();
        self.m.last_error = None;

        match snapshot.current_step {
            None => self.enter_step(Step::Planning),
            Some(step) if self.m.data.step_results.contains_key(&step) => {
                if step.next().is_none() && snapshot.overall_progress >= 100 {
                    self.set_state(WorkflowState::Completed);
                } else {
                    self.revisit(step);
                }
            }
            Some(step) => self.enter_step(step),
        }
    }
}

fn skipped_result(now: DateTime<Utc>) -> StepResult {
    StepResult {
        content: String::new(),
        quality_metrics: None,
        completed_at: now,
        overridden: false,
        skipped: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::WorkflowConfig;

    struct Harness {
        machine: WorkflowMachine,
        thresholds: ThresholdProfile,
        effects: Vec<Effect>,
    }

    impl Harness {
        fn new(config: WorkflowConfig) -> Self {
            let instance = WorkflowInstance::new("doc-1", config, 3);
            Self {
                machine: WorkflowMachine::new(instance),
                thresholds: ThresholdProfile::default(),
                effects: Vec::new(),
            }
        }

        fn apply(&mut self, input: MachineInput) -> Result<bool, OrchestratorError> {
            let ctx = TransitionContext {
                now: Utc::now(),
                thresholds: &self.thresholds,
            };
            let t = transition(&self.machine, input, &ctx)?;
            self.machine = t.machine;
            self.effects = t.effects;
            Ok(!t.stale)
        }

        fn command(&mut self, command: WorkflowCommand) -> Result<(), OrchestratorError> {
            self.apply(MachineInput::Command(command)).map(|_| ())
        }

        fn signal(&mut self, signal: EffectSignal) -> bool {
            self.apply(MachineInput::Signal(signal)).unwrap()
        }

        fn epoch(&self) -> u64 {
            self.machine.instance.epoch
        }

        /// 启动并通过初始化检查点，停在 planning.processing
        fn started(config: WorkflowConfig) -> Self {
            let mut h = Self::new(config);
            h.command(WorkflowCommand::StartWorkflow).unwrap();
            let epoch = h.epoch();
            h.signal(EffectSignal::CheckpointSaved {
                epoch,
                at: Utc::now(),
                fatal: true,
            });
            h
        }

        fn generate(&mut self, content: &str) {
            let epoch = self.epoch();
            assert!(self.signal(EffectSignal::GenerationSucceeded {
                epoch,
                content: content.into(),
            }));
        }

        fn score(&mut self, score: f64) {
            let epoch = self.epoch();
            assert!(self.signal(EffectSignal::QualityEvaluated {
                epoch,
                metrics: QualityMetrics::with_score(score),
            }));
        }

        fn fail(&mut self, message: &str) {
            let epoch = self.epoch();
            assert!(self.signal(EffectSignal::GenerationFailed {
                epoch,
                error: GenerationError::ai(message),
            }));
        }

        fn label(&self) -> String {
            self.machine.state.label()
        }

        fn has_generate(&self) -> bool {
            self.effects
                .iter()
                .any(|e| matches!(e, Effect::Generate { .. }))
        }

        fn events(&self) -> Vec<&WorkflowEvent> {
            self.effects
                .iter()
                .filter_map(|e| match e {
                    Effect::Emit { event, .. } => Some(event),
                    _ => None,
                })
                .collect()
        }

        /// 当前步骤生成并以给定分数通过
        fn pass_step(&mut self, score: f64) {
            self.generate("content");
            self.score(score);
        }
    }

    #[test]
    fn test_start_emits_events_and_fatal_checkpoint() {
        let mut h = Harness::new(WorkflowConfig::default());
        h.command(WorkflowCommand::StartWorkflow).unwrap();
        assert_eq!(h.label(), "initializing");
        assert!(h.events().iter().any(|e| matches!(e, WorkflowEvent::WorkflowStarted { .. })));
        assert!(h
            .effects
            .iter()
            .any(|e| matches!(e, Effect::SaveCheckpoint { fatal: true, .. })));

        let epoch = h.epoch();
        h.signal(EffectSignal::CheckpointSaved {
            epoch,
            at: Utc::now(),
            fatal: true,
        });
        assert_eq!(h.label(), "planning.processing");
        assert!(h.has_generate());
        assert!(h.machine.instance.last_checkpoint_at.is_some());
    }

    #[test]
    fn test_init_checkpoint_failure_is_fatal() {
        let mut h = Harness::new(WorkflowConfig::default());
        h.command(WorkflowCommand::StartWorkflow).unwrap();
        let epoch = h.epoch();
        h.signal(EffectSignal::CheckpointFailed {
            epoch,
            reason: "disk full".into(),
            fatal: true,
        });
        assert_eq!(h.label(), "error");
        assert!(h.events().iter().any(|e| matches!(
            e,
            WorkflowEvent::Error(ErrorReport { fatal: true, .. })
        )));
        assert!(h.command(WorkflowCommand::NextStep).is_err());
    }

    #[test]
    fn test_planning_pass_then_next_step() {
        let mut h = Harness::started(WorkflowConfig::default());
        h.generate("plan text");
        assert_eq!(h.label(), "planning.qualityChecking");
        assert_eq!(h.machine.instance.step_progress, 60);
        assert!(h
            .effects
            .iter()
            .any(|e| matches!(e, Effect::EvaluateQuality { step: Step::Planning, .. })));

        h.score(0.75);
        assert_eq!(h.label(), "planning.completed");
        assert_eq!(h.machine.instance.step_progress, 100);

        h.command(WorkflowCommand::NextStep).unwrap();
        assert_eq!(h.label(), "drafting.processing");
        assert_eq!(h.machine.instance.overall_progress, 20);
        assert_eq!(h.machine.instance.step_progress, 0);
        assert_eq!(h.machine.instance.current_step, Some(Step::Drafting));
    }

    #[test]
    fn test_quality_gate_uses_threshold_boundary() {
        let mut h = Harness::started(WorkflowConfig::default());
        h.pass_step(0.7);
        assert_eq!(h.label(), "planning.completed");

        let mut h = Harness::started(WorkflowConfig::default());
        h.pass_step(0.69);
        assert_eq!(h.label(), "planning.qualityFailed");
        assert!(!h.machine.data.step_results.contains_key(&Step::Planning));
        assert!(h.machine.data.quality_metrics.contains_key(&Step::Planning));
    }

    #[test]
    fn test_override_marks_result() {
        let mut h = Harness::started(WorkflowConfig::default());
        h.pass_step(0.9);
        h.command(WorkflowCommand::NextStep).unwrap();
        h.generate("weak draft");
        h.score(0.4);
        assert_eq!(h.label(), "drafting.qualityFailed");

        h.command(WorkflowCommand::OverrideQuality).unwrap();
        assert_eq!(h.label(), "drafting.completed");
        let result = &h.machine.data.step_results[&Step::Drafting];
        assert!(result.overridden);
        assert_eq!(result.content, "weak draft");
        assert!(h.machine.instance.user_override);
    }

    #[test]
    fn test_retry_bound_and_hints() {
        let mut h = Harness::started(WorkflowConfig::default());
        for attempt in 0..3 {
            h.generate("weak plan");
            h.score(0.2);
            assert_eq!(h.machine.instance.retry_count, attempt);
            h.command(WorkflowCommand::RetryStep { guard: None }).unwrap();
            assert_eq!(h.label(), "planning.processing");
        }
        h.generate("weak plan");
        h.score(0.2);
        assert_eq!(
            h.command(WorkflowCommand::RetryStep { guard: None }),
            Err(OrchestratorError::RetryLimitReached {
                step: Step::Planning,
                max_retries: 3
            })
        );
        // 重启清零重试计数
        h.command(WorkflowCommand::RestartStep).unwrap();
        assert_eq!(h.machine.instance.retry_count, 0);
        assert_eq!(h.label(), "planning.processing");
    }

    #[test]
    fn test_retry_after_quality_failure_passes_suggestions() {
        let mut h = Harness::started(WorkflowConfig::default());
        h.generate("weak plan");
        let epoch = h.epoch();
        let mut metrics = QualityMetrics::with_score(0.3);
        metrics.suggestions = vec!["State the objective.".into()];
        h.signal(EffectSignal::QualityEvaluated { epoch, metrics });
        h.command(WorkflowCommand::RetryStep { guard: None }).unwrap();
        let hints = h.effects.iter().find_map(|e| match e {
            Effect::Generate { context, .. } => Some(context.improvement_hints.clone()),
            _ => None,
        });
        assert_eq!(hints, Some(vec!["State the objective.".to_string()]));
    }

    #[test]
    fn test_generation_failure_reports_error() {
        let mut h = Harness::started(WorkflowConfig::default());
        h.fail("network error: connection reset");
        assert_eq!(h.label(), "planning.error");
        let report = h.events().into_iter().find_map(|e| match e {
            WorkflowEvent::Error(r) => Some(r.clone()),
            _ => None,
        });
        let report = report.unwrap();
        assert_eq!(report.step, Some(Step::Planning));
        assert_eq!(report.retry_count, 0);
        assert_eq!(report.max_retries, 3);
        assert_eq!(
            h.machine.last_error.as_deref(),
            Some("network error: connection reset")
        );
        assert_eq!(report.epoch, h.epoch());
    }

    #[test]
    fn test_guarded_retry_only_applies_to_the_failure_it_was_issued_for() {
        let mut h = Harness::started(WorkflowConfig::default());
        h.fail("network error: connection reset");
        let guard = RetryGuard {
            step: Step::Planning,
            epoch: h.epoch(),
            retry_count: 0,
        };

        // 失败已被处理后，旧的自动重试作废
        let mut moved_on = Harness {
            machine: h.machine.clone(),
            thresholds: ThresholdProfile::default(),
            effects: Vec::new(),
        };
        moved_on
            .command(WorkflowCommand::CompleteStep {
                content: Some("hand-written plan".into()),
            })
            .unwrap();
        let before = moved_on.machine.clone();
        let applied = moved_on
            .apply(MachineInput::Command(WorkflowCommand::RetryStep {
                guard: Some(guard),
            }))
            .unwrap();
        assert!(!applied);
        assert_eq!(moved_on.machine, before);
        assert!(moved_on.effects.is_empty());

        // 暂停后 epoch 变化
        h.command(WorkflowCommand::PauseWorkflow).unwrap();
        h.command(WorkflowCommand::ResumeWorkflow).unwrap();
        assert_eq!(h.label(), "planning.error");
        let applied = h
            .apply(MachineInput::Command(WorkflowCommand::RetryStep {
                guard: Some(guard),
            }))
            .unwrap();
        assert!(!applied);
        assert_eq!(h.machine.instance.retry_count, 0);

        let fresh = RetryGuard {
            epoch: h.epoch(),
            ..guard
        };
        let applied = h
            .apply(MachineInput::Command(WorkflowCommand::RetryStep {
                guard: Some(fresh),
            }))
            .unwrap();
        assert!(applied);
        assert_eq!(h.label(), "planning.processing");
        assert_eq!(h.machine.instance.retry_count, 1);

        // 同一个 guard 不会被第二次应用
        h.fail("network error: connection reset");
        let applied = h
            .apply(MachineInput::Command(WorkflowCommand::RetryStep {
                guard: Some(fresh),
            }))
            .unwrap();
        assert!(!applied);
    }

    #[test]
    fn test_citation_bypass_when_disabled() {
        let config = WorkflowConfig {
            include_citations: false,
            ..Default::default()
        };
        let mut h = Harness::started(config);
        h.pass_step(0.9);
        h.command(WorkflowCommand::NextStep).unwrap();
        assert_eq!(h.machine.instance.overall_progress, 25);
        h.pass_step(0.9);
        h.command(WorkflowCommand::NextStep).unwrap();

        assert_eq!(h.label(), "citation.completed");
        assert!(!h.has_generate());
        assert!(!h
            .effects
            .iter()
            .any(|e| matches!(e, Effect::EvaluateQuality { .. })));
        assert!(h.machine.data.step_results[&Step::Citation].skipped);
        assert_eq!(h.machine.instance.overall_progress, 50);

        h.command(WorkflowCommand::NextStep).unwrap();
        assert_eq!(h.label(), "grammar.processing");
        assert_eq!(h.machine.instance.overall_progress, 50);
    }

    #[test]
    fn test_full_run_progress_is_monotonic() {
        let mut h = Harness::started(WorkflowConfig::default());
        let mut last = 0;
        for _ in 0..5 {
            h.pass_step(0.99);
            h.command(WorkflowCommand::CompleteStep { content: None })
                .unwrap();
            assert!(h.machine.instance.overall_progress >= last);
            last = h.machine.instance.overall_progress;
        }
        assert_eq!(h.label(), "workflowCompleted");
        assert_eq!(last, 100);
        assert!(h
            .effects
            .iter()
            .any(|e| matches!(e, Effect::SaveCheckpoint { fatal: false, .. })));
        assert!(h
            .events()
            .iter()
            .any(|e| matches!(e, WorkflowEvent::WorkflowCompleted { .. })));
        assert!(h.command(WorkflowCommand::CancelWorkflow).is_err());
    }

    #[test]
    fn test_auto_advance() {
        let config = WorkflowConfig {
            auto_advance: true,
            ..Default::default()
        };
        let mut h = Harness::started(config);
        h.pass_step(0.9);
        assert_eq!(h.label(), "drafting.processing");
        assert_eq!(h.machine.instance.overall_progress, 20);
    }

    #[test]
    fn test_previous_and_goto_do_not_rerun_or_recompute() {
        let mut h = Harness::started(WorkflowConfig::default());
        h.pass_step(0.9);
        h.command(WorkflowCommand::NextStep).unwrap();
        h.pass_step(0.9);
        h.command(WorkflowCommand::NextStep).unwrap();
        h.pass_step(0.9);
        assert_eq!(h.label(), "citation.completed");
        let progress = h.machine.instance.overall_progress;

        h.command(WorkflowCommand::PreviousStep).unwrap();
        assert_eq!(h.label(), "drafting.completed");
        assert!(!h.has_generate());
        assert_eq!(h.machine.instance.overall_progress, progress);

        h.command(WorkflowCommand::GotoStep(Step::Planning)).unwrap();
        assert_eq!(h.label(), "planning.completed");
        assert!(h.command(WorkflowCommand::PreviousStep).is_err());
        assert!(h.command(WorkflowCommand::GotoStep(Step::Grammar)).is_err());

        // 前进经过已完成的步骤时不重跑
        h.command(WorkflowCommand::NextStep).unwrap();
        assert_eq!(h.label(), "drafting.completed");
        assert!(!h.has_generate());
    }

    #[test]
    fn test_skip_only_for_citation() {
        let mut h = Harness::started(WorkflowConfig::default());
        h.fail("model overloaded");
        assert_eq!(
            h.command(WorkflowCommand::SkipStep),
            Err(OrchestratorError::NotSkippable(Step::Planning))
        );

        h.command(WorkflowCommand::CompleteStep {
            content: Some("manual plan".into()),
        })
        .unwrap();
        assert_eq!(h.label(), "drafting.processing");
        let plan = &h.machine.data.step_results[&Step::Planning];
        assert_eq!(plan.content, "manual plan");
        assert!(plan.quality_metrics.is_none());

        h.pass_step(0.9);
        h.command(WorkflowCommand::NextStep).unwrap();
        h.generate("no citations here");
        h.score(0.1);
        h.command(WorkflowCommand::SkipStep).unwrap();
        assert_eq!(h.label(), "grammar.processing");
        assert!(h.machine.data.step_results[&Step::Citation].skipped);
    }

    #[test]
    fn test_completed_result_is_immutable() {
        let mut h = Harness::started(WorkflowConfig::default());
        h.pass_step(0.9);
        assert!(h
            .command(WorkflowCommand::CompleteStep {
                content: Some("replacement".into())
            })
            .is_err());
        assert!(h.command(WorkflowCommand::OverrideQuality).is_err());
        assert!(h.command(WorkflowCommand::RetryStep { guard: None }).is_err());
        assert_eq!(h.machine.data.step_results[&Step::Planning].content, "content");
    }

    #[test]
    fn test_pause_discards_stale_result_and_resume_reruns() {
        let mut h = Harness::started(WorkflowConfig::default());
        let old_epoch = h.epoch();
        h.command(WorkflowCommand::PauseWorkflow).unwrap();
        assert_eq!(h.label(), "paused");

        assert!(!h.signal(EffectSignal::GenerationSucceeded {
            epoch: old_epoch,
            content: "late".into(),
        }));
        assert_eq!(h.label(), "paused");

        h.command(WorkflowCommand::ResumeWorkflow).unwrap();
        assert_eq!(h.label(), "planning.processing");
        assert!(h.has_generate());

        assert!(!h.signal(EffectSignal::GenerationSucceeded {
            epoch: old_epoch,
            content: "late".into(),
        }));
        h.generate("fresh");
        assert_eq!(h.machine.data.step_data[&Step::Planning], "fresh");
    }

    #[test]
    fn test_resume_reenters_paused_step() {
        let mut h = Harness::started(WorkflowConfig::default());
        h.pass_step(0.9);
        h.command(WorkflowCommand::NextStep).unwrap();
        h.generate("draft");
        h.score(0.3);
        h.command(WorkflowCommand::PauseWorkflow).unwrap();
        h.command(WorkflowCommand::ResumeWorkflow).unwrap();
        assert_eq!(h.label(), "drafting.qualityFailed");
        assert!(!h.has_generate());
    }

    #[test]
    fn test_cancel_is_terminal_and_discards_results() {
        let mut h = Harness::started(WorkflowConfig::default());
        let epoch = h.epoch();
        h.command(WorkflowCommand::CancelWorkflow).unwrap();
        assert_eq!(h.label(), "idle");
        assert!(h.machine.instance.cancelled);
        assert!(!h.signal(EffectSignal::GenerationSucceeded {
            epoch,
            content: "late".into(),
        }));
        assert!(h.command(WorkflowCommand::StartWorkflow).is_err());
        assert!(h.command(WorkflowCommand::ResumeWorkflow).is_err());
    }

    #[test]
    fn test_save_and_restore_checkpoint() {
        let mut h = Harness::started(WorkflowConfig::default());
        h.pass_step(0.9);
        h.command(WorkflowCommand::NextStep).unwrap();
        h.pass_step(0.9);
        let snapshot = h.machine.snapshot(Utc::now());
        assert_eq!(snapshot.state, "drafting.completed");

        h.command(WorkflowCommand::SaveCheckpoint).unwrap();
        assert!(matches!(
            h.effects.as_slice(),
            [Effect::SaveCheckpoint { fatal: false, .. }]
        ));

        // 在全新的实例上恢复
        let mut fresh = Harness::new(WorkflowConfig::default());
        fresh.machine.instance.workflow_id = snapshot.workflow_id.clone();
        fresh
            .command(WorkflowCommand::RestoreCheckpoint(Box::new(snapshot.clone())))
            .unwrap();
        assert_eq!(fresh.label(), "drafting.completed");
        assert_eq!(fresh.machine.data.step_results.len(), 2);
        fresh.command(WorkflowCommand::NextStep).unwrap();
        assert_eq!(fresh.label(), "citation.processing");
        assert_eq!(fresh.machine.instance.overall_progress, 40);

        // 只能在 idle / paused / error 时恢复
        assert!(fresh
            .command(WorkflowCommand::RestoreCheckpoint(Box::new(snapshot.clone())))
            .is_err());

        let mut other = Harness::new(WorkflowConfig::default());
        assert!(matches!(
            other.command(WorkflowCommand::RestoreCheckpoint(Box::new(snapshot))),
            Err(OrchestratorError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_stale_quality_signal_after_restart() {
        let mut h = Harness::started(WorkflowConfig::default());
        h.fail("timeout");
        let epoch = h.epoch();
        h.command(WorkflowCommand::RestartStep).unwrap();
        assert!(h.epoch() > epoch);
        assert!(!h.signal(EffectSignal::GenerationSucceeded {
            epoch,
            content: "stale".into()
        }));
        assert_eq!(h.label(), "planning.processing");
    }

    #[test]
    fn test_manual_mode_flag() {
        let mut h = Harness::started(WorkflowConfig::default());
        assert!(h.command(WorkflowCommand::EnterManualMode).is_err());
        h.fail("model overloaded");
        h.command(WorkflowCommand::EnterManualMode).unwrap();
        assert!(h.machine.instance.manual_mode);
        assert_eq!(h.label(), "planning.error");
    }
}
