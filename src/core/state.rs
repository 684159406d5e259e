//! 状态投影：WorkflowView
//!
//! UI 只持有轻量的 WorkflowView（状态标签、进度、重试、标记、错误）；完整状态由编排器维护并投影到 WorkflowView。

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::workflow::machine::WorkflowMachine;
use crate::workflow::types::{Step, StepPhase, WorkflowId, WorkflowState};

/// UI 看到的「投影」状态，轻量且易于渲染
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkflowView {
    pub workflow_id: WorkflowId,
    pub document_id: String,
    /// 形如 `drafting.qualityFailed`
    pub state: String,
    pub current_step: Option<Step>,
    /// 当前步骤子状态（非步骤状态时为 None）
    pub phase: Option<StepPhase>,
    pub step_progress: u8,
    pub overall_progress: u8,
    pub retry_count: u32,
    pub max_retries: u32,
    pub manual_mode: bool,
    pub user_override: bool,
    pub paused: bool,
    /// 处于全局 error 状态
    pub failed: bool,
    pub cancelled: bool,
    pub last_error: Option<String>,
    /// 当前步骤最近一次质量分
    pub last_score: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowView {
    /// 将状态机投影为 UI 可渲染的 WorkflowView
    pub fn project(machine: &WorkflowMachine) -> Self {
        let instance = &machine.instance;
        let last_score = instance
            .current_step
            .and_then(|s| machine.data.quality_metrics.get(&s))
            .map(|m| m.overall_score);
        Self {
            workflow_id: instance.workflow_id.clone(),
            document_id: instance.document_id.clone(),
            state: machine.state.label(),
            current_step: instance.current_step,
            phase: match machine.state {
                WorkflowState::Active { phase, .. } => Some(phase),
                _ => None,
            },
            step_progress: instance.step_progress,
            overall_progress: instance.overall_progress,
            retry_count: instance.retry_count,
            max_retries: instance.max_retries,
            manual_mode: instance.manual_mode,
            user_override: instance.user_override,
            paused: matches!(machine.state, WorkflowState::Paused { .. }),
            failed: matches!(machine.state, WorkflowState::Error { .. }),
            cancelled: instance.cancelled,
            last_error: machine.last_error.clone(),
            last_score,
            updated_at: Utc::now(),
        }
    }

    /// 完成或已取消：不会再有任何变化
    pub fn is_terminal(&self) -> bool {
        self.cancelled || self.state == WorkflowState::Completed.label()
    }

    /// 没有进行中的生成/评估，等待操作员命令（或已终止）
    pub fn is_settled(&self) -> bool {
        self.is_terminal()
            || self.paused
            || self.failed
            || self.phase.is_some_and(StepPhase::is_settled)
    }
}
