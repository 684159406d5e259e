//! 工作流事件、错误记录与恢复点
//!
//! 事件序列化为 `{"type": "STATE_CHANGE", ...}` 形式，供 UI 订阅端使用。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::ErrorCategory;
use crate::workflow::checkpoint::CheckpointSnapshot;
use crate::workflow::machine::WorkflowCommand;
use crate::workflow::types::{Step, WorkflowId};

/// 事件类型（处理器表与订阅按此分组）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    StateChange,
    Error,
    QualityCheckComplete,
    AiGeneration,
    StepCompleted,
    WorkflowStarted,
    WorkflowCompleted,
}

/// 编排器上报的失败
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub workflow_id: WorkflowId,
    /// None 表示非步骤内的失败（如事件处理器自身出错）
    pub step: Option<Step>,
    pub message: String,
    pub retry_count: u32,
    pub max_retries: u32,
    /// 报告失败时实例的 epoch
    #[serde(default)]
    pub epoch: u64,
    /// 致命错误不会自动恢复
    #[serde(default)]
    pub fatal: bool,
}

/// 工作流事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowEvent {
    StateChange {
        workflow_id: WorkflowId,
        from: String,
        to: String,
    },
    Error(ErrorReport),
    QualityCheckComplete {
        workflow_id: WorkflowId,
        step: Step,
        score: f64,
        threshold: f64,
        passed: bool,
        suggestions: Vec<String>,
        retry_count: u32,
        max_retries: u32,
    },
    AiGeneration {
        workflow_id: WorkflowId,
        step: Step,
        attempt: u32,
        content_length: usize,
    },
    StepCompleted {
        workflow_id: WorkflowId,
        step: Step,
        overridden: bool,
        skipped: bool,
        manual: bool,
        overall_progress: u8,
    },
    WorkflowStarted {
        workflow_id: WorkflowId,
        document_id: String,
    },
    WorkflowCompleted {
        workflow_id: WorkflowId,
        document_id: String,
    },
}

impl WorkflowEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            WorkflowEvent::StateChange { .. } => EventType::StateChange,
            WorkflowEvent::Error(_) => EventType::Error,
            WorkflowEvent::QualityCheckComplete { .. } => EventType::QualityCheckComplete,
            WorkflowEvent::AiGeneration { .. } => EventType::AiGeneration,
            WorkflowEvent::StepCompleted { .. } => EventType::StepCompleted,
            WorkflowEvent::WorkflowStarted { .. } => EventType::WorkflowStarted,
            WorkflowEvent::WorkflowCompleted { .. } => EventType::WorkflowCompleted,
        }
    }

    pub fn workflow_id(&self) -> &str {
        match self {
            WorkflowEvent::StateChange { workflow_id, .. }
            | WorkflowEvent::QualityCheckComplete { workflow_id, .. }
            | WorkflowEvent::AiGeneration { workflow_id, .. }
            | WorkflowEvent::StepCompleted { workflow_id, .. }
            | WorkflowEvent::WorkflowStarted { workflow_id, .. }
            | WorkflowEvent::WorkflowCompleted { workflow_id, .. } => workflow_id,
            WorkflowEvent::Error(report) => &report.workflow_id,
        }
    }

    pub fn step(&self) -> Option<Step> {
        match self {
            WorkflowEvent::QualityCheckComplete { step, .. }
            | WorkflowEvent::AiGeneration { step, .. }
            | WorkflowEvent::StepCompleted { step, .. } => Some(*step),
            WorkflowEvent::Error(report) => report.step,
            _ => None,
        }
    }
}

/// 已分类的失败记录（写入后不再修改）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowError {
    pub id: String,
    pub workflow_id: WorkflowId,
    pub step: Option<Step>,
    pub category: ErrorCategory,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub recoverable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoverySeverity {
    Low,
    Medium,
    High,
}

/// 恢复动作种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecoveryOptionKind {
    Retry,
    Skip,
    RestartStep,
    Manual,
    /// 带着上次的质量建议重新生成
    Regenerate,
    OverrideQuality,
}

impl RecoveryOptionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryOptionKind::Retry => "retry",
            RecoveryOptionKind::Skip => "skip",
            RecoveryOptionKind::RestartStep => "restartStep",
            RecoveryOptionKind::Manual => "manual",
            RecoveryOptionKind::Regenerate => "regenerate",
            RecoveryOptionKind::OverrideQuality => "overrideQuality",
        }
    }

    /// 执行该选项时交给编排器的命令
    pub fn command(self) -> WorkflowCommand {
        match self {
            RecoveryOptionKind::Retry | RecoveryOptionKind::Regenerate => {
                WorkflowCommand::RetryStep { guard: None }
            }
            RecoveryOptionKind::Skip => WorkflowCommand::SkipStep,
            RecoveryOptionKind::RestartStep => WorkflowCommand::RestartStep,
            RecoveryOptionKind::Manual => WorkflowCommand::EnterManualMode,
            RecoveryOptionKind::OverrideQuality => WorkflowCommand::OverrideQuality,
        }
    }
}

/// 绑定在恢复点上的一个可执行动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOption {
    /// 在所属恢复点内唯一（即 kind 的名字）
    pub id: String,
    pub kind: RecoveryOptionKind,
    pub label: String,
    pub description: String,
    pub severity: RecoverySeverity,
    /// 当前是否可执行（如 skip 只对引用步骤可用）
    pub enabled: bool,
}

impl RecoveryOption {
    pub fn new(
        kind: RecoveryOptionKind,
        label: &str,
        description: &str,
        severity: RecoverySeverity,
        enabled: bool,
    ) -> Self {
        Self {
            id: kind.as_str().to_string(),
            kind,
            label: label.to_string(),
            description: description.to_string(),
            severity,
            enabled,
        }
    }
}

/// 失败或关键状态变化时保存的快照 + 可选恢复动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPoint {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub workflow_id: WorkflowId,
    pub step: Option<Step>,
    pub context_snapshot: Option<CheckpointSnapshot>,
    pub error: Option<WorkflowError>,
    pub recovery_options: Vec<RecoveryOption>,
}

impl RecoveryPoint {
    pub fn option(&self, option_id: &str) -> Option<&RecoveryOption> {
        self.recovery_options.iter().find(|o| o.id == option_id)
    }
}

/// 恢复管理器交给编排器执行的指令
#[derive(Debug, Clone)]
pub struct RecoveryDirective {
    pub workflow_id: WorkflowId,
    pub recovery_point_id: String,
    pub option: RecoveryOptionKind,
    pub command: WorkflowCommand,
    /// 退避计时到期后自动发出
    pub automatic: bool,
}
