//! 工作流类型定义
//!
//! 定义步骤、状态机状态、运行实例、运行配置与步骤结果等核心数据类型

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::quality::QualityMetrics;

pub type WorkflowId = String;

/// 固定流水线中的一个步骤（顺序即执行顺序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// 规划（plan）
    Planning,
    /// 起草（draft）
    Drafting,
    /// 引用（cite）
    Citation,
    /// 语法校对（grammar）
    Grammar,
    /// 可读性优化（readability）
    Readability,
}

impl Step {
    pub const ALL: [Step; 5] = [
        Step::Planning,
        Step::Drafting,
        Step::Citation,
        Step::Grammar,
        Step::Readability,
    ];

    pub fn index(self) -> usize {
        match self {
            Step::Planning => 0,
            Step::Drafting => 1,
            Step::Citation => 2,
            Step::Grammar => 3,
            Step::Readability => 4,
        }
    }

    pub fn next(self) -> Option<Step> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn previous(self) -> Option<Step> {
        self.index().checked_sub(1).map(|i| Self::ALL[i])
    }

    /// 目前只有引用步骤允许跳过
    pub fn is_skippable(self) -> bool {
        matches!(self, Step::Citation)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Step::Planning => "planning",
            Step::Drafting => "drafting",
            Step::Citation => "citation",
            Step::Grammar => "grammar",
            Step::Readability => "readability",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 步骤内部子状态：processing → qualityChecking → {completed | qualityFailed}；error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Processing,
    QualityChecking,
    Completed,
    QualityFailed,
    Error,
}

impl StepPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            StepPhase::Processing => "processing",
            StepPhase::QualityChecking => "qualityChecking",
            StepPhase::Completed => "completed",
            StepPhase::QualityFailed => "qualityFailed",
            StepPhase::Error => "error",
        }
    }

    /// 已落定（没有进行中的 AI 调用或评估）
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            StepPhase::Completed | StepPhase::QualityFailed | StepPhase::Error
        )
    }
}

/// 状态机顶层状态（步骤 × 子状态的带标签联合）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkflowState {
    Idle,
    Initializing,
    Active { step: Step, phase: StepPhase },
    /// 暂停：记录暂停前的状态，恢复时原样重入
    Paused { from: Box<WorkflowState> },
    /// 全局错误（如初始化检查点持久化失败）
    Error { reason: String },
    /// workflowCompleted
    Completed,
}

impl WorkflowState {
    /// 形如 `drafting.qualityFailed` 的状态标签
    pub fn label(&self) -> String {
        match self {
            WorkflowState::Idle => "idle".to_string(),
            WorkflowState::Initializing => "initializing".to_string(),
            WorkflowState::Active { step, phase } => format!("{}.{}", step, phase.as_str()),
            WorkflowState::Paused { .. } => "paused".to_string(),
            WorkflowState::Error { .. } => "error".to_string(),
            WorkflowState::Completed => "workflowCompleted".to_string(),
        }
    }

    /// 是否处于可暂停的活动状态
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            WorkflowState::Initializing | WorkflowState::Active { .. }
        )
    }

    pub fn step(&self) -> Option<Step> {
        match self {
            WorkflowState::Active { step, .. } => Some(*step),
            _ => None,
        }
    }
}

/// 辅助力度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssistanceLevel {
    Minimal,
    #[default]
    Moderate,
    Extensive,
}

/// 质量等级：决定各步骤的通过阈值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    Basic,
    #[default]
    Standard,
    Strict,
}

/// 写作风格
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritingStyle {
    Academic,
    #[default]
    Professional,
    Casual,
    Creative,
}

/// 单次运行的配置（运行开始后不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub assistance_level: AssistanceLevel,
    pub quality_level: QualityLevel,
    pub style: WritingStyle,
    /// 目标字数
    pub target_length: u32,
    pub include_citations: bool,
    pub include_research: bool,
    /// 自动保存间隔（秒），0 表示关闭
    pub autosave_interval_secs: u64,
    /// 步骤完成后自动进入下一步
    pub auto_advance: bool,
    /// 文档主题/简介，拼入规划提示词
    pub topic: Option<String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            assistance_level: AssistanceLevel::default(),
            quality_level: QualityLevel::default(),
            style: WritingStyle::default(),
            target_length: 1000,
            include_citations: true,
            include_research: false,
            autosave_interval_secs: 0,
            auto_advance: false,
            topic: None,
        }
    }
}

impl WorkflowConfig {
    /// 进度计算使用的总步数：是否启用引用决定 4 或 5
    pub fn total_steps(&self) -> usize {
        if self.include_citations {
            5
        } else {
            4
        }
    }
}

/// 一次内容生产运行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub workflow_id: WorkflowId,
    pub document_id: String,
    pub current_step: Option<Step>,
    /// 0-100
    pub step_progress: u8,
    /// 0-100
    pub overall_progress: u8,
    pub retry_count: u32,
    pub max_retries: u32,
    pub manual_mode: bool,
    pub user_override: bool,
    pub config: WorkflowConfig,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// 暂停/取消/恢复/重启时递增，用于丢弃过期的异步结果
    pub epoch: u64,
    /// 已被取消（idle 终态）
    pub cancelled: bool,
}

impl WorkflowInstance {
    pub fn new(document_id: impl Into<String>, config: WorkflowConfig, max_retries: u32) -> Self {
        Self {
            workflow_id: format!("wf_{}", uuid::Uuid::new_v4()),
            document_id: document_id.into(),
            current_step: None,
            step_progress: 0,
            overall_progress: 0,
            retry_count: 0,
            max_retries,
            manual_mode: false,
            user_override: false,
            config,
            last_checkpoint_at: None,
            created_at: Utc::now(),
            epoch: 0,
            cancelled: false,
        }
    }
}

/// 已被接受的步骤结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub content: String,
    /// 手动提交或跳过时没有评估结果
    pub quality_metrics: Option<QualityMetrics>,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub overridden: bool,
    #[serde(default)]
    pub skipped: bool,
}

/// 运行中累积的数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowData {
    /// 每个步骤最近一次生成的原始内容（含未通过质量闸门的）
    pub step_data: BTreeMap<Step, String>,
    /// 每个步骤被接受的结果
    pub step_results: BTreeMap<Step, StepResult>,
    /// 每个步骤最近一次质量评估
    pub quality_metrics: BTreeMap<Step, QualityMetrics>,
}

impl WorkflowData {
    /// 已接受且未跳过的步骤内容，按步骤顺序
    pub fn accepted_content(&self) -> BTreeMap<Step, String> {
        self.step_results
            .iter()
            .filter(|(_, r)| !r.skipped)
            .map(|(s, r)| (*s, r.content.clone()))
            .collect()
    }

    /// 在 `before` 之前最近一个有内容的已接受结果
    pub fn latest_content_before(&self, before: Step) -> Option<&str> {
        self.step_results
            .range(..before)
            .rev()
            .find(|(_, r)| !r.skipped)
            .map(|(_, r)| r.content.as_str())
    }
}
