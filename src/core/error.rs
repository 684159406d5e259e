//! 编排器错误类型与错误分类
//!
//! `ErrorCategory` 是事件与恢复管理器使用的分类；`OrchestratorError` 是命令/配置/检查点层面的失败。

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::workflow::types::Step;

/// 工作流失败的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// 生成调用失败或返回不可用内容
    AiError,
    /// 质量分低于阈值（闸门决定，不是硬失败）
    QualityError,
    NetworkError,
    /// 配置或输入不合法
    ValidationError,
    TimeoutError,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::AiError => "ai_error",
            ErrorCategory::QualityError => "quality_error",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::ValidationError => "validation_error",
            ErrorCategory::TimeoutError => "timeout_error",
        }
    }

    /// 只有 AI / 网络 / 超时类错误允许自动重试
    pub fn is_auto_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::AiError | ErrorCategory::NetworkError | ErrorCategory::TimeoutError
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 生成适配器的失败：带分类的上游消息
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{category}: {message}")]
pub struct GenerationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl GenerationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    pub fn ai(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::AiError, message)
    }
}

/// 编排器对外暴露的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// 当前状态不接受该命令
    #[error("Command {command} is not valid in state {state}")]
    InvalidTransition { state: String, command: String },

    #[error("Retry limit reached for step {step} ({max_retries} retries)")]
    RetryLimitReached { step: Step, max_retries: u32 },

    #[error("Step {0} cannot be skipped")]
    NotSkippable(Step),

    #[error("Recovery point not found: {0}")]
    RecoveryPointNotFound(String),

    #[error("Recovery option not found: {0}")]
    RecoveryOptionNotFound(String),

    #[error("Recovery option is not available: {0}")]
    RecoveryOptionUnavailable(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}
