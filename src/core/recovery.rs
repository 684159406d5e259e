//! 错误恢复策略
//!
//! 按消息子串对失败分类，判断是否可恢复，并计算自动重试的指数退避延迟。

use std::time::Duration;

use crate::core::error::ErrorCategory;

/// 出现这些片段的错误永远不可恢复
const TERMINAL_PATTERNS: &[&str] = &[
    "authentication failed",
    "permission denied",
    "invalid configuration",
    "quota exceeded",
];

const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out"];
const NETWORK_PATTERNS: &[&str] = &["network", "connection", "fetch", "dns", "econn"];
const VALIDATION_PATTERNS: &[&str] = &["validation", "invalid", "malformed", "required"];
const QUALITY_PATTERNS: &[&str] = &["quality", "score"];

/// 按消息内容分类；无匹配时归为 ai_error
pub fn classify(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();
    let has = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));
    if has(TIMEOUT_PATTERNS) {
        ErrorCategory::TimeoutError
    } else if has(NETWORK_PATTERNS) {
        ErrorCategory::NetworkError
    } else if has(VALIDATION_PATTERNS) {
        ErrorCategory::ValidationError
    } else if has(QUALITY_PATTERNS) {
        ErrorCategory::QualityError
    } else {
        ErrorCategory::AiError
    }
}

/// 是否可恢复：终止名单与校验类错误不可恢复
pub fn is_recoverable(category: ErrorCategory, message: &str) -> bool {
    let lower = message.to_lowercase();
    if TERMINAL_PATTERNS.iter().any(|p| lower.contains(p)) {
        return false;
    }
    category != ErrorCategory::ValidationError
}

/// 自动重试与退避参数
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl RecoveryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// 第 `retry_count` 次重试前的等待：base * 2^n，封顶 max
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// 可恢复、类别允许、非致命、且未达上限时自动重试
    pub fn should_auto_retry(
        &self,
        category: ErrorCategory,
        recoverable: bool,
        fatal: bool,
        retry_count: u32,
        max_retries: u32,
    ) -> bool {
        recoverable && !fatal && category.is_auto_retryable() && retry_count < max_retries
    }
}
