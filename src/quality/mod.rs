//! 质量评估：按步骤的启发式评分
//!
//! `evaluate(step, content, prior)` 对相同输入总是返回相同的总分；
//! 空文本或异常文本不会报错，无法计算的子项记 0。

pub mod citation;
pub mod heuristics;
pub mod scorers;
pub mod text;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workflow::types::{QualityLevel, Step, WorkflowData};

pub use text::TextStats;

/// 子评分低于此值时给出建议（与通过阈值无关）
pub const SUGGESTION_TRIGGER: f64 = 0.6;

/// 低于此总分时恢复管理器提供「带改进重新生成」恢复点
pub const LOW_SCORE_RECOVERY: f64 = 0.5;

/// 每步的结构统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityDetails {
    pub word_count: usize,
    pub sentence_count: usize,
    pub paragraph_count: usize,
    pub avg_sentence_length: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flesch_reading_ease: Option<f64>,
    /// 少于 30 句时不适用（None）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smog_index: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citation_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bibliography_entries: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grammar_issues: Option<usize>,
    /// 起草内容覆盖规划关键词的比例
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_coverage: Option<f64>,
}

impl QualityDetails {
    fn from_stats(stats: &TextStats) -> Self {
        Self {
            word_count: stats.word_count(),
            sentence_count: stats.sentence_count(),
            paragraph_count: stats.paragraph_count(),
            avg_sentence_length: stats.avg_sentence_length(),
            flesch_reading_ease: stats.flesch_reading_ease(),
            smog_index: stats.smog_index(),
            ..Default::default()
        }
    }
}

/// 一次质量评估的结果；只会被新的评估取代，不会被修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub overall_score: f64,
    pub metrics: BTreeMap<String, f64>,
    pub suggestions: Vec<String>,
    pub details: QualityDetails,
    pub timestamp: DateTime<Utc>,
}

impl QualityMetrics {
    /// 直接给定总分（测试与外部评估器使用）
    pub fn with_score(score: f64) -> Self {
        Self {
            overall_score: heuristics::clamp01(score),
            metrics: BTreeMap::new(),
            suggestions: Vec::new(),
            details: QualityDetails::default(),
            timestamp: Utc::now(),
        }
    }

    pub fn passes(&self, threshold: f64) -> bool {
        self.overall_score >= threshold
    }
}

/// 子评分收集器：记录分数，低于触发值时附带建议
#[derive(Debug, Default)]
pub struct ScoreCard {
    metrics: BTreeMap<String, f64>,
    suggestions: Vec<String>,
    pub details: QualityDetails,
}

impl ScoreCard {
    pub fn record(&mut self, name: &str, score: f64, suggestion: &str) {
        let score = heuristics::clamp01(score);
        if score < SUGGESTION_TRIGGER {
            self.suggestions.push(suggestion.to_string());
        }
        self.metrics.insert(name.to_string(), score);
    }

    /// 等权平均
    fn overall(&self) -> f64 {
        if self.metrics.is_empty() {
            return 0.0;
        }
        self.metrics.values().sum::<f64>() / self.metrics.len() as f64
    }
}

/// 质量评估器接口；编排器只依赖这个 trait
pub trait ContentEvaluator: Send + Sync {
    fn evaluate(&self, step: Step, content: &str, prior: &WorkflowData) -> QualityMetrics;
}

/// 内置启发式评估器
#[derive(Debug, Clone, Default)]
pub struct QualityEvaluator;

impl QualityEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl ContentEvaluator for QualityEvaluator {
    fn evaluate(&self, step: Step, content: &str, prior: &WorkflowData) -> QualityMetrics {
        let stats = TextStats::analyze(content);
        let mut card = ScoreCard {
            details: QualityDetails::from_stats(&stats),
            ..Default::default()
        };

        match step {
            Step::Planning => scorers::score_plan(&stats, content, &mut card),
            Step::Drafting => scorers::score_draft(&stats, content, prior, &mut card),
            Step::Citation => citation::score_citations(content, &mut card),
            Step::Grammar => scorers::score_grammar(&stats, content, &mut card),
            Step::Readability => scorers::score_readability(&stats, content, &mut card),
        }

        let overall_score = heuristics::clamp01(card.overall());
        tracing::debug!(step = %step, score = overall_score, "quality evaluated");

        QualityMetrics {
            overall_score,
            metrics: card.metrics,
            suggestions: card.suggestions,
            details: card.details,
            timestamp: Utc::now(),
        }
    }
}

/// 标准等级下各步骤阈值的覆盖项
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdOverrides {
    pub planning: Option<f64>,
    pub drafting: Option<f64>,
    pub citation: Option<f64>,
    pub grammar: Option<f64>,
    pub readability: Option<f64>,
}

impl ThresholdOverrides {
    fn get(&self, step: Step) -> Option<f64> {
        match step {
            Step::Planning => self.planning,
            Step::Drafting => self.drafting,
            Step::Citation => self.citation,
            Step::Grammar => self.grammar,
            Step::Readability => self.readability,
        }
    }
}

/// 每步通过阈值：standard 为基准，basic 低 0.1，strict 高 0.1（不超过 0.95）
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdProfile {
    base: BTreeMap<Step, f64>,
}

impl Default for ThresholdProfile {
    fn default() -> Self {
        Self {
            base: BTreeMap::from([
                (Step::Planning, 0.7),
                (Step::Drafting, 0.6),
                (Step::Citation, 0.8),
                (Step::Grammar, 0.85),
                (Step::Readability, 0.75),
            ]),
        }
    }
}

impl ThresholdProfile {
    pub fn with_overrides(overrides: &ThresholdOverrides) -> Self {
        let mut profile = Self::default();
        for step in Step::ALL {
            if let Some(value) = overrides.get(step) {
                profile.base.insert(step, heuristics::clamp01(value));
            }
        }
        profile
    }

    pub fn threshold(&self, level: QualityLevel, step: Step) -> f64 {
        let base = self.base.get(&step).copied().unwrap_or(0.7);
        let value = match level {
            QualityLevel::Basic => (base - 0.1).max(0.0),
            QualityLevel::Standard => base,
            QualityLevel::Strict => (base + 0.1).min(0.95),
        };
        (value * 100.0).round() / 100.0
    }
}
