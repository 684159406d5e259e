//! 多个步骤共用的启发式子评分（结构、清晰度、衔接、语法、句式变化、可读性）

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use super::text::TextStats;

/// 过渡词/短语
pub const TRANSITIONS: &[&str] = &[
    "however",
    "therefore",
    "moreover",
    "furthermore",
    "additionally",
    "consequently",
    "meanwhile",
    "finally",
    "first",
    "second",
    "next",
    "then",
    "thus",
    "in addition",
    "as a result",
    "in contrast",
    "on the other hand",
    "similarly",
    "in conclusion",
];

/// 举例标记
pub const EXAMPLE_MARKERS: &[&str] = &["for example", "for instance", "such as", "including"];

/// 句间连接词
pub const CONNECTORS: &[&str] = &[
    "however",
    "therefore",
    "moreover",
    "furthermore",
    "additionally",
    "consequently",
    "thus",
    "hence",
    "also",
    "because",
    "so",
    "while",
    "although",
];

/// 最佳平均句长
pub const OPTIMAL_SENTENCE_LENGTH: f64 = 17.5;

/// 超过该词数的句子视为 run-on
pub const RUN_ON_WORDS: usize = 30;

pub fn clamp01(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}

fn list_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(#{1,6}\s|[-*+]\s|\d+[.)]\s)").expect("valid list regex"))
}

fn grammar_patterns() -> &'static [Regex] {
    static RE: OnceLock<Vec<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        [
            r"(?i)\b(could|would|should|must|might) of\b",
            r"(?i)\b(more|less|better|worse|rather|greater|smaller) then\b",
            r"(?i)\btheir (is|are|was|were)\b",
            r"(?i)\byour (welcome|right about)\b",
            r"(?i)\bits (a|an|the|not|been|going)\b",
            r"(?i)\b(alot|irregardless)\b",
            r"(?i)\ba [aei][a-z]+\b",
            r"[A-Za-z] [,;:!?]",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid grammar regex"))
        .collect()
    })
}

/// 段落数量、每段句子密度、列表/标题行
pub fn structure_score(stats: &TextStats, text: &str) -> f64 {
    if stats.is_empty() {
        return 0.0;
    }
    let paragraphs = stats.paragraph_count().max(1) as f64;
    let paragraph_score = (paragraphs / 3.0).min(1.0);

    let density = stats.sentence_count() as f64 / paragraphs;
    let density_score = if (2.0..=6.0).contains(&density) {
        1.0
    } else if density > 0.0 {
        0.5
    } else {
        0.0
    };

    let list_lines = text
        .lines()
        .filter(|l| list_line_re().is_match(l.trim_start()))
        .count();
    let list_score = (list_lines as f64 / 3.0).min(1.0);

    clamp01((paragraph_score + density_score + list_score) / 3.0)
}

/// 平均句长接近最佳值 + 过渡/举例标记
pub fn clarity_score(stats: &TextStats) -> f64 {
    if stats.sentence_count() == 0 {
        return 0.0;
    }
    let deviation = (stats.avg_sentence_length() - OPTIMAL_SENTENCE_LENGTH).abs();
    let length_score = (1.0 - deviation / OPTIMAL_SENTENCE_LENGTH).max(0.0);
    let markers = stats.count_terms(TRANSITIONS) + stats.count_terms(EXAMPLE_MARKERS);
    let marker_score = (markers as f64 / 3.0).min(1.0);
    clamp01(0.7 * length_score + 0.3 * marker_score)
}

/// 每段平均过渡词数，两个及以上记满分
pub fn flow_score(stats: &TextStats) -> f64 {
    if stats.is_empty() {
        return 0.0;
    }
    let paragraphs = stats.paragraph_count().max(1) as f64;
    let per_paragraph = stats.count_terms(TRANSITIONS) as f64 / paragraphs;
    clamp01(per_paragraph / 2.0)
}

/// 连接词密度 + 关键词复现 + 段首衔接
pub fn coherence_score(stats: &TextStats) -> f64 {
    if stats.sentence_count() == 0 {
        return 0.0;
    }
    let connector_density = stats.count_terms(CONNECTORS) as f64 / stats.sentence_count() as f64;
    let connector_score = (connector_density * 2.0).min(1.0);

    let mut frequency: HashMap<&str, usize> = HashMap::new();
    for word in stats.words.iter().filter(|w| w.len() >= 5) {
        *frequency.entry(word.as_str()).or_default() += 1;
    }
    let repetition_score = if frequency.is_empty() {
        0.0
    } else {
        let repeated = frequency.values().filter(|&&n| n >= 2).count();
        (repeated as f64 / frequency.len() as f64 * 3.0).min(1.0)
    };

    let paragraph_score = if stats.paragraph_count() < 2 {
        0.5
    } else {
        let linked = stats.paragraphs[1..]
            .iter()
            .filter(|p| {
                let opening = TextStats::analyze(&leading_words(p, 8));
                opening.count_terms(CONNECTORS) + opening.count_terms(TRANSITIONS) > 0
            })
            .count();
        linked as f64 / (stats.paragraph_count() - 1) as f64
    };

    clamp01((connector_score + repetition_score + paragraph_score) / 3.0)
}

fn leading_words(text: &str, n: usize) -> String {
    text.split_whitespace().take(n).collect::<Vec<_>>().join(" ")
}

/// 启发式语法问题数：常见混淆、重复词、过长句
pub fn grammar_issues(stats: &TextStats, text: &str) -> usize {
    let pattern_hits: usize = grammar_patterns()
        .iter()
        .map(|re| re.find_iter(text).count())
        .sum();

    let mut repeated = 0;
    let mut run_on = 0;
    for sentence in &stats.sentences {
        let words: Vec<String> = sentence
            .split_whitespace()
            .map(|w| {
                w.trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase()
            })
            .filter(|w| !w.is_empty())
            .collect();
        repeated += words.windows(2).filter(|pair| pair[0] == pair[1]).count();
        if words.len() > RUN_ON_WORDS {
            run_on += 1;
        }
    }

    pattern_hits + repeated + run_on
}

/// 1 - 问题数/句数
pub fn grammar_score(stats: &TextStats, text: &str) -> (f64, usize) {
    let issues = grammar_issues(stats, text);
    if stats.sentence_count() == 0 {
        return (0.0, issues);
    }
    (
        clamp01(1.0 - issues as f64 / stats.sentence_count() as f64),
        issues,
    )
}

/// 句长变异系数，0.5 及以上记满分
pub fn sentence_variety_score(stats: &TextStats) -> f64 {
    let lengths = stats.sentence_lengths();
    if lengths.len() < 2 {
        return 0.0;
    }
    let n = lengths.len() as f64;
    let mean = lengths.iter().sum::<usize>() as f64 / n;
    if mean == 0.0 {
        return 0.0;
    }
    let variance = lengths
        .iter()
        .map(|&l| (l as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    clamp01(variance.sqrt() / mean / 0.5)
}

/// Flesch 分数映射到 [0,1]：(score - 30) / 70
pub fn readability_score(stats: &TextStats) -> f64 {
    stats
        .flesch_reading_ease()
        .map(|f| clamp01((f - 30.0) / 70.0))
        .unwrap_or(0.0)
}
