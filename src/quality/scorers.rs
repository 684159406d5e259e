//! 规划、起草、语法、可读性四个步骤的评分规则

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use super::heuristics::{
    clamp01, clarity_score, coherence_score, flow_score, grammar_score, readability_score,
    sentence_variety_score, structure_score,
};
use super::text::TextStats;
use super::ScoreCard;
use crate::workflow::types::{Step, WorkflowData};

/// 规划完整性：目标 / 结构 / 时间线 / 资源 四组关键词（前缀匹配）
const PLAN_KEYWORD_GROUPS: &[&[&str]] = &[
    &["objective", "goal", "aim", "purpose"],
    &["structure", "outline", "section", "introduction", "conclusion"],
    &["timeline", "schedule", "deadline", "milestone", "week", "phase"],
    &["resource", "tool", "source", "material", "budget", "reference"],
];

/// 细节/论证标记
const DETAIL_MARKERS: &[&str] = &[
    "for example",
    "for instance",
    "specifically",
    "in particular",
    "evidence",
    "data",
    "analysis",
    "research",
    "study",
    "because",
    "demonstrates",
];

const PAST_MARKERS: &[&str] = &["was", "were", "had", "did"];
const PRESENT_MARKERS: &[&str] = &["is", "are", "has", "have", "does", "do"];
const FIRST_PERSON: &[&str] = &["i", "me", "my", "we", "our", "us"];
const SECOND_PERSON: &[&str] = &["you", "your", "yours"];
const THIRD_PERSON: &[&str] = &["he", "she", "they", "them", "their", "his", "her"];
const FORMAL_MARKERS: &[&str] = &[
    "therefore",
    "moreover",
    "furthermore",
    "consequently",
    "thus",
    "hence",
    "accordingly",
];
const INFORMAL_MARKERS: &[&str] = &[
    "gonna", "wanna", "kinda", "stuff", "awesome", "okay", "ok", "yeah", "cool",
];

fn token_shape_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z]+(?:['’-][A-Za-z]+)*$").expect("valid token regex"))
}

fn passive_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(am|is|are|was|were|be|been|being)\s+\w+ed\b").expect("valid passive regex")
    })
}

pub fn score_plan(stats: &TextStats, text: &str, card: &mut ScoreCard) {
    card.record(
        "structure",
        structure_score(stats, text),
        "Organize the plan into clear sections with headings or bullet points.",
    );

    let covered = PLAN_KEYWORD_GROUPS
        .iter()
        .filter(|group| stats.count_prefixed(group) > 0)
        .count();
    card.record(
        "completeness",
        covered as f64 / PLAN_KEYWORD_GROUPS.len() as f64,
        "State the objective, structure, timeline and resources explicitly.",
    );

    card.record(
        "clarity",
        clarity_score(stats),
        "Keep sentences near 15-20 words and add transitions or examples.",
    );
    card.record(
        "coherence",
        coherence_score(stats),
        "Connect the sections with linking words and reuse the key terms.",
    );
}

pub fn score_draft(stats: &TextStats, text: &str, prior: &WorkflowData, card: &mut ScoreCard) {
    card.record(
        "content_depth",
        content_depth(stats),
        "Add supporting details, examples or analysis to deepen the content.",
    );

    let (grammar, issues) = grammar_score(stats, text);
    card.details.grammar_issues = Some(issues);
    card.record(
        "grammar",
        grammar,
        "Fix common grammar problems and split sentences longer than 30 words.",
    );

    card.record(
        "structure",
        structure_score(stats, text),
        "Break the draft into well-sized paragraphs.",
    );
    card.record(
        "readability",
        readability_score(stats),
        "Use shorter sentences and simpler words to improve readability.",
    );
    card.record(
        "flow",
        flow_score(stats),
        "Use more transition words between ideas and paragraphs.",
    );

    if let Some(plan) = prior.step_results.get(&Step::Planning) {
        card.details.plan_coverage = Some(plan_coverage(&plan.content, stats));
    }
}

pub fn score_grammar(stats: &TextStats, text: &str, card: &mut ScoreCard) {
    let (grammar, issues) = grammar_score(stats, text);
    card.details.grammar_issues = Some(issues);
    card.record(
        "grammar",
        grammar,
        "Correct the flagged grammar patterns and overly long sentences.",
    );
    card.record(
        "spelling",
        spelling_score(text),
        "Check spelling; several tokens do not look like valid words.",
    );
    card.record(
        "style_consistency",
        style_consistency(stats),
        "Keep tense, person and tone consistent throughout.",
    );
    card.record(
        "sentence_variety",
        sentence_variety_score(stats),
        "Vary sentence length to avoid a monotonous rhythm.",
    );
}

pub fn score_readability(stats: &TextStats, text: &str, card: &mut ScoreCard) {
    card.record(
        "flesch",
        readability_score(stats),
        "Simplify vocabulary and shorten sentences to raise the reading ease score.",
    );
    card.record(
        "clarity",
        clarity_score(stats),
        "Aim for an average sentence length near 17 words.",
    );
    card.record(
        "flow",
        flow_score(stats),
        "Add transitions so paragraphs lead into each other.",
    );
    card.record(
        "engagement",
        engagement(stats, text),
        "Engage the reader with questions, active voice and varied sentences.",
    );
}

/// 词汇丰富度（type-token ratio）+ 细节标记
fn content_depth(stats: &TextStats) -> f64 {
    if stats.is_empty() {
        return 0.0;
    }
    let ttr = stats.distinct_words().len() as f64 / stats.word_count() as f64;
    let richness = (ttr * 1.5).min(1.0);
    let markers = (stats.count_terms(DETAIL_MARKERS) as f64 / 4.0).min(1.0);
    clamp01((richness + markers) / 2.0)
}

/// 规划中较长的关键词在草稿里出现的比例
fn plan_coverage(plan: &str, draft: &TextStats) -> f64 {
    let plan_stats = TextStats::analyze(plan);
    let keywords: HashSet<&str> = plan_stats
        .words
        .iter()
        .filter(|w| w.len() >= 6)
        .map(String::as_str)
        .collect();
    if keywords.is_empty() {
        return 0.0;
    }
    let draft_words = draft.distinct_words();
    let hit = keywords.iter().filter(|k| draft_words.contains(*k)).count();
    hit as f64 / keywords.len() as f64
}

/// 符合简单单词形态的 token 比例；含数字的 token 不计
fn spelling_score(text: &str) -> f64 {
    let tokens: Vec<&str> = text
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|t| !t.is_empty() && !t.chars().any(|c| c.is_ascii_digit()))
        .collect();
    if tokens.is_empty() {
        return 0.0;
    }
    let valid = tokens
        .iter()
        .filter(|t| token_shape_re().is_match(t))
        .count();
    valid as f64 / tokens.len() as f64
}

/// 一组计数中占主导的比例；全为 0 视为一致
fn dominance(counts: &[usize]) -> f64 {
    let total: usize = counts.iter().sum();
    if total == 0 {
        return 1.0;
    }
    counts.iter().copied().max().unwrap_or(0) as f64 / total as f64
}

/// 时态 / 人称 / 语气 的主导比例平均值
fn style_consistency(stats: &TextStats) -> f64 {
    if stats.is_empty() {
        return 0.0;
    }
    let past = stats.count_words(PAST_MARKERS)
        + stats
            .words
            .iter()
            .filter(|w| w.len() > 3 && w.ends_with("ed"))
            .count();
    let present = stats.count_words(PRESENT_MARKERS);
    let tense = dominance(&[past, present]);

    let person = dominance(&[
        stats.count_words(FIRST_PERSON),
        stats.count_words(SECOND_PERSON),
        stats.count_words(THIRD_PERSON),
    ]);

    let tone = dominance(&[
        stats.count_words(FORMAL_MARKERS),
        stats.count_words(INFORMAL_MARKERS),
    ]);

    clamp01((tense + person + tone) / 3.0)
}

/// 提问 + 句式变化 + 主动语态比例
fn engagement(stats: &TextStats, text: &str) -> f64 {
    if stats.sentence_count() == 0 {
        return 0.0;
    }
    let question = if text.contains('?') { 1.0 } else { 0.0 };
    let variety = sentence_variety_score(stats);
    let passive = passive_re().find_iter(text).count() as f64;
    let active = (1.0 - passive / stats.sentence_count() as f64).max(0.0);
    clamp01((question + variety + active) / 3.0)
}
