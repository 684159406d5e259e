//! 文本统计：分段、分句、分词、音节计数与可读性公式
//!
//! 所有函数对空文本安全：无法计算的量返回 0 或 None，不会 panic。

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

/// SMOG 公式要求的最少句子数
pub const SMOG_MIN_SENTENCES: usize = 30;

fn word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z]+(?:['’][A-Za-z]+)?").expect("valid word regex"))
}

fn sentence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^.!?\n]+[.!?]*").expect("valid sentence regex"))
}

fn paragraph_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n\s*\n").expect("valid paragraph regex"))
}

/// 一段文本的基础统计
#[derive(Debug, Clone, Default)]
pub struct TextStats {
    /// 小写单词
    pub words: Vec<String>,
    pub sentences: Vec<String>,
    pub paragraphs: Vec<String>,
    pub syllables: usize,
    /// 三个及以上音节的单词数
    pub polysyllables: usize,
    /// 以空格包裹的小写单词序列，用于短语匹配
    normalized: String,
}

impl TextStats {
    pub fn analyze(text: &str) -> Self {
        let words: Vec<String> = word_re()
            .find_iter(text)
            .map(|m| m.as_str().to_lowercase())
            .collect();

        let sentences: Vec<String> = sentence_re()
            .find_iter(text)
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| word_re().is_match(s))
            .collect();

        let paragraphs: Vec<String> = paragraph_re()
            .split(text)
            .map(|p| p.trim().to_string())
            .filter(|p| word_re().is_match(p))
            .collect();

        let mut syllables = 0;
        let mut polysyllables = 0;
        for word in &words {
            let n = count_syllables(word);
            syllables += n;
            if n >= 3 {
                polysyllables += 1;
            }
        }

        let normalized = format!(" {} ", words.join(" "));

        Self {
            words,
            sentences,
            paragraphs,
            syllables,
            polysyllables,
            normalized,
        }
    }

    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    pub fn sentence_count(&self) -> usize {
        self.sentences.len()
    }

    pub fn paragraph_count(&self) -> usize {
        self.paragraphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// 每句单词数
    pub fn sentence_lengths(&self) -> Vec<usize> {
        self.sentences
            .iter()
            .map(|s| word_re().find_iter(s).count())
            .collect()
    }

    pub fn avg_sentence_length(&self) -> f64 {
        if self.sentences.is_empty() {
            return 0.0;
        }
        self.word_count() as f64 / self.sentence_count() as f64
    }

    pub fn distinct_words(&self) -> HashSet<&str> {
        self.words.iter().map(String::as_str).collect()
    }

    /// 统计词或短语（小写、按单词边界）出现次数
    pub fn count_terms(&self, terms: &[&str]) -> usize {
        terms
            .iter()
            .map(|t| self.normalized.matches(&format!(" {} ", t)).count())
            .sum()
    }

    /// 以指定前缀开头的单词数（用于词干匹配，如 resource / resources）
    pub fn count_prefixed(&self, prefixes: &[&str]) -> usize {
        self.words
            .iter()
            .filter(|w| prefixes.iter().any(|p| w.starts_with(p)))
            .count()
    }

    pub fn count_words(&self, words: &[&str]) -> usize {
        self.words
            .iter()
            .filter(|w| words.contains(&w.as_str()))
            .count()
    }

    /// Flesch Reading Ease；没有单词或句子时不可计算
    pub fn flesch_reading_ease(&self) -> Option<f64> {
        if self.words.is_empty() || self.sentences.is_empty() {
            return None;
        }
        let words = self.word_count() as f64;
        let sentences = self.sentence_count() as f64;
        Some(206.835 - 1.015 * (words / sentences) - 84.6 * (self.syllables as f64 / words))
    }

    /// SMOG 指数；少于 30 句时不适用
    pub fn smog_index(&self) -> Option<f64> {
        if self.sentence_count() < SMOG_MIN_SENTENCES {
            return None;
        }
        let per_30 = self.polysyllables as f64 * (30.0 / self.sentence_count() as f64);
        Some(1.0430 * per_30.sqrt() + 3.1291)
    }
}

/// 英文音节的粗略估计：元音组计数，去掉词尾不发音的 e
pub fn count_syllables(word: &str) -> usize {
    let word = word.to_lowercase();
    let mut count = 0;
    let mut prev_vowel = false;
    for c in word.chars() {
        let vowel = matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y');
        if vowel && !prev_vowel {
            count += 1;
        }
        prev_vowel = vowel;
    }
    if count > 1 && word.ends_with('e') && !word.ends_with("le") {
        count -= 1;
    }
    count.max(1)
}
