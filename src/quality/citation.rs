//! 引用步骤评分：格式、完整性、准确性、一致性

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use super::ScoreCard;

/// 正文中识别出的引用格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CitationStyle {
    /// (Smith, 2020) / (Smith & Lee, 2019, p. 4)
    Apa,
    /// (Smith 23)
    Mla,
    /// [1] / [2, 3]
    Numeric,
}

#[derive(Debug, Clone, Default)]
pub struct CitationScan {
    pub in_text: Vec<(CitationStyle, String)>,
    pub has_bibliography: bool,
    pub bibliography: Vec<String>,
}

fn apa_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\([A-Z][A-Za-z'\-]+(?: et al\.)?(?:,? (?:&|and) [A-Z][A-Za-z'\-]+)?, \d{4}[a-z]?(?:, pp?\. ?\d+(?:-\d+)?)?\)",
        )
        .expect("valid apa regex")
    })
}

fn mla_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\([A-Z][A-Za-z'\-]+(?: et al\.)? \d{1,4}(?:-\d+)?\)").expect("valid mla regex")
    })
}

fn numeric_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\d+(?:\s*[,\-–]\s*\d+)*\]").expect("valid numeric regex"))
}

fn bibliography_heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:#+\s*)?(references|bibliography|works cited|sources)\s*:?\s*$")
            .expect("valid heading regex")
    })
}

fn year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(1[5-9]\d{2}|20\d{2})\b").expect("valid year regex"))
}

/// 被视为有效条目的最小长度
const MIN_CITATION_LEN: usize = 10;

/// 扫描正文引用与参考文献列表
pub fn scan(text: &str) -> CitationScan {
    let mut scan = CitationScan::default();

    let mut body = String::new();
    let mut in_bibliography = false;
    for line in text.lines() {
        if bibliography_heading_re().is_match(line) {
            in_bibliography = true;
            scan.has_bibliography = true;
            continue;
        }
        if in_bibliography {
            let entry = line.trim();
            if !entry.is_empty() {
                scan.bibliography.push(entry.to_string());
            }
        } else {
            body.push_str(line);
            body.push('\n');
        }
    }

    for (style, re) in [
        (CitationStyle::Apa, apa_re()),
        (CitationStyle::Mla, mla_re()),
        (CitationStyle::Numeric, numeric_re()),
    ] {
        for m in re.find_iter(&body) {
            scan.in_text.push((style, m.as_str().to_string()));
        }
    }

    scan
}

pub fn score_citations(text: &str, card: &mut ScoreCard) {
    let scan = scan(text);
    card.details.citation_count = Some(scan.in_text.len());
    card.details.bibliography_entries = Some(scan.bibliography.len());

    let format_validity = if !scan.in_text.is_empty() {
        1.0
    } else if !scan.bibliography.is_empty() {
        0.5
    } else {
        0.0
    };
    card.record(
        "format_validity",
        format_validity,
        "Add in-text citations in a recognized format such as (Author, 2020) or [1].",
    );

    let has_bibliography = scan.has_bibliography && !scan.bibliography.is_empty();
    let mut completeness = 0.0;
    if has_bibliography {
        completeness += 0.5;
    }
    if !scan.in_text.is_empty() {
        completeness += 0.5;
    }
    card.record(
        "completeness",
        completeness,
        "Include both in-text citations and a references section.",
    );

    let items: Vec<&str> = if scan.bibliography.is_empty() {
        scan.in_text.iter().map(|(_, s)| s.as_str()).collect()
    } else {
        scan.bibliography.iter().map(String::as_str).collect()
    };
    let accuracy = if items.is_empty() {
        0.0
    } else {
        let valid = items
            .iter()
            .filter(|s| s.len() >= MIN_CITATION_LEN && year_re().is_match(s))
            .count();
        valid as f64 / items.len() as f64
    };
    card.record(
        "accuracy",
        accuracy,
        "Make sure every reference includes the author, title and publication year.",
    );

    let consistency = if scan.in_text.is_empty() {
        0.0
    } else {
        let mut by_style: BTreeMap<CitationStyle, usize> = BTreeMap::new();
        for (style, _) in &scan.in_text {
            *by_style.entry(*style).or_default() += 1;
        }
        let dominant = by_style.values().copied().max().unwrap_or(0);
        dominant as f64 / scan.in_text.len() as f64
    };
    card.record(
        "consistency",
        consistency,
        "Use a single citation style consistently throughout the document.",
    );
}
