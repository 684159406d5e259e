//! 按步骤构建提示词
//!
//! 每个提示词都以 `Step: <name>` 开头，之后是文档与运行配置，再嵌入上一步的产出。

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::workflow::types::{AssistanceLevel, Step, WorkflowConfig, WritingStyle};

fn style_hint(style: WritingStyle) -> &'static str {
    match style {
        WritingStyle::Academic => "academic: precise, formal, evidence-driven",
        WritingStyle::Professional => "professional: clear, direct, business-appropriate",
        WritingStyle::Casual => "casual: friendly, conversational, plain words",
        WritingStyle::Creative => "creative: vivid, engaging, varied rhythm",
    }
}

fn assistance_hint(level: AssistanceLevel) -> &'static str {
    match level {
        AssistanceLevel::Minimal => "make only the changes that are strictly necessary",
        AssistanceLevel::Moderate => "improve the text where it clearly helps the reader",
        AssistanceLevel::Extensive => "rework the text freely to reach the best result",
    }
}

/// 系统提示：写作角色与风格
pub fn system_prompt(config: &WorkflowConfig) -> String {
    format!(
        "You are an experienced writing assistant working inside a content production pipeline. \
         Write in a {} style and {}. Return only the requested text, without commentary.",
        style_hint(config.style),
        assistance_hint(config.assistance_level)
    )
}

fn step_instruction(step: Step, config: &WorkflowConfig) -> String {
    match step {
        Step::Planning => {
            let mut s = format!(
                "Create a writing plan for a document of about {} words. \
                 State the objective, the section structure, a timeline and the resources needed.",
                config.target_length
            );
            if config.include_research {
                s.push_str(" List the research questions to investigate before drafting.");
            }
            s
        }
        Step::Drafting => format!(
            "Write the full draft (about {} words) following the plan below. \
             Use paragraphs, transitions and concrete examples.",
            config.target_length
        ),
        Step::Citation => "Add in-text citations in a single consistent style (for example APA) to the draft below \
             and append a References section listing every source with its publication year."
            .to_string(),
        Step::Grammar => "Proofread the text below. Fix grammar, spelling and punctuation, keep tense and person consistent, \
             and split sentences longer than 30 words."
            .to_string(),
        Step::Readability => "Improve the readability of the text below. Prefer short sentences, active voice \
             and clear transitions, and keep the meaning and any citations intact."
            .to_string(),
    }
}

/// 用户提示：步骤说明 + 上一步内容 + 改进建议 + 调用级覆盖
pub fn step_prompt(
    step: Step,
    document_id: &str,
    config: &WorkflowConfig,
    prior_step_context: Option<&str>,
    improvement_hints: &[String],
    overrides: &BTreeMap<String, String>,
) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Step: {}", step);
    let _ = writeln!(prompt, "Document: {}", document_id);
    if let Some(topic) = config.topic.as_deref().filter(|t| !t.trim().is_empty()) {
        let _ = writeln!(prompt, "Topic: {}", topic.trim());
    }
    let _ = writeln!(prompt, "Target length: {} words", config.target_length);
    prompt.push('\n');
    prompt.push_str(&step_instruction(step, config));
    prompt.push('\n');

    if let Some(prior) = prior_step_context {
        let label = match step {
            Step::Drafting => "Plan",
            _ => "Current text",
        };
        let _ = write!(prompt, "\n{}:\n{}\n", label, prior);
    }

    if !improvement_hints.is_empty() {
        prompt.push_str("\nThe previous attempt did not pass review. Address these issues:\n");
        for hint in improvement_hints {
            let _ = writeln!(prompt, "- {}", hint);
        }
    }

    for (key, value) in overrides {
        let _ = writeln!(prompt, "Override {}: {}", key, value);
    }

    prompt
}
