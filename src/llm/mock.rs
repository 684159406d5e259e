//! Mock LLM 客户端（用于测试与离线运行，无需 API）
//!
//! `MockLlmClient` 按提示词中的 `Step:` 行返回固定的样例文本；
//! `ScriptedLlmClient` 按顺序返回预设的结果，并记录调用次数。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, Message, Role};

const PLAN_SAMPLE: &str = "# Objective\n\n\
The goal of this document is to explain how small teams can adopt asynchronous writing. \
First, we define the audience and the purpose. Then we outline the structure of each section.\n\n\
## Structure\n\n\
- Introduction and context\n\
- Writing practices and tools\n\
- Review process and common pitfalls\n\n\
## Timeline and resources\n\n\
The timeline covers two weeks, with research in the first week. For example, we will use interviews and survey data as sources. \
Finally, the draft is reviewed by two editors.";

const DRAFT_SAMPLE: &str = "Small teams often struggle to keep everyone informed. However, asynchronous writing gives each person time to think before responding.\n\n\
For example, a short weekly update replaces a long status meeting. Research on distributed teams shows that written decisions are easier to revisit. \
Because the context is recorded, new members can catch up without interrupting anyone.\n\n\
In addition, clear documents reduce repeated questions. Therefore, teams spend less time in meetings and more time on focused work.";

const CITATION_SAMPLE: &str = "Small teams often struggle to keep everyone informed (Smith, 2020). \
Written decisions are easier to revisit (Lee & Park, 2019).\n\n\
## References\n\n\
Smith, J. (2020). Remote Work Patterns. Acme Press.\n\
Lee, K., & Park, S. (2019). Async Teams. Journal of Work, 4(2).";

const EDIT_SAMPLE: &str = "Small teams often struggle to keep everyone informed. \
Asynchronous writing gives each person time to think before responding. \
A short weekly update can replace a long status meeting, and written decisions are easier to revisit later.";

/// Mock 客户端：按步骤返回样例文本
#[derive(Debug, Default)]
pub struct MockLlmClient;

impl MockLlmClient {
    fn step_of(messages: &[Message]) -> Option<String> {
        messages
            .iter()
            .rev()
            .filter(|m| matches!(m.role, Role::User))
            .flat_map(|m| m.content.lines())
            .find_map(|line| line.strip_prefix("Step: ").map(|s| s.trim().to_string()))
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let text = match Self::step_of(messages).as_deref() {
            Some("planning") => PLAN_SAMPLE,
            Some("drafting") => DRAFT_SAMPLE,
            Some("citation") => CITATION_SAMPLE,
            Some("grammar") | Some("readability") => EDIT_SAMPLE,
            _ => DRAFT_SAMPLE,
        };
        Ok(text.to_string())
    }
}

/// 脚本化客户端：依次弹出预设结果，用尽后重复 `fallback`
#[derive(Debug)]
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: Result<String, LlmError>,
    calls: AtomicUsize,
}

impl ScriptedLlmClient {
    pub fn new(
        script: impl IntoIterator<Item = Result<String, LlmError>>,
        fallback: Result<String, LlmError>,
    ) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    /// 每次都返回相同结果
    pub fn always(result: Result<String, LlmError>) -> Self {
        Self::new(Vec::new(), result)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = match self.script.lock() {
            Ok(mut script) => script.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        };
        next.unwrap_or_else(|| self.fallback.clone())
    }
}
