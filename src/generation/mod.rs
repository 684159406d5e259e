//! 生成适配器：按步骤构建提示词并调用外部 AI 服务
//!
//! 适配器本身无状态，不做重试；重试由事件与恢复管理器决定。

pub mod prompts;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::error::GenerationError;
use crate::llm::{LlmClient, Message};
use crate::workflow::types::{Step, WorkflowConfig, WorkflowData};

/// 一次生成调用所需的上下文（由编排器从运行数据构建）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationContext {
    pub workflow_id: String,
    pub document_id: String,
    pub config: WorkflowConfig,
    /// 已接受的前序步骤内容
    pub prior_results: BTreeMap<Step, String>,
    /// 上一次质量检查的建议（带改进重新生成时非空）
    #[serde(default)]
    pub improvement_hints: Vec<String>,
    /// 本步骤第几次尝试（从 0 开始）
    #[serde(default)]
    pub attempt: u32,
    /// 调用级配置覆盖
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

impl GenerationContext {
    pub fn from_data(
        workflow_id: impl Into<String>,
        document_id: impl Into<String>,
        config: &WorkflowConfig,
        data: &WorkflowData,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            document_id: document_id.into(),
            config: config.clone(),
            prior_results: data.accepted_content(),
            improvement_hints: Vec::new(),
            attempt: 0,
            overrides: BTreeMap::new(),
        }
    }

    /// 该步骤应当加工的上一步内容：起草用规划，其余用最近一个已接受的结果
    pub fn prior_step_context(&self, step: Step) -> Option<&str> {
        self.prior_results
            .range(..step)
            .next_back()
            .map(|(_, content)| content.as_str())
    }
}

/// 发给 AI 服务的请求
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub step: Step,
    pub prompt: String,
    pub document_id: String,
    pub config: WorkflowConfig,
    pub prior_step_context: Option<String>,
}

/// 生成适配器
#[derive(Clone)]
pub struct GenerationAdapter {
    llm: Arc<dyn LlmClient>,
}

impl GenerationAdapter {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 后端累计 token 使用：(prompt, completion, total)
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    pub fn build_request(&self, step: Step, context: &GenerationContext) -> GenerationRequest {
        let prior = context.prior_step_context(step);
        let prompt = prompts::step_prompt(
            step,
            &context.document_id,
            &context.config,
            prior,
            &context.improvement_hints,
            &context.overrides,
        );
        GenerationRequest {
            step,
            prompt,
            document_id: context.document_id.clone(),
            config: context.config.clone(),
            prior_step_context: prior.map(String::from),
        }
    }

    /// 生成步骤内容；上游失败或空内容归为 ai_error，并保留上游消息
    pub async fn generate(
        &self,
        step: Step,
        context: &GenerationContext,
    ) -> Result<String, GenerationError> {
        let request = self.build_request(step, context);
        let messages = [
            Message::system(prompts::system_prompt(&request.config)),
            Message::user(request.prompt),
        ];

        tracing::debug!(
            workflow_id = %context.workflow_id,
            step = %step,
            attempt = context.attempt,
            "requesting generation"
        );

        let content = self
            .llm
            .complete(&messages)
            .await
            .map_err(|e| GenerationError::ai(e.to_string()))?;

        let content = content.trim();
        if content.is_empty() {
            return Err(GenerationError::ai("generation returned empty content"));
        }
        Ok(content.to_string())
    }
}
