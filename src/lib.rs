//! Draftsmith - 内容生产工作流编排器
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、恢复策略、状态投影、优雅关闭
//! - **events**: 事件与恢复管理器（发布/订阅、恢复点、自动重试）
//! - **generation**: 生成适配器（按步骤构建提示词并调用 LLM）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **observability**: tracing 初始化
//! - **quality**: 质量评估器（文本统计 + 各步骤启发式评分）
//! - **workflow**: 状态机、副作用执行引擎、检查点

pub mod config;
pub mod core;
pub mod events;
pub mod generation;
pub mod llm;
pub mod observability;
pub mod quality;
pub mod workflow;

pub use workflow::{WorkflowCommand, WorkflowEngine};
