//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock / 路由）实现 LlmClient。每次调用附带 LlmPolicy，
//! 由其说明调用阶段、复杂度与是否只要 JSON，路由与 Mock 都依据它做决策。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::OutputKind;
use crate::memory::Message;

/// 要求只输出 JSON 时附加的 system 指令
pub const JSON_ONLY_INSTRUCTION: &str =
    "你是报告数据助手。只输出一个 JSON 对象，不要输出 Markdown 代码块或任何解释文字。";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("LLM request timed out")]
    Timeout,

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Empty response from LLM")]
    EmptyResponse,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// 调用复杂度，路由器据此选模型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

/// 单次调用的策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmPolicy {
    /// 调用阶段，如 plan:template / sql_draft / sql_refine / finalize
    pub stage: String,
    pub complexity: Complexity,
    pub output_kind: OutputKind,
    pub user_id: String,
    pub json_only: bool,
}

impl LlmPolicy {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            complexity: Complexity::Medium,
            output_kind: OutputKind::Sql,
            user_id: "system".to_string(),
            json_only: true,
        }
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_output_kind(mut self, output_kind: OutputKind) -> Self {
        self.output_kind = output_kind;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn text(mut self) -> Self {
        self.json_only = false;
        self
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message], policy: &LlmPolicy) -> Result<String, LlmError>;

    /// 单轮调用：按策略补 system 指令后发送一条 user 消息
    async fn call(&self, prompt: &str, policy: &LlmPolicy) -> Result<String, LlmError> {
        let mut messages = Vec::with_capacity(2);
        if policy.json_only {
            messages.push(Message::system(JSON_ONLY_INSTRUCTION));
        }
        messages.push(Message::user(prompt));
        self.complete(&messages, policy).await
    }

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
