//! Mock LLM 客户端（用于测试与无 Key 的本地运行）
//!
//! 按 LlmPolicy.stage 前缀匹配预置回复：同一阶段的多条回复依次消费，最后一条重复使用。
//! 未匹配的阶段返回默认回复（默认 "{}"，规划器会因此走回退计划）。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, LlmPolicy};
use crate::memory::{Message, Role};

type Scripted = Result<String, LlmError>;

struct StageScript {
    prefix: String,
    replies: VecDeque<Scripted>,
}

pub struct MockLlmClient {
    scripts: Mutex<Vec<StageScript>>,
    default_reply: Scripted,
    calls: AtomicUsize,
    /// (stage, 最后一条 user 消息)
    prompts: Mutex<Vec<(String, String)>>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(Vec::new()),
            default_reply: Ok("{}".to_string()),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// 为以 stage_prefix 开头的阶段追加一条回复
    pub fn with_reply(self, stage_prefix: impl Into<String>, reply: impl Into<String>) -> Self {
        self.push(stage_prefix.into(), Ok(reply.into()));
        self
    }

    pub fn with_error(self, stage_prefix: impl Into<String>, error: LlmError) -> Self {
        self.push(stage_prefix.into(), Err(error));
        self
    }

    pub fn with_default(mut self, reply: impl Into<String>) -> Self {
        self.default_reply = Ok(reply.into());
        self
    }

    fn push(&self, prefix: String, reply: Scripted) {
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        match scripts.iter_mut().find(|s| s.prefix == prefix) {
            Some(script) => script.replies.push_back(reply),
            None => scripts.push(StageScript {
                prefix,
                replies: VecDeque::from([reply]),
            }),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// 已收到的 (stage, prompt) 记录
    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn calls_for_stage(&self, stage_prefix: &str) -> usize {
        self.prompts()
            .iter()
            .filter(|(stage, _)| stage.starts_with(stage_prefix))
            .count()
    }

    fn next_reply(&self, stage: &str) -> Scripted {
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        // 最长前缀优先
        let script = scripts
            .iter_mut()
            .filter(|s| stage.starts_with(&s.prefix))
            .max_by_key(|s| s.prefix.len());
        match script {
            Some(s) if s.replies.len() > 1 => s.replies.pop_front().unwrap_or_else(|| self.default_reply.clone()),
            Some(s) => s.replies.front().cloned().unwrap_or_else(|| self.default_reply.clone()),
            None => self.default_reply.clone(),
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message], policy: &LlmPolicy) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((policy.stage.clone(), last_user));
        self.next_reply(&policy.stage)
    }
}
