//! 多模型路由器
//!
//! 按 LlmPolicy 选模型：高复杂度阶段取推理能力最强的模型，低复杂度取最快的，
//! 其余按阶段类型（规划 / SQL 生成 / SQL 修复 / 收尾）综合质量、速度与成本。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::{Complexity, LlmClient, LlmError, LlmPolicy};
use crate::memory::Message;

/// 调用阶段类型（用于路由决策）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    Planning,
    SqlGeneration,
    SqlRepair,
    Finalize,
    Default,
}

/// 模型能力评级（0-100）
#[derive(Debug, Clone)]
pub struct ModelCapabilities {
    pub name: String,
    pub sql_score: u8,
    pub reasoning_score: u8,
    /// 越高越快
    pub speed_score: u8,
    /// 越高越便宜
    pub cost_score: u8,
}

impl ModelCapabilities {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_score: 50,
            reasoning_score: 50,
            speed_score: 50,
            cost_score: 50,
        }
    }

    pub fn with_sql(mut self, score: u8) -> Self {
        self.sql_score = score;
        self
    }

    pub fn with_reasoning(mut self, score: u8) -> Self {
        self.reasoning_score = score;
        self
    }

    pub fn with_speed(mut self, score: u8) -> Self {
        self.speed_score = score;
        self
    }

    pub fn with_cost(mut self, score: u8) -> Self {
        self.cost_score = score;
        self
    }

    fn quality_for(&self, task: TaskType) -> u16 {
        match task {
            TaskType::SqlGeneration | TaskType::SqlRepair => self.sql_score as u16,
            TaskType::Planning => self.reasoning_score as u16,
            _ => (self.sql_score as u16 + self.reasoning_score as u16) / 2,
        }
    }
}

pub struct TaskClassifier;

impl TaskClassifier {
    pub fn classify(policy: &LlmPolicy) -> TaskType {
        let stage = policy.stage.as_str();
        if stage.starts_with("plan") {
            TaskType::Planning
        } else if stage.starts_with("sql_draft") {
            TaskType::SqlGeneration
        } else if stage.starts_with("sql_refine") {
            TaskType::SqlRepair
        } else if stage.starts_with("finalize") {
            TaskType::Finalize
        } else {
            TaskType::Default
        }
    }
}

pub struct ModelRouter {
    models: Vec<(ModelCapabilities, Arc<dyn LlmClient>)>,
    /// 阶段类型到模型索引的固定路由
    task_routes: HashMap<TaskType, usize>,
    calls: AtomicUsize,
}

impl Default for ModelRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRouter {
    pub fn new() -> Self {
        Self {
            models: Vec::new(),
            task_routes: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn add_model(&mut self, capabilities: ModelCapabilities, client: Arc<dyn LlmClient>) {
        self.models.push((capabilities, client));
    }

    pub fn set_task_route(&mut self, task: TaskType, model_index: usize) {
        self.task_routes.insert(task, model_index);
    }

    /// 返回选中模型的索引
    pub fn select_index(&self, policy: &LlmPolicy) -> Option<usize> {
        let task = TaskClassifier::classify(policy);
        if let Some(&index) = self.task_routes.get(&task) {
            if index < self.models.len() {
                return Some(index);
            }
        }

        let scored = self.models.iter().enumerate();
        match policy.complexity {
            Complexity::High => scored
                .max_by_key(|(_, (cap, _))| cap.reasoning_score)
                .map(|(i, _)| i),
            Complexity::Low => scored
                .max_by_key(|(_, (cap, _))| cap.speed_score)
                .map(|(i, _)| i),
            Complexity::Medium => scored
                .max_by_key(|(_, (cap, _))| {
                    cap.quality_for(task) + cap.speed_score as u16 / 2 + cap.cost_score as u16 / 2
                })
                .map(|(i, _)| i),
        }
    }

    pub fn model_name(&self, index: usize) -> Option<&str> {
        self.models.get(index).map(|(cap, _)| cap.name.as_str())
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

/// 路由型 LLM 客户端
pub struct RoutingLlmClient {
    router: ModelRouter,
}

impl RoutingLlmClient {
    pub fn new(router: ModelRouter) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }
}

#[async_trait]
impl LlmClient for RoutingLlmClient {
    async fn complete(&self, messages: &[Message], policy: &LlmPolicy) -> Result<String, LlmError> {
        let index = self
            .router
            .select_index(policy)
            .ok_or_else(|| LlmError::ApiError("No model available".to_string()))?;
        let (cap, client) = &self.router.models[index];
        tracing::debug!(stage = %policy.stage, model = %cap.name, "routed llm call");
        self.router.calls.fetch_add(1, Ordering::Relaxed);
        client.complete(messages, policy).await
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.router
            .models
            .iter()
            .map(|(_, client)| client.token_usage())
            .fold((0, 0, 0), |acc, (a, b, c)| (acc.0 + a, acc.1 + b, acc.2 + c))
    }
}
