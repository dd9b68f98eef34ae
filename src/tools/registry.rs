//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / step_kind / execute），由 ToolRegistry 按名注册与查找，
//! ToolExecutor 在调用时加超时并输出审计日志。
//!
//! 工具只拿到 AgentInput 与本步所需的 StepContext（见 ResourcePool::extract_for_step），
//! 产出的上下文一律以 ContextUpdate 返回，由编排层合并进 ResourcePool。

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::{AgentInput, ToolError};
use crate::memory::{ContextUpdate, StepContext, StepKind};

/// 单次工具调用的产出
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub success: bool,
    pub updates: Vec<ContextUpdate>,
    pub observations: Vec<String>,
    pub error: Option<ToolError>,
}

impl ToolOutput {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    /// 失败但仍可携带上下文更新（如 sql.execute 写回执行失败）
    pub fn failed(error: ToolError) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn with_update(mut self, update: ContextUpdate) -> Self {
        self.updates.push(update);
        self
    }

    pub fn with_observation(mut self, observation: impl Into<String>) -> Self {
        self.observations.push(observation.into());
        self
    }

    /// 归一化外部工具的无类型 JSON 输出：
    /// `{"success": bool, "context": {...}, "observations": [...], "error": "..."}`
    pub fn from_json(value: &Value) -> Result<Self, ToolError> {
        let obj = value
            .as_object()
            .ok_or_else(|| ToolError::invalid_input("工具输出必须是 JSON 对象"))?;

        let error = obj
            .get("error")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(ToolError::classified);
        let success = obj
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(error.is_none());

        let updates = match obj.get("context") {
            Some(Value::Object(map)) => {
                ContextUpdate::from_mapping(map).map_err(ToolError::invalid_input)?
            }
            Some(Value::Null) | None => Vec::new(),
            Some(_) => return Err(ToolError::invalid_input("context 必须是对象")),
        };

        let observations = match obj.get("observations") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| v.as_str().map(String::from).unwrap_or_else(|| v.to_string()))
                .collect(),
            Some(Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        };

        Ok(Self {
            success,
            updates,
            observations,
            error,
        })
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（计划中 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供规划器理解功能）
    fn description(&self) -> &str;

    /// 决定执行前从 ResourcePool 提取哪些字段
    fn step_kind(&self) -> StepKind;

    /// 参数 JSON Schema，默认无参数
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(
        &self,
        args: &Value,
        input: &AgentInput,
        resources: &StepContext,
    ) -> Result<ToolOutput, ToolError>;
}

type Handler =
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send>> + Send + Sync;

/// 以闭包接入的外部工具：参数为 `{"args": ..., "resources": ...}`，返回无类型 JSON，
/// 输出经 ToolOutput::from_json 归一化，错误字符串按关键词补打标签
pub struct FnTool {
    name: String,
    description: String,
    step_kind: StepKind,
    handler: Box<Handler>,
}

impl FnTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        step_kind: StepKind,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            step_kind,
            handler: Box::new(move |v| Box::pin(handler(v))),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn step_kind(&self) -> StepKind {
        self.step_kind
    }

    async fn execute(
        &self,
        args: &Value,
        _input: &AgentInput,
        resources: &StepContext,
    ) -> Result<ToolOutput, ToolError> {
        let payload = json!({
            "args": args,
            "resources": resources,
        });
        let raw = (self.handler)(payload).await.map_err(ToolError::classified)?;
        ToolOutput::from_json(&raw)
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    /// 同名工具后注册者覆盖先注册者
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::debug!(tool = %name, "tool overridden");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// (name, description) 列表，按名排序，用于规划 prompt
    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        let mut items: Vec<(String, String)> = self
            .tools
            .iter()
            .map(|(name, tool)| (name.clone(), tool.description().to_string()))
            .collect();
        items.sort();
        items
    }

    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .tool_names()
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "parameters": tool.parameters_schema()
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}
