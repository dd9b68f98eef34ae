//! 工具执行器
//!
//! execute(plan) 只执行计划中第一个 tool_call 步骤（每轮一次工具调用，之后交给验证器）；
//! invoke 供固定流水线模式直接按名调用。每次调用施加超时并输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::{AgentInput, ErrorKind, ToolError};
use crate::memory::{ContextUpdate, ResourcePool, StepKind};
use crate::ptav::{Plan, ACTION_TOOL_CALL};
use crate::tools::ToolRegistry;

/// 一次工具执行的结果
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// 实际执行的工具名（计划中没有可执行步骤时为 None）
    pub tool: Option<String>,
    pub success: bool,
    pub updates: Vec<ContextUpdate>,
    pub observations: Vec<String>,
    pub error: Option<ToolError>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    fn failure(tool: Option<String>, error: ToolError, duration_ms: u64) -> Self {
        Self {
            tool,
            success: false,
            updates: Vec::new(),
            observations: Vec::new(),
            error: Some(error),
            duration_ms,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 执行计划中的第一个 tool_call 步骤
    pub async fn execute(
        &self,
        plan: &Plan,
        input: &AgentInput,
        pool: &ResourcePool,
    ) -> ExecutionResult {
        match plan.steps.iter().find(|s| s.action == ACTION_TOOL_CALL) {
            Some(step) => self.invoke(&step.tool, &step.input, input, pool).await,
            None => ExecutionResult::failure(
                None,
                ToolError::invalid_input("计划中没有可执行的工具步骤"),
                0,
            ),
        }
    }

    /// 按名调用工具：提取本步上下文、施加超时、记录审计日志
    pub async fn invoke(
        &self,
        tool_name: &str,
        args: &Value,
        input: &AgentInput,
        pool: &ResourcePool,
    ) -> ExecutionResult {
        let start = Instant::now();
        let Some(tool) = self.registry.get(tool_name) else {
            return ExecutionResult::failure(
                Some(tool_name.to_string()),
                ToolError::invalid_input(format!("Unknown tool: {tool_name}")),
                0,
            );
        };

        let step_kind = tool.step_kind();
        let resources = pool.extract_for_step(step_kind);
        let result = timeout(self.timeout, tool.execute(args, input, &resources)).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let outcome = match &result {
            Ok(Ok(out)) if out.success => "ok",
            Ok(_) => "error",
            Err(_) => "timeout",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": outcome == "ok",
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview(args),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(out)) => {
                let error = match (&out.error, out.success) {
                    (None, false) => Some(ToolError::new(ErrorKind::Unknown, "工具返回失败但未给出原因")),
                    (e, _) => e.clone(),
                };
                let mut updates = out.updates;
                // 外部执行工具只返回 {"success": false, "error": ...} 时补齐执行失败记录
                let recorded = updates
                    .iter()
                    .any(|u| matches!(u, ContextUpdate::Execution { .. }));
                if step_kind == StepKind::SqlExecution && !out.success && !recorded {
                    updates.push(ContextUpdate::Execution {
                        success: false,
                        summary: None,
                        error: error.clone(),
                    });
                }
                ExecutionResult {
                    tool: Some(tool_name.to_string()),
                    success: out.success,
                    updates,
                    observations: out.observations,
                    error,
                    duration_ms,
                }
            }
            Ok(Err(e)) => ExecutionResult::failure(Some(tool_name.to_string()), e, duration_ms),
            Err(_) => ExecutionResult::failure(
                Some(tool_name.to_string()),
                ToolError::new(
                    ErrorKind::Timeout,
                    format!("工具 {tool_name} 执行超时（{}s）", self.timeout.as_secs()),
                ),
                duration_ms,
            ),
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
