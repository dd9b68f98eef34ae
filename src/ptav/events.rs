//! PTAV 过程事件：供调用方流式展示迭代进度

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PtavEvent {
    /// 新一轮迭代开始
    IterationStarted { iteration: usize, max_iterations: usize },
    /// 计划就绪
    PlanReady {
        stage: String,
        tool: Option<String>,
        fallback: bool,
    },
    /// 工具返回（观察预览）
    ToolResult {
        tool: Option<String>,
        success: bool,
        preview: String,
    },
    Validation {
        goal_achieved: bool,
        should_continue: bool,
        reason: String,
    },
    EarlyExit {
        pattern: String,
        reason: String,
        suggestion: String,
    },
    Finished { success: bool, iterations: usize },
}
