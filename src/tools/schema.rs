//! 计划 JSON Schema 生成（schemars）
//!
//! 将合法计划的 JSON 结构注入规划 prompt，减少 LLM 输出格式错误。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 计划格式：与 ptav::parse_plan 接受的主格式一致（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct PlanFormat {
    /// 对当前状态的判断
    pub thought: String,
    /// 步骤列表；每轮只执行第一个 tool_call
    pub steps: Vec<PlanStepFormat>,
    /// 本轮预期达成的结果
    pub expected_outcome: String,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
struct PlanStepFormat {
    /// 固定为 tool_call
    pub action: String,
    /// 工具名，如 schema.list_columns、sql.draft、sql.validate
    pub tool: String,
    pub reason: String,
    /// 工具参数
    pub input: Option<Value>,
}

/// 返回计划的 JSON Schema 字符串，可拼入规划 prompt
pub fn plan_schema_json() -> String {
    let schema = schema_for!(PlanFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
