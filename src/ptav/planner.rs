//! Planner：按阶段白名单决定下一步工具调用
//!
//! 推断执行阶段（模板 / 任务执行 / 图表生成），阶段决定 LLM 可见的工具白名单；
//! LLM 输出解析失败或计划非法时，回退到按 ContextMemory 推进的确定性计划，保证总有下一步。

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{AgentError, AgentInput, OutputKind};
use crate::llm::{extract_json_object, Complexity, LlmClient, LlmPolicy};
use crate::memory::ContextMemory;
use crate::tools::{plan_schema_json, ToolRegistry};

/// 计划步骤中唯一合法的 action
pub const ACTION_TOOL_CALL: &str = "tool_call";

const TEMPLATE_TOOLS: &[&str] = &[
    "schema.list_tables",
    "schema.list_columns",
    "time.window",
    "sql.draft",
    "sql.refine",
    "sql.validate",
    "sql.execute",
];

const TASK_TOOLS: &[&str] = &[
    "schema.list_tables",
    "schema.list_columns",
    "time.window",
    "sql.draft",
    "sql.refine",
    "sql.validate",
    "sql.policy",
    "sql.execute",
];

const CHART_TOOLS: &[&str] = &[
    "schema.list_tables",
    "schema.list_columns",
    "time.window",
    "sql.draft",
    "sql.refine",
    "sql.validate",
    "sql.execute",
    "data.quality",
    "chart.spec",
    "word_chart_generator",
];

/// 执行阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Template,
    TaskExecution,
    ChartGeneration,
}

impl Stage {
    /// 图表产物优先；其次有任务驱动上下文即为任务执行阶段
    pub fn infer(input: &AgentInput) -> Self {
        if input.constraints.output_kind == OutputKind::Chart {
            Stage::ChartGeneration
        } else if !input.task_driven_context.is_empty() {
            Stage::TaskExecution
        } else {
            Stage::Template
        }
    }

    pub fn whitelist(self) -> &'static [&'static str] {
        match self {
            Stage::Template => TEMPLATE_TOOLS,
            Stage::TaskExecution => TASK_TOOLS,
            Stage::ChartGeneration => CHART_TOOLS,
        }
    }

    pub fn allows(self, tool: &str) -> bool {
        self.whitelist().contains(&tool)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Template => "template",
            Stage::TaskExecution => "task_execution",
            Stage::ChartGeneration => "chart_generation",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub action: String,
    pub tool: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub input: Value,
}

impl PlanStep {
    pub fn tool_call(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action: ACTION_TOOL_CALL.to_string(),
            tool: tool.into(),
            reason: reason.into(),
            input: Value::Object(Default::default()),
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }
}

/// 单轮计划：由规划器产出，执行器只消费第一个 tool_call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub thought: String,
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub expected_outcome: String,
}

impl Plan {
    pub fn first_tool(&self) -> Option<&str> {
        self.steps
            .iter()
            .find(|s| s.action == ACTION_TOOL_CALL)
            .map(|s| s.tool.as_str())
    }
}

/// 计划来源
#[derive(Debug, Clone, PartialEq)]
pub enum PlanSource {
    Llm,
    Fallback { reason: String },
}

impl PlanSource {
    pub fn is_fallback(&self) -> bool {
        matches!(self, PlanSource::Fallback { .. })
    }
}

#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan: Plan,
    pub stage: Stage,
    pub source: PlanSource,
}

/// 解析 LLM 输出为 Plan：接受 steps 数组、tool_calls 数组，或单个 {"tool", "args"}
pub fn parse_plan(output: &str) -> Result<Plan, AgentError> {
    let value = extract_json_object(output).ok_or_else(|| {
        AgentError::JsonParseError(format!("no JSON object in: {}", preview(output, 120)))
    })?;

    let thought = str_field(&value, "thought");
    let expected_outcome = str_field(&value, "expected_outcome");

    let steps = if let Some(steps) = value.get("steps").and_then(Value::as_array) {
        steps.iter().map(step_from_value).collect::<Result<Vec<_>, _>>()?
    } else if let Some(calls) = value.get("tool_calls").and_then(Value::as_array) {
        calls.iter().map(step_from_value).collect::<Result<Vec<_>, _>>()?
    } else if value.get("tool").is_some() {
        vec![step_from_value(&value)?]
    } else {
        return Err(AgentError::JsonParseError(
            "plan has neither steps nor tool_calls".to_string(),
        ));
    };

    Ok(Plan {
        thought,
        steps,
        expected_outcome,
    })
}

fn step_from_value(value: &Value) -> Result<PlanStep, AgentError> {
    // tool_calls 常见形态：{"tool"|"name", "args"|"input"|"arguments"}
    let tool = value
        .get("tool")
        .or_else(|| value.get("name"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AgentError::JsonParseError("step without tool name".to_string()))?;
    let action = value
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or(ACTION_TOOL_CALL);
    let input = ["input", "args", "arguments"]
        .iter()
        .find_map(|k| value.get(*k))
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));
    Ok(PlanStep {
        action: action.to_string(),
        tool: tool.to_string(),
        reason: str_field(value, "reason"),
        input,
    })
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// 校验计划：非空、action 均为 tool_call、工具都在阶段白名单内
pub fn validate_plan(plan: &Plan, stage: Stage) -> Result<(), AgentError> {
    if plan.steps.is_empty() {
        return Err(AgentError::InvalidPlan("invalid_plan: no steps".to_string()));
    }
    for step in &plan.steps {
        if step.action != ACTION_TOOL_CALL {
            return Err(AgentError::InvalidPlan(format!(
                "invalid_plan: unsupported action '{}'",
                step.action
            )));
        }
        if !stage.allows(&step.tool) {
            return Err(AgentError::InvalidPlan(format!(
                "invalid_plan: tool '{}' not allowed in {} stage",
                step.tool, stage
            )));
        }
    }
    Ok(())
}

/// 确定性回退计划：按 ContextMemory 选出阶段内第一个可用的下一步
///
/// `available` 为已注册工具；候选工具未注册时跳过，全部不可用时返回空计划。
pub fn fallback_plan(stage: Stage, memory: &ContextMemory, available: &[String]) -> Plan {
    let usable = |tool: &str| stage.allows(tool) && available.iter().any(|a| a == tool);

    let mut candidates: Vec<(&str, &str)> = Vec::new();
    if memory.time_range.is_none() {
        candidates.push(("time.window", "确定报告时间窗口"));
    }
    if !memory.schema_available {
        candidates.push(("schema.list_columns", "获取表结构"));
        candidates.push(("schema.list_tables", "获取表列表"));
    }
    if !memory.has_sql {
        candidates.push(("sql.draft", "根据占位符与表结构生成 SQL"));
    } else if !memory.sql_validated {
        if memory.pending_issues > 0 {
            candidates.push(("sql.refine", "根据校验问题修复 SQL"));
        }
        candidates.push(("sql.validate", "校验当前 SQL"));
    } else if !memory.sql_executed_successfully {
        candidates.push(("sql.execute", "执行已校验的 SQL"));
    } else if stage == Stage::ChartGeneration {
        if !memory.has_chart_spec {
            candidates.push(("chart.spec", "根据查询结果生成图表规格"));
        }
        candidates.push(("word_chart_generator", "生成图表文件"));
    } else {
        candidates.push(("sql.refine", "查询无数据，调整 SQL"));
    }

    let steps: Vec<PlanStep> = candidates
        .into_iter()
        .filter(|(tool, _)| usable(tool))
        .take(1)
        .map(|(tool, reason)| PlanStep::tool_call(tool, reason))
        .collect();

    Plan {
        thought: format!("回退计划（{} 阶段）", stage),
        expected_outcome: steps
            .first()
            .map(|s| s.reason.clone())
            .unwrap_or_default(),
        steps,
    }
}

/// 规划器：持有 LLM，generate_plan 负责 prompt 构造、解析、校验与回退
pub struct Planner {
    llm: Arc<dyn LlmClient>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.llm
    }

    /// 生成下一步计划；只有回退计划也不可用（其工具未注册）时返回错误
    pub async fn generate_plan(
        &self,
        input: &AgentInput,
        registry: &ToolRegistry,
    ) -> Result<PlanOutcome, AgentError> {
        let stage = Stage::infer(input);
        let available = registry.tool_names();
        let visible: Vec<(String, String)> = registry
            .tool_descriptions()
            .into_iter()
            .filter(|(name, _)| stage.allows(name))
            .collect();

        let prompt = build_prompt(input, stage, &visible);
        let policy = LlmPolicy::new(format!("plan:{}", stage))
            .with_complexity(Complexity::Medium)
            .with_output_kind(input.constraints.output_kind)
            .with_user(input.user_id.clone());

        let attempt = match self.llm.call(&prompt, &policy).await {
            Ok(text) => parse_plan(&text).and_then(|plan| {
                validate_plan(&plan, stage)?;
                match plan.first_tool() {
                    Some(tool) if !available.iter().any(|a| a == tool) => Err(
                        AgentError::InvalidPlan(format!("invalid_plan: tool '{tool}' not registered")),
                    ),
                    _ => Ok(plan),
                }
            }),
            Err(e) => Err(AgentError::LlmError(e)),
        };

        match attempt {
            Ok(plan) => {
                tracing::debug!(stage = %stage, tool = ?plan.first_tool(), "llm plan accepted");
                Ok(PlanOutcome {
                    plan,
                    stage,
                    source: PlanSource::Llm,
                })
            }
            Err(e) => {
                let reason = e.to_string();
                let plan = fallback_plan(stage, &input.context_memory, &available);
                if plan.steps.is_empty() {
                    return Err(AgentError::PlanningFailed(format!(
                        "no applicable fallback in {stage} stage after: {reason}"
                    )));
                }
                tracing::warn!(stage = %stage, error = %reason, tool = ?plan.first_tool(), "using fallback plan");
                Ok(PlanOutcome {
                    plan,
                    stage,
                    source: PlanSource::Fallback { reason },
                })
            }
        }
    }
}

fn build_prompt(input: &AgentInput, stage: Stage, tools: &[(String, String)]) -> String {
    let tool_lines: Vec<String> = tools
        .iter()
        .map(|(name, desc)| format!("- {name}: {desc}"))
        .collect();
    let mut sections = vec![
        format!("你是报告占位符 SQL 生成代理的规划器，当前阶段：{stage}。"),
        format!("## 任务\n{}", input.goal()),
    ];
    if let Some(semantic) = &input.placeholder.semantic_type {
        sections.push(format!("语义类型: {semantic}"));
    }
    if let Some(granularity) = &input.placeholder.granularity {
        sections.push(format!("时间粒度: {granularity}"));
    }
    sections.push(input.context_memory.to_prompt_section());
    sections.push(format!("## 可用工具\n{}", tool_lines.join("\n")));
    sections.push(format!(
        "## 输出要求\n每轮只规划一个工具调用，只输出一个 JSON 对象，格式如下：\n{}",
        plan_schema_json()
    ));
    sections.join("\n\n")
}

fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PlaceholderSpec;
    use crate::llm::MockLlmClient;
    use serde_json::json;

    fn names(tools: &[&str]) -> Vec<String> {
        tools.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_stage_inference() {
        let base = AgentInput::new("x", PlaceholderSpec::new("p", "统计本月销售额"));
        assert_eq!(Stage::infer(&base), Stage::Template);
        let task = base.clone().with_task_driven("business_requirement", json!("按区域"));
        assert_eq!(Stage::infer(&task), Stage::TaskExecution);
        let chart = task.with_output_kind(OutputKind::Chart);
        assert_eq!(Stage::infer(&chart), Stage::ChartGeneration);
    }

    #[test]
    fn test_parse_steps_and_tool_calls() {
        let plan = parse_plan(
            r#"```json
{"thought": "需要表结构", "steps": [{"action": "tool_call", "tool": "schema.list_columns", "reason": "r", "input": {"tables": ["sales"]}}], "expected_outcome": "列信息"}
```"#,
        )
        .unwrap();
        assert_eq!(plan.first_tool(), Some("schema.list_columns"));
        assert_eq!(plan.steps[0].input["tables"][0], "sales");

        let plan = parse_plan(r#"{"tool_calls": [{"name": "sql.draft", "arguments": {}}]}"#).unwrap();
        assert_eq!(plan.steps[0].action, ACTION_TOOL_CALL);
        assert_eq!(plan.first_tool(), Some("sql.draft"));

        let plan = parse_plan(r#"{"tool": "sql.validate", "args": {}}"#).unwrap();
        assert_eq!(plan.first_tool(), Some("sql.validate"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_plan("我觉得应该先看表"), Err(AgentError::JsonParseError(_))));
        assert!(parse_plan(r#"{"answer": 1}"#).is_err());
    }

    #[test]
    fn test_validate_plan_whitelist() {
        let plan = Plan {
            steps: vec![PlanStep::tool_call("chart.spec", "")],
            ..Plan::default()
        };
        let err = validate_plan(&plan, Stage::Template).unwrap_err();
        assert!(err.to_string().starts_with("invalid_plan"));
        assert!(validate_plan(&plan, Stage::ChartGeneration).is_ok());

        let bad_action = Plan {
            steps: vec![PlanStep {
                action: "finalize".into(),
                ..PlanStep::tool_call("sql.draft", "")
            }],
            ..Plan::default()
        };
        assert!(validate_plan(&bad_action, Stage::Template).is_err());
        assert!(validate_plan(&Plan::default(), Stage::Template).is_err());
    }

    #[test]
    fn test_fallback_progression() {
        let all = names(CHART_TOOLS);
        let mut m = ContextMemory::default();
        let first = |m: &ContextMemory, stage| {
            fallback_plan(stage, m, &all).first_tool().map(str::to_string)
        };

        assert_eq!(first(&m, Stage::Template).as_deref(), Some("time.window"));
        m.time_range = Some("本月".into());
        assert_eq!(first(&m, Stage::Template).as_deref(), Some("schema.list_columns"));
        m.schema_available = true;
        assert_eq!(first(&m, Stage::Template).as_deref(), Some("sql.draft"));
        m.has_sql = true;
        assert_eq!(first(&m, Stage::Template).as_deref(), Some("sql.validate"));
        m.pending_issues = 1;
        assert_eq!(first(&m, Stage::Template).as_deref(), Some("sql.refine"));
        m.pending_issues = 0;
        m.sql_validated = true;
        assert_eq!(first(&m, Stage::Template).as_deref(), Some("sql.execute"));
        m.sql_executed_successfully = true;
        assert_eq!(first(&m, Stage::ChartGeneration).as_deref(), Some("chart.spec"));
        m.has_chart_spec = true;
        assert_eq!(
            first(&m, Stage::ChartGeneration).as_deref(),
            Some("word_chart_generator")
        );
    }

    #[test]
    fn test_fallback_skips_unregistered_tools() {
        let available = names(&["time.window", "sql.draft", "sql.validate"]);
        let m = ContextMemory {
            time_range: Some("本月".into()),
            ..ContextMemory::default()
        };
        // 没有 schema 工具时直接起草
        let plan = fallback_plan(Stage::Template, &m, &available);
        assert_eq!(plan.first_tool(), Some("sql.draft"));

        let plan = fallback_plan(Stage::Template, &m, &[]);
        assert!(plan.steps.is_empty());
    }

    #[tokio::test]
    async fn test_generate_plan_falls_back_on_garbage() {
        let llm = Arc::new(MockLlmClient::new().with_reply("plan", "好的，我先看看表结构。"));
        let planner = Planner::new(llm);
        let mut registry = ToolRegistry::new();
        registry.register(crate::tools::TimeWindowTool);
        let input = AgentInput::new("x", PlaceholderSpec::new("p", "统计本月销售额"));

        let outcome = planner.generate_plan(&input, &registry).await.unwrap();
        assert!(outcome.source.is_fallback());
        assert_eq!(outcome.plan.first_tool(), Some("time.window"));
    }

    /// 注册三个阶段白名单中的全部工具
    fn full_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for name in CHART_TOOLS.iter().chain(TASK_TOOLS) {
            registry.register(crate::tools::FnTool::new(
                *name,
                "stub",
                crate::memory::StepKind::SqlGeneration,
                |_| async { Ok::<Value, String>(json!({})) },
            ));
        }
        registry
    }

    fn memory_states() -> Vec<ContextMemory> {
        let fresh = ContextMemory::default();
        let timed = ContextMemory {
            time_range: Some("本月".into()),
            schema_available: true,
            ..fresh.clone()
        };
        let drafted = ContextMemory {
            has_sql: true,
            pending_issues: 2,
            ..timed.clone()
        };
        let validated = ContextMemory {
            pending_issues: 0,
            sql_validated: true,
            ..drafted.clone()
        };
        let executed = ContextMemory {
            sql_executed_successfully: true,
            ..validated.clone()
        };
        vec![fresh, timed, drafted, validated, executed]
    }

    #[tokio::test]
    async fn test_garbage_output_always_yields_whitelisted_fallback() {
        let garbage = [
            "好的，我先看看表结构。",
            r#"{"answer": 1}"#,
            r#"{"steps": []}"#,
            r#"{"tool": "shell.exec"}"#,
            r#"{"tool_calls": [{"name": "chart.spec"}, {"name": "rm -rf"}]}"#,
            r#"{"steps": [{"action": "finalize", "tool": "sql.draft"}]}"#,
        ];
        let registry = full_registry();
        let base = AgentInput::new("x", PlaceholderSpec::new("p", "统计本月销售额"));
        let inputs = [
            (Stage::Template, base.clone()),
            (
                Stage::TaskExecution,
                base.clone().with_task_driven("business_requirement", json!("按区域")),
            ),
            (Stage::ChartGeneration, base.clone().with_output_kind(OutputKind::Chart)),
        ];

        for reply in garbage {
            let planner = Planner::new(Arc::new(MockLlmClient::new().with_reply("plan", reply)));
            for (stage, input) in &inputs {
                for memory in memory_states() {
                    let input = AgentInput {
                        context_memory: memory.clone(),
                        ..input.clone()
                    };
                    let outcome = planner.generate_plan(&input, &registry).await.unwrap();
                    assert_eq!(outcome.stage, *stage);
                    assert!(outcome.source.is_fallback(), "{reply} accepted in {stage}");
                    assert!(!outcome.plan.steps.is_empty(), "{reply} / {stage} / {memory:?}");
                    for step in &outcome.plan.steps {
                        assert!(
                            stage.whitelist().contains(&step.tool.as_str()),
                            "{} not allowed in {stage}",
                            step.tool
                        );
                        assert_eq!(step.action, ACTION_TOOL_CALL);
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_generate_plan_accepts_tool_calls_array() {
        let llm = Arc::new(MockLlmClient::new().with_reply(
            "plan",
            r#"{"tool_calls": [{"name": "sql.draft", "arguments": {"hint": "按区域汇总"}}, {"name": "sql.validate"}]}"#,
        ));
        let planner = Planner::new(llm);
        let input = AgentInput::new("x", PlaceholderSpec::new("p", "统计本月销售额"));

        let outcome = planner.generate_plan(&input, &full_registry()).await.unwrap();
        assert_eq!(outcome.source, PlanSource::Llm);
        assert_eq!(outcome.plan.first_tool(), Some("sql.draft"));
        assert_eq!(outcome.plan.steps.len(), 2);
        assert_eq!(outcome.plan.steps[0].input["hint"], "按区域汇总");
        assert!(outcome
            .plan
            .steps
            .iter()
            .all(|s| Stage::Template.allows(&s.tool)));
    }

    #[tokio::test]
    async fn test_generate_plan_uses_valid_llm_plan() {
        let llm = Arc::new(MockLlmClient::new().with_reply(
            "plan:template",
            r#"{"thought": "t", "steps": [{"action": "tool_call", "tool": "time.window", "reason": "r", "input": {"range": "上月"}}], "expected_outcome": "e"}"#,
        ));
        let planner = Planner::new(llm.clone());
        let mut registry = ToolRegistry::new();
        registry.register(crate::tools::TimeWindowTool);
        let input = AgentInput::new("x", PlaceholderSpec::new("p", "统计上月销售额"));

        let outcome = planner.generate_plan(&input, &registry).await.unwrap();
        assert_eq!(outcome.source, PlanSource::Llm);
        assert_eq!(outcome.plan.steps[0].input["range"], "上月");
        let (stage, prompt) = &llm.prompts()[0];
        assert_eq!(stage, "plan:template");
        assert!(prompt.contains("time.window"));
        assert!(prompt.contains("## 当前状态"));
    }

    #[tokio::test]
    async fn test_generate_plan_fails_without_applicable_fallback() {
        let planner = Planner::new(Arc::new(MockLlmClient::new()));
        let input = AgentInput::new("x", PlaceholderSpec::new("p", "统计本月销售额"));
        let err = planner
            .generate_plan(&input, &ToolRegistry::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::PlanningFailed(_)));
    }
}
