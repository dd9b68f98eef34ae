//! 输入 / 输出类型：AgentInput、AgentOutput 与执行模式
//!
//! AgentInput 在一轮迭代内只读；迭代之间由编排器整体替换（enriched），从不原地修改。

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::memory::ContextMemory;

/// 期望产物类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    #[default]
    Sql,
    Chart,
}

/// 编排模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Plan → Tool → Observe → Finalize，单次
    Ptof,
    /// Plan → Tool → Active → Validate，迭代
    Ptav,
    /// 固定三步校验（时间窗口 → schema 确认 → SQL 校验），至多修正一次
    TaskSqlValidation,
    /// 固定流水线（质量 → 图表规格 → 渲染）
    ReportChartGeneration,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Ptof => "ptof",
            ExecutionMode::Ptav => "ptav",
            ExecutionMode::TaskSqlValidation => "task_sql_validation",
            ExecutionMode::ReportChartGeneration => "report_chart_generation",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ptof" => Ok(ExecutionMode::Ptof),
            "ptav" => Ok(ExecutionMode::Ptav),
            "task_sql_validation" => Ok(ExecutionMode::TaskSqlValidation),
            "report_chart_generation" => Ok(ExecutionMode::ReportChartGeneration),
            other => Err(format!("unknown execution mode: {other}")),
        }
    }
}

/// 占位符描述
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaceholderSpec {
    pub id: String,
    pub description: String,
    /// 语义类型：统计 / 趋势 / 排名 / 占比 等
    pub semantic_type: Option<String>,
    /// 时间粒度：day / week / month ...
    pub granularity: Option<String>,
}

impl PlaceholderSpec {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            semantic_type: None,
            granularity: None,
        }
    }

    pub fn with_semantic_type(mut self, semantic_type: impl Into<String>) -> Self {
        self.semantic_type = Some(semantic_type.into());
        self
    }

    pub fn with_granularity(mut self, granularity: impl Into<String>) -> Self {
        self.granularity = Some(granularity.into());
        self
    }
}

/// 调用方提供的 schema：表名有序集合 + 表到列名的映射
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub tables: Vec<String>,
    pub columns: BTreeMap<String, Vec<String>>,
}

impl SchemaInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table<I, S>(mut self, table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let table = table.into();
        if !self.tables.iter().any(|t| t == &table) {
            self.tables.push(table.clone());
        }
        let entry = self.columns.entry(table).or_default();
        for column in columns {
            let column = column.into();
            if !entry.contains(&column) {
                entry.push(column);
            }
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.iter().any(|t| t.eq_ignore_ascii_case(table))
    }
}

/// 报告时间窗口（闭区间）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// 窗口描述，如 "本月" / "昨日"
    pub label: String,
}

impl TimeWindow {
    pub fn new(start: NaiveDate, end: NaiveDate, label: impl Into<String>) -> Self {
        Self {
            start,
            end,
            label: label.into(),
        }
    }

    /// 将 SQL 中的 {{start_date}} / {{end_date}} 替换为窗口边界
    pub fn render_sql(&self, sql: &str) -> String {
        sql.replace("{{start_date}}", &self.start.format("%Y-%m-%d").to_string())
            .replace("{{end_date}}", &self.end.format("%Y-%m-%d").to_string())
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ~ {} ({})",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d"),
            self.label
        )
    }
}

/// 任务上下文：时区、cron、时间窗口、数据范围
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub timezone: String,
    pub cron_expression: String,
    pub time_window: Option<TimeWindow>,
    /// day / week / month / quarter / year / 本月 / 上月 ...
    pub data_range: Option<String>,
}

impl Default for TaskContext {
    fn default() -> Self {
        Self {
            timezone: crate::config::default_timezone(),
            cron_expression: crate::config::default_cron(),
            time_window: None,
            data_range: None,
        }
    }
}

/// 约束：产物类型、最大修复次数、行数策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    pub output_kind: OutputKind,
    pub max_attempts: u32,
    pub row_limit: Option<usize>,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            output_kind: OutputKind::Sql,
            max_attempts: 3,
            row_limit: None,
        }
    }
}

/// 单次请求的输入
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInput {
    pub user_prompt: String,
    pub placeholder: PlaceholderSpec,
    pub schema: SchemaInfo,
    pub task_context: TaskContext,
    pub constraints: Constraints,
    /// 任务驱动上下文（模板片段、业务需求、已有 SQL 等）
    #[serde(default)]
    pub task_driven_context: Map<String, Value>,
    pub user_id: String,
    /// 上一轮迭代后的压缩状态，由编排器填充
    #[serde(default)]
    pub context_memory: ContextMemory,
}

impl AgentInput {
    pub fn new(user_prompt: impl Into<String>, placeholder: PlaceholderSpec) -> Self {
        Self {
            user_prompt: user_prompt.into(),
            placeholder,
            schema: SchemaInfo::default(),
            task_context: TaskContext::default(),
            constraints: Constraints::default(),
            task_driven_context: Map::new(),
            user_id: "system".to_string(),
            context_memory: ContextMemory::default(),
        }
    }

    pub fn with_schema(mut self, schema: SchemaInfo) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_task_context(mut self, task_context: TaskContext) -> Self {
        self.task_context = task_context;
        self
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_output_kind(mut self, output_kind: OutputKind) -> Self {
        self.constraints.output_kind = output_kind;
        self
    }

    pub fn with_task_driven(mut self, key: impl Into<String>, value: Value) -> Self {
        self.task_driven_context.insert(key.into(), value);
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    /// 任务目标：优先占位符描述，其次用户提示
    pub fn goal(&self) -> &str {
        if self.placeholder.description.trim().is_empty() {
            &self.user_prompt
        } else {
            &self.placeholder.description
        }
    }

    /// 调用方随任务携带的待校验 SQL（task_driven_context.current_sql / sql）
    pub fn provided_sql(&self) -> Option<&str> {
        ["current_sql", "sql"]
            .iter()
            .filter_map(|k| self.task_driven_context.get(*k))
            .filter_map(|v| v.as_str())
            .map(str::trim)
            .find(|s| !s.is_empty())
    }

    /// 迭代之间的函数式替换：带上新的 ContextMemory 与富化后的 schema
    pub fn enriched(&self, context_memory: ContextMemory, schema: SchemaInfo) -> Self {
        Self {
            schema,
            context_memory,
            ..self.clone()
        }
    }
}

/// 终态输出：success、result（SQL 或图表路径）、metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub success: bool,
    pub result: String,
    pub metadata: Map<String, Value>,
}

impl AgentOutput {
    pub fn success(result: impl Into<String>, metadata: Map<String, Value>) -> Self {
        Self {
            success: true,
            result: result.into(),
            metadata,
        }
    }

    /// 失败输出仍携带已知的部分结果（如最后一次 SQL），error 写入 metadata
    pub fn failure(
        partial_result: impl Into<String>,
        error: impl Into<String>,
        mut metadata: Map<String, Value>,
    ) -> Self {
        metadata.insert("error".to_string(), Value::String(error.into()));
        Self {
            success: false,
            result: partial_result.into(),
            metadata,
        }
    }

    pub fn error(&self) -> Option<&str> {
        self.metadata.get("error").and_then(Value::as_str)
    }

    pub fn reason(&self) -> Option<&str> {
        self.metadata.get("reason").and_then(Value::as_str)
    }
}
