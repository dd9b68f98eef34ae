//! ResourcePool：跨轮迭代的完整中间产物存储
//!
//! 工具产出的上下文以 ContextUpdate（带标签的和类型）进入 update()，在合并边界校验：
//! - column_details 深度合并（按表、按列），早期学到的 schema 不会被后续的部分更新覆盖
//! - sql_history / validation_history 追加
//! - 其余字段覆盖
//!
//! extract_for_step 只取某一步需要的字段，保证单次 LLM 调用的 prompt 与累计状态大小无关。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{SchemaInfo, TimeWindow, ToolError};
use crate::memory::ContextMemory;

/// 错误摘要在 ContextMemory 中保留的最大字符数
const ERROR_SUMMARY_CHARS: usize = 120;

/// 单列元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDetail {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(default)]
    pub nullable: bool,
}

impl ColumnDetail {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: None,
            nullable: true,
        }
    }

    pub fn typed(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: Some(data_type.into()),
            nullable: true,
        }
    }
}

/// 表名 -> 列元数据
pub type ColumnDetails = BTreeMap<String, Vec<ColumnDetail>>;

/// SQL 来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlSource {
    Draft,
    /// sql.refine 重写，计入修复次数
    Refine,
    /// 校验给出的 corrected_sql，计入修复次数
    Correction,
    Policy,
    /// 调用方或外部工具直接提供
    Provided,
}

impl SqlSource {
    pub fn is_fix(self) -> bool {
        matches!(self, SqlSource::Refine | SqlSource::Correction)
    }
}

/// 一次 SQL 执行的摘要（只保留样例行）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub columns: Vec<String>,
    pub row_count: usize,
    pub sample_rows: Vec<Value>,
}

/// 工具可写回的上下文更新（合并边界的唯一入口）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextUpdate {
    Schema {
        column_details: ColumnDetails,
        schema_summary: Option<String>,
        recommended_time_column: Option<String>,
    },
    TimeWindow {
        window: TimeWindow,
    },
    Sql {
        sql: String,
        source: SqlSource,
    },
    Validation {
        passed: bool,
        issues: Vec<String>,
        corrected_sql: Option<String>,
        database_validated: bool,
    },
    Execution {
        success: bool,
        summary: Option<ExecutionSummary>,
        error: Option<ToolError>,
    },
    Quality {
        passed: bool,
        issues: Vec<String>,
    },
    Chart {
        chart_spec: Option<Value>,
        chart_image_path: Option<String>,
    },
    TemplateContext {
        context: Value,
    },
    Metadata {
        key: String,
        value: Value,
    },
}

impl ContextUpdate {
    /// 将外部工具返回的无类型 context 映射解析为 ContextUpdate 列表；
    /// 未知键落入 coordinator_metadata，类型不符的已知键报错
    pub fn from_mapping(map: &Map<String, Value>) -> Result<Vec<ContextUpdate>, String> {
        let mut updates = Vec::new();

        let column_details = match map.get("column_details") {
            Some(v) => Some(parse_column_details(v)?),
            None => None,
        };
        let summary = opt_str(map, "schema_summary")?;
        let time_column = opt_str(map, "recommended_time_column")?;
        if column_details.is_some() || summary.is_some() || time_column.is_some() {
            updates.push(ContextUpdate::Schema {
                column_details: column_details.unwrap_or_default(),
                schema_summary: summary,
                recommended_time_column: time_column,
            });
        }

        if let Some(v) = map.get("time_window") {
            let window: TimeWindow = serde_json::from_value(v.clone())
                .map_err(|e| format!("time_window: {e}"))?;
            updates.push(ContextUpdate::TimeWindow { window });
        }

        if let Some(sql) = opt_str(map, "current_sql")? {
            updates.push(ContextUpdate::Sql {
                sql,
                source: SqlSource::Provided,
            });
        }

        let issues = match map.get("issues") {
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .map(|i| i.as_str().map(String::from).unwrap_or_else(|| i.to_string()))
                    .collect::<Vec<_>>(),
            ),
            Some(Value::String(s)) => Some(vec![s.clone()]),
            Some(other) => return Err(format!("issues: unexpected value {other}")),
            None => None,
        };
        let corrected_sql = opt_str(map, "corrected_sql")?;
        let database_validated = map.get("database_validated").and_then(Value::as_bool);
        if issues.is_some() || corrected_sql.is_some() || database_validated.is_some() {
            let issues = issues.unwrap_or_default();
            updates.push(ContextUpdate::Validation {
                passed: issues.is_empty(),
                issues,
                corrected_sql,
                database_validated: database_validated.unwrap_or(false),
            });
        }

        if map.contains_key("row_count") || map.contains_key("rows") {
            let rows: Vec<Value> = map
                .get("rows")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let row_count = map
                .get("row_count")
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .unwrap_or(rows.len());
            let columns = map
                .get("columns")
                .and_then(Value::as_array)
                .map(|cols| cols.iter().filter_map(|c| c.as_str().map(String::from)).collect())
                .unwrap_or_default();
            updates.push(ContextUpdate::Execution {
                success: true,
                summary: Some(ExecutionSummary {
                    columns,
                    row_count,
                    sample_rows: rows,
                }),
                error: None,
            });
        }

        let chart_spec = map.get("chart_spec").cloned();
        let chart_image_path = opt_str(map, "chart_image_path")?;
        if chart_spec.is_some() || chart_image_path.is_some() {
            updates.push(ContextUpdate::Chart {
                chart_spec,
                chart_image_path,
            });
        }

        const KNOWN: &[&str] = &[
            "column_details",
            "schema_summary",
            "recommended_time_column",
            "time_window",
            "current_sql",
            "issues",
            "corrected_sql",
            "database_validated",
            "row_count",
            "rows",
            "columns",
            "chart_spec",
            "chart_image_path",
        ];
        for (key, value) in map {
            if !KNOWN.contains(&key.as_str()) {
                updates.push(ContextUpdate::Metadata {
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }

        Ok(updates)
    }
}

fn opt_str(map: &Map<String, Value>, key: &str) -> Result<Option<String>, String> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(format!("{key}: expected string, got {other}")),
    }
}

fn parse_column_details(value: &Value) -> Result<ColumnDetails, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "column_details: expected object".to_string())?;
    let mut details = ColumnDetails::new();
    for (table, cols) in obj {
        let cols = cols
            .as_array()
            .ok_or_else(|| format!("column_details.{table}: expected array"))?;
        let parsed = cols
            .iter()
            .map(|c| match c {
                Value::String(name) => Ok(ColumnDetail::new(name.clone())),
                Value::Object(_) => serde_json::from_value::<ColumnDetail>(c.clone())
                    .map_err(|e| format!("column_details.{table}: {e}")),
                other => Err(format!("column_details.{table}: unexpected column {other}")),
            })
            .collect::<Result<Vec<_>, _>>()?;
        details.insert(table.clone(), parsed);
    }
    Ok(details)
}

/// 步骤类型：决定 extract_for_step 取哪些字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    SchemaDiscovery,
    TimeWindow,
    SqlGeneration,
    SqlValidation,
    SqlRefinement,
    SqlExecution,
    DataQuality,
    ChartGeneration,
}

/// 某一步所需的最小上下文
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_details: Option<ColumnDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_context: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended_time_column: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_execution: Option<ExecutionSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart_spec: Option<Value>,
}

/// 一次校验的记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationRecord {
    pub sql: Option<String>,
    pub passed: bool,
    pub issues: Vec<String>,
    pub database_validated: bool,
}

/// 完整中间产物存储（单个循环实例独占，不跨请求共享）
#[derive(Debug, Clone, Default)]
pub struct ResourcePool {
    column_details: ColumnDetails,
    current_sql: Option<String>,
    schema_summary: Option<String>,
    recommended_time_column: Option<String>,
    template_context: Option<Value>,
    coordinator_metadata: Map<String, Value>,
    sql_history: Vec<(SqlSource, String)>,
    validation_history: Vec<ValidationRecord>,
    time_window: Option<TimeWindow>,
    sql_validated: bool,
    database_validated: bool,
    sql_executed_successfully: bool,
    last_execution: Option<ExecutionSummary>,
    last_error: Option<String>,
    last_issues: Vec<String>,
    quality_passed: Option<bool>,
    chart_spec: Option<Value>,
    chart_image_path: Option<String>,
}

impl ResourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// 用调用方提供的 schema 播种（仅列名，无类型）
    pub fn seed_schema(&mut self, schema: &SchemaInfo) {
        if schema.is_empty() {
            return;
        }
        let column_details = schema
            .tables
            .iter()
            .map(|t| {
                let cols = schema
                    .columns
                    .get(t)
                    .map(|cs| cs.iter().map(ColumnDetail::new).collect())
                    .unwrap_or_default();
                (t.clone(), cols)
            })
            .collect();
        self.update(ContextUpdate::Schema {
            column_details,
            schema_summary: None,
            recommended_time_column: None,
        });
    }

    pub fn update(&mut self, update: ContextUpdate) {
        match update {
            ContextUpdate::Schema {
                column_details,
                schema_summary,
                recommended_time_column,
            } => {
                self.merge_column_details(column_details);
                if schema_summary.is_some() {
                    self.schema_summary = schema_summary;
                }
                if recommended_time_column.is_some() {
                    self.recommended_time_column = recommended_time_column;
                }
            }
            ContextUpdate::TimeWindow { window } => self.time_window = Some(window),
            ContextUpdate::Sql { sql, source } => self.set_sql(sql, source),
            ContextUpdate::Validation {
                passed,
                issues,
                corrected_sql: _,
                database_validated,
            } => {
                self.validation_history.push(ValidationRecord {
                    sql: self.current_sql.clone(),
                    passed,
                    issues: issues.clone(),
                    database_validated,
                });
                self.sql_validated = passed;
                self.database_validated = database_validated;
                self.last_issues = issues;
            }
            ContextUpdate::Execution {
                success,
                summary,
                error,
            } => {
                self.sql_executed_successfully = success;
                if success {
                    self.last_execution = summary;
                    self.last_error = None;
                } else {
                    self.last_execution = None;
                    if let Some(e) = error {
                        self.last_error = Some(e.message);
                    }
                }
            }
            ContextUpdate::Quality { passed, issues } => {
                self.quality_passed = Some(passed);
                if !passed {
                    self.last_issues = issues;
                }
            }
            ContextUpdate::Chart {
                chart_spec,
                chart_image_path,
            } => {
                if chart_spec.is_some() {
                    self.chart_spec = chart_spec;
                }
                if chart_image_path.is_some() {
                    self.chart_image_path = chart_image_path;
                }
            }
            ContextUpdate::TemplateContext { context } => self.template_context = Some(context),
            ContextUpdate::Metadata { key, value } => {
                self.coordinator_metadata.insert(key, value);
            }
        }
    }

    pub fn apply_all(&mut self, updates: impl IntoIterator<Item = ContextUpdate>) {
        for u in updates {
            self.update(u);
        }
    }

    /// 记录工具层错误（不改变 SQL 状态）
    pub fn note_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }

    fn merge_column_details(&mut self, incoming: ColumnDetails) {
        for (table, columns) in incoming {
            let existing = self.column_details.entry(table).or_default();
            for col in columns {
                match existing.iter_mut().find(|c| c.name.eq_ignore_ascii_case(&col.name)) {
                    Some(known) => {
                        if col.data_type.is_some() {
                            known.data_type = col.data_type;
                            known.nullable = col.nullable;
                        }
                    }
                    None => existing.push(col),
                }
            }
        }
    }

    fn set_sql(&mut self, sql: String, source: SqlSource) {
        let sql = sql.trim().to_string();
        if sql.is_empty() {
            return;
        }
        if self.current_sql.as_deref() == Some(sql.as_str()) {
            // 修正未改变 SQL 时视为重新提交校验
            if source.is_fix() {
                self.sql_validated = false;
                self.last_issues.clear();
            }
            return;
        }
        // 新 SQL 使旧的校验 / 执行结论失效
        self.sql_validated = false;
        self.database_validated = false;
        self.sql_executed_successfully = false;
        self.last_execution = None;
        self.last_issues.clear();
        self.quality_passed = None;
        self.chart_spec = None;
        self.chart_image_path = None;
        self.sql_history.push((source, sql.clone()));
        self.current_sql = Some(sql);
    }

    /// 压缩投影：每次重新计算，不缓存
    pub fn build_context_memory(&self) -> ContextMemory {
        let current_sql = self.current_sql.as_deref().unwrap_or("");
        ContextMemory {
            has_sql: !current_sql.is_empty(),
            schema_available: !self.column_details.is_empty(),
            sql_validated: self.sql_validated,
            database_validated: self.database_validated,
            sql_executed_successfully: self.sql_executed_successfully,
            has_chart_spec: self.chart_spec.is_some(),
            has_chart_image: self.chart_image_path.is_some(),
            tables: self.column_details.keys().cloned().collect(),
            sql_length: current_sql.chars().count(),
            sql_fix_attempts: 0,
            last_error_summary: self.last_error.as_deref().map(summarize_error),
            pending_issues: self.last_issues.len(),
            result_rows: self.last_execution.as_ref().map(|e| e.row_count),
            time_range: self.time_window.as_ref().map(|w| w.to_string()),
        }
    }

    pub fn extract_for_step(&self, step: StepKind) -> StepContext {
        let mut ctx = StepContext::default();
        match step {
            StepKind::SchemaDiscovery => {}
            StepKind::TimeWindow => {
                ctx.time_window = self.time_window.clone();
            }
            StepKind::SqlGeneration => {
                ctx.column_details = Some(self.column_details.clone());
                ctx.template_context = self.template_context.clone();
                ctx.time_window = self.time_window.clone();
                ctx.recommended_time_column = self.recommended_time_column.clone();
            }
            StepKind::SqlValidation => {
                ctx.current_sql = self.current_sql.clone();
                ctx.column_details = Some(self.column_details.clone());
            }
            StepKind::SqlRefinement => {
                ctx.current_sql = self.current_sql.clone();
                ctx.column_details = Some(self.column_details.clone());
                ctx.last_error = self.last_error.clone();
                ctx.issues = self.last_issues.clone();
                ctx.time_window = self.time_window.clone();
                ctx.recommended_time_column = self.recommended_time_column.clone();
            }
            StepKind::SqlExecution => {
                ctx.current_sql = self.current_sql.clone();
                ctx.time_window = self.time_window.clone();
            }
            StepKind::DataQuality => {
                ctx.current_sql = self.current_sql.clone();
                ctx.last_execution = self.last_execution.clone();
            }
            StepKind::ChartGeneration => {
                ctx.last_execution = self.last_execution.clone();
                ctx.chart_spec = self.chart_spec.clone();
            }
        }
        ctx
    }

    /// 在调用方 schema 基础上合入已学到的列，作为下一轮 AgentInput 的 schema
    pub fn schema_view(&self, base: &SchemaInfo) -> SchemaInfo {
        self.column_details
            .iter()
            .fold(base.clone(), |schema, (table, cols)| {
                schema.with_table(table.clone(), cols.iter().map(|c| c.name.clone()))
            })
    }

    pub fn current_sql(&self) -> Option<&str> {
        self.current_sql.as_deref()
    }

    pub fn column_details(&self) -> &ColumnDetails {
        &self.column_details
    }

    pub fn schema_summary(&self) -> Option<&str> {
        self.schema_summary.as_deref()
    }

    pub fn time_window(&self) -> Option<&TimeWindow> {
        self.time_window.as_ref()
    }

    pub fn sql_validated(&self) -> bool {
        self.sql_validated
    }

    pub fn database_validated(&self) -> bool {
        self.database_validated
    }

    pub fn sql_executed_successfully(&self) -> bool {
        self.sql_executed_successfully
    }

    pub fn last_execution(&self) -> Option<&ExecutionSummary> {
        self.last_execution.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_issues(&self) -> &[String] {
        &self.last_issues
    }

    pub fn quality_passed(&self) -> Option<bool> {
        self.quality_passed
    }

    pub fn chart_spec(&self) -> Option<&Value> {
        self.chart_spec.as_ref()
    }

    pub fn chart_image_path(&self) -> Option<&str> {
        self.chart_image_path.as_deref()
    }

    pub fn sql_history(&self) -> &[(SqlSource, String)] {
        &self.sql_history
    }

    pub fn validation_history(&self) -> &[ValidationRecord] {
        &self.validation_history
    }

    pub fn coordinator_metadata(&self) -> &Map<String, Value> {
        &self.coordinator_metadata
    }
}

fn summarize_error(message: &str) -> String {
    if message.chars().count() > ERROR_SUMMARY_CHARS {
        format!("{}...", message.chars().take(ERROR_SUMMARY_CHARS).collect::<String>())
    } else {
        message.to_string()
    }
}
