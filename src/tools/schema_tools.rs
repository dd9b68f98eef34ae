//! Schema 工具：schema.list_tables / schema.list_columns
//!
//! 数据源没有任何表时返回 SchemaMissing（"无表"），供恢复引擎识别 schema 不可用。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::{AgentInput, ErrorKind, ToolError};
use crate::memory::{ColumnDetail, ColumnDetails, ContextUpdate, StepContext, StepKind};
use crate::tools::{DataSource, SchemaCache, Tool, ToolOutput};

const NO_TABLES: &str = "无表：数据源中没有可用的表";
/// 单次最多描述的表数
const MAX_DESCRIBE_TABLES: usize = 20;

const TIME_NAME_HINTS: &[&str] = &[
    "date", "time", "day", "dt", "created_at", "updated_at", "日期", "时间",
];

async fn fetch_tables(
    source: &dyn DataSource,
    cache: &SchemaCache,
) -> Result<Vec<String>, ToolError> {
    if let Some(tables) = cache.tables() {
        return Ok(tables);
    }
    let tables = source.list_tables().await?;
    cache.put_tables(tables.clone());
    Ok(tables)
}

async fn fetch_columns(
    source: &dyn DataSource,
    cache: &SchemaCache,
    table: &str,
) -> Result<Vec<ColumnDetail>, ToolError> {
    if let Some(columns) = cache.columns(table) {
        return Ok(columns);
    }
    let columns = source.describe_table(table).await?;
    cache.put_columns(table, columns.clone());
    Ok(columns)
}

/// 推荐时间列：优先类型含 DATE/TIME 的列，其次名称像时间的列
pub fn recommend_time_column(details: &ColumnDetails) -> Option<String> {
    let typed = details.iter().find_map(|(table, cols)| {
        cols.iter()
            .find(|c| {
                c.data_type
                    .as_deref()
                    .map(|t| {
                        let t = t.to_uppercase();
                        t.contains("DATE") || t.contains("TIME")
                    })
                    .unwrap_or(false)
            })
            .map(|c| format!("{table}.{}", c.name))
    });
    typed.or_else(|| {
        details.iter().find_map(|(table, cols)| {
            cols.iter()
                .find(|c| {
                    let name = c.name.to_lowercase();
                    TIME_NAME_HINTS
                        .iter()
                        .any(|h| name == *h || name.ends_with(&format!("_{h}")) || name.starts_with(&format!("{h}_")))
                })
                .map(|c| format!("{table}.{}", c.name))
        })
    })
}

fn summarize(details: &ColumnDetails) -> String {
    details
        .iter()
        .map(|(table, cols)| {
            let cols = cols
                .iter()
                .map(|c| match &c.data_type {
                    Some(t) => format!("{} {}", c.name, t),
                    None => c.name.clone(),
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("{table}({cols})")
        })
        .collect::<Vec<_>>()
        .join("; ")
}

pub struct ListTablesTool {
    source: Arc<dyn DataSource>,
    cache: Arc<SchemaCache>,
}

impl ListTablesTool {
    pub fn new(source: Arc<dyn DataSource>, cache: Arc<SchemaCache>) -> Self {
        Self { source, cache }
    }
}

#[async_trait]
impl Tool for ListTablesTool {
    fn name(&self) -> &str {
        "schema.list_tables"
    }

    fn description(&self) -> &str {
        "列出数据源中的表名。无参数。"
    }

    fn step_kind(&self) -> StepKind {
        StepKind::SchemaDiscovery
    }

    async fn execute(
        &self,
        _args: &Value,
        _input: &AgentInput,
        _resources: &StepContext,
    ) -> Result<ToolOutput, ToolError> {
        let tables = fetch_tables(self.source.as_ref(), &self.cache).await?;
        if tables.is_empty() {
            return Err(ToolError::new(ErrorKind::SchemaMissing, NO_TABLES));
        }
        let column_details: ColumnDetails =
            tables.iter().map(|t| (t.clone(), Vec::new())).collect();
        Ok(ToolOutput::ok()
            .with_observation(format!("发现 {} 张表: {}", tables.len(), tables.join(", ")))
            .with_update(ContextUpdate::Schema {
                column_details,
                schema_summary: None,
                recommended_time_column: None,
            }))
    }
}

pub struct ListColumnsTool {
    source: Arc<dyn DataSource>,
    cache: Arc<SchemaCache>,
}

impl ListColumnsTool {
    pub fn new(source: Arc<dyn DataSource>, cache: Arc<SchemaCache>) -> Self {
        Self { source, cache }
    }

    /// 参数给出的表优先，其次调用方 schema，最后是数据源全部表
    async fn target_tables(&self, args: &Value, input: &AgentInput) -> Result<Vec<String>, ToolError> {
        let requested: Vec<String> = args
            .get("tables")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        if !requested.is_empty() {
            return Ok(requested);
        }
        if !input.schema.is_empty() {
            return Ok(input.schema.tables.clone());
        }
        fetch_tables(self.source.as_ref(), &self.cache).await
    }
}

#[async_trait]
impl Tool for ListColumnsTool {
    fn name(&self) -> &str {
        "schema.list_columns"
    }

    fn description(&self) -> &str {
        "获取表结构（列名、类型）并推荐时间列。参数: {\"tables\": [\"表名\"]}，省略则取全部表。"
    }

    fn step_kind(&self) -> StepKind {
        StepKind::SchemaDiscovery
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "tables": {"type": "array", "items": {"type": "string"}}
            },
            "required": []
        })
    }

    async fn execute(
        &self,
        args: &Value,
        input: &AgentInput,
        _resources: &StepContext,
    ) -> Result<ToolOutput, ToolError> {
        let tables = self.target_tables(args, input).await?;
        if tables.is_empty() {
            return Err(ToolError::new(ErrorKind::SchemaMissing, NO_TABLES));
        }

        let mut details = ColumnDetails::new();
        let mut missing = Vec::new();
        for table in tables.iter().take(MAX_DESCRIBE_TABLES) {
            match fetch_columns(self.source.as_ref(), &self.cache, table).await {
                Ok(cols) => {
                    details.insert(table.clone(), cols);
                }
                Err(e) if e.kind == ErrorKind::SchemaMissing => missing.push(table.clone()),
                Err(e) => return Err(e),
            }
        }
        if details.is_empty() {
            return Err(ToolError::new(
                ErrorKind::SchemaMissing,
                format!("无表：请求的表均不存在 ({})", missing.join(", ")),
            ));
        }

        let time_column = recommend_time_column(&details);
        let summary = summarize(&details);
        let mut output = ToolOutput::ok().with_observation(format!("表结构: {summary}"));
        if let Some(col) = &time_column {
            output = output.with_observation(format!("推荐时间列: {col}"));
        }
        if !missing.is_empty() {
            output = output.with_observation(format!("不存在的表: {}", missing.join(", ")));
        }
        Ok(output.with_update(ContextUpdate::Schema {
            column_details: details,
            schema_summary: Some(summary),
            recommended_time_column: time_column,
        }))
    }
}
