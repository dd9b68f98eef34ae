//! sql.execute：替换时间占位符后在数据源上执行只读查询
//!
//! 执行失败不返回 Err，而是写回 Execution { success: false }，让验证器看到带标签的错误。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::{AgentInput, ToolError};
use crate::memory::{ContextUpdate, ExecutionSummary, StepContext, StepKind};
use crate::tools::sql_validate::read_only_issue;
use crate::tools::{DataSource, Tool, ToolOutput};

pub struct SqlExecuteTool {
    source: Arc<dyn DataSource>,
    default_row_limit: usize,
    sample_rows: usize,
}

impl SqlExecuteTool {
    pub fn new(source: Arc<dyn DataSource>, default_row_limit: usize, sample_rows: usize) -> Self {
        Self {
            source,
            default_row_limit,
            sample_rows,
        }
    }
}

#[async_trait]
impl Tool for SqlExecuteTool {
    fn name(&self) -> &str {
        "sql.execute"
    }

    fn description(&self) -> &str {
        "在数据源上执行当前 SQL（自动替换时间窗口占位符），返回行数与样例行。"
    }

    fn step_kind(&self) -> StepKind {
        StepKind::SqlExecution
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"sql": {"type": "string"}},
            "required": []
        })
    }

    async fn execute(
        &self,
        args: &Value,
        input: &AgentInput,
        resources: &StepContext,
    ) -> Result<ToolOutput, ToolError> {
        let sql = args
            .get("sql")
            .and_then(Value::as_str)
            .or(resources.current_sql.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ToolError::invalid_input("没有可执行的 SQL"))?;
        if let Some(issue) = read_only_issue(sql) {
            return Err(ToolError::invalid_input(issue));
        }

        let window = resources
            .time_window
            .as_ref()
            .or(input.task_context.time_window.as_ref());
        let rendered = match window {
            Some(w) => w.render_sql(sql),
            None => sql.to_string(),
        };
        if rendered.contains("{{start_date}}") || rendered.contains("{{end_date}}") {
            return Err(ToolError::invalid_input("SQL 含时间占位符但没有时间窗口"));
        }

        let max_rows = input.constraints.row_limit.unwrap_or(self.default_row_limit);
        match self.source.query(&rendered, max_rows).await {
            Ok(rows) => {
                let row_count = rows.rows.len();
                let summary = ExecutionSummary {
                    columns: rows.columns,
                    row_count,
                    sample_rows: rows.rows.into_iter().take(self.sample_rows).collect(),
                };
                let note = if rows.truncated {
                    format!("返回 {row_count} 行（已截断）")
                } else {
                    format!("返回 {row_count} 行")
                };
                Ok(ToolOutput::ok()
                    .with_observation(note)
                    .with_update(ContextUpdate::Execution {
                        success: true,
                        summary: Some(summary),
                        error: None,
                    }))
            }
            Err(e) => Ok(ToolOutput::failed(e.clone())
                .with_observation(format!("执行失败 [{}]: {}", e.kind.as_str(), e.message))
                .with_update(ContextUpdate::Execution {
                    success: false,
                    summary: None,
                    error: Some(e),
                })),
        }
    }
}
