//! data.quality：检查最近一次执行结果（空结果、整列为空）

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{AgentInput, ToolError};
use crate::memory::{ContextUpdate, ExecutionSummary, StepContext, StepKind};
use crate::tools::{Tool, ToolOutput};

pub fn quality_issues(summary: &ExecutionSummary) -> Vec<String> {
    if summary.row_count == 0 {
        return vec!["查询结果为空".to_string()];
    }
    summary
        .columns
        .iter()
        .filter(|col| {
            !summary.sample_rows.is_empty()
                && summary
                    .sample_rows
                    .iter()
                    .all(|row| row.get(col.as_str()).map(Value::is_null).unwrap_or(true))
        })
        .map(|col| format!("列 {col} 在样例中全为空值"))
        .collect()
}

pub struct DataQualityTool;

#[async_trait]
impl Tool for DataQualityTool {
    fn name(&self) -> &str {
        "data.quality"
    }

    fn description(&self) -> &str {
        "检查最近一次 SQL 执行结果的数据质量（空结果、空值列）。"
    }

    fn step_kind(&self) -> StepKind {
        StepKind::DataQuality
    }

    async fn execute(
        &self,
        _args: &Value,
        _input: &AgentInput,
        resources: &StepContext,
    ) -> Result<ToolOutput, ToolError> {
        let summary = resources
            .last_execution
            .as_ref()
            .ok_or_else(|| ToolError::invalid_input("没有可检查的执行结果"))?;
        let issues = quality_issues(summary);
        let passed = issues.is_empty();
        let note = if passed {
            format!("数据质量通过（{} 行）", summary.row_count)
        } else {
            format!("数据质量问题: {}", issues.join("; "))
        };
        Ok(ToolOutput::ok()
            .with_observation(note)
            .with_update(ContextUpdate::Quality { passed, issues }))
    }
}
