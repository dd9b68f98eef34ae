//! 图表工具：chart.spec 生成图表规格，word_chart_generator 把规格落盘为报告可引用的产物
//!
//! 图表类型：趋势类用折线图，占比类用饼图，其余用柱状图。

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::{AgentInput, ErrorKind, ToolError};
use crate::memory::{ContextUpdate, ExecutionSummary, StepContext, StepKind};
use crate::tools::{Tool, ToolOutput};

pub fn chart_type_for(input: &AgentInput) -> &'static str {
    let text = format!(
        "{} {}",
        input.placeholder.semantic_type.as_deref().unwrap_or(""),
        input.goal()
    )
    .to_lowercase();
    if ["趋势", "走势", "trend"].iter().any(|k| text.contains(k)) {
        "line"
    } else if ["占比", "比例", "构成", "share", "ratio"].iter().any(|k| text.contains(k)) {
        "pie"
    } else {
        "bar"
    }
}

/// 首列作维度，其后第一个数值列作度量
fn pick_axes(summary: &ExecutionSummary) -> Option<(String, String)> {
    let x = summary.columns.first()?.clone();
    let y = summary
        .columns
        .iter()
        .skip(1)
        .find(|col| {
            summary
                .sample_rows
                .iter()
                .any(|row| row.get(col.as_str()).map(Value::is_number).unwrap_or(false))
        })
        .or_else(|| summary.columns.get(1))
        .cloned()
        .unwrap_or_else(|| x.clone());
    Some((x, y))
}

pub struct ChartSpecTool;

#[async_trait]
impl Tool for ChartSpecTool {
    fn name(&self) -> &str {
        "chart.spec"
    }

    fn description(&self) -> &str {
        "根据最近一次执行结果生成图表规格（类型、坐标轴、数据）。"
    }

    fn step_kind(&self) -> StepKind {
        StepKind::ChartGeneration
    }

    async fn execute(
        &self,
        _args: &Value,
        input: &AgentInput,
        resources: &StepContext,
    ) -> Result<ToolOutput, ToolError> {
        let summary = resources
            .last_execution
            .as_ref()
            .ok_or_else(|| ToolError::invalid_input("没有可用于绘图的执行结果"))?;
        let (x, y) = pick_axes(summary)
            .ok_or_else(|| ToolError::invalid_input("执行结果没有列，无法绘图"))?;
        let chart_type = chart_type_for(input);
        let spec = json!({
            "type": chart_type,
            "title": input.goal(),
            "x": x,
            "y": y,
            "data": summary.sample_rows,
            "row_count": summary.row_count,
        });
        Ok(ToolOutput::ok()
            .with_observation(format!("图表规格: {chart_type}（x={x}, y={y}）"))
            .with_update(ContextUpdate::Chart {
                chart_spec: Some(spec),
                chart_image_path: None,
            }))
    }
}

pub struct WordChartGeneratorTool {
    output_dir: PathBuf,
}

impl WordChartGeneratorTool {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

#[async_trait]
impl Tool for WordChartGeneratorTool {
    fn name(&self) -> &str {
        "word_chart_generator"
    }

    fn description(&self) -> &str {
        "将图表规格渲染为报告可嵌入的图表产物，返回文件路径（需先生成图表规格）。"
    }

    fn step_kind(&self) -> StepKind {
        StepKind::ChartGeneration
    }

    async fn execute(
        &self,
        _args: &Value,
        input: &AgentInput,
        resources: &StepContext,
    ) -> Result<ToolOutput, ToolError> {
        let spec = resources
            .chart_spec
            .as_ref()
            .ok_or_else(|| ToolError::invalid_input("没有图表规格，请先执行 chart.spec"))?;

        let io_err = |e: std::io::Error| {
            ToolError::new(ErrorKind::Permission, format!("写入图表产物失败: {e}"))
        };
        tokio::fs::create_dir_all(&self.output_dir).await.map_err(io_err)?;
        let file = self
            .output_dir
            .join(format!("chart_{}_{}.json", input.placeholder.id.replace(['/', '\\'], "_"), uuid::Uuid::new_v4()));
        let artifact = json!({
            "placeholder_id": input.placeholder.id,
            "generated_at": chrono::Utc::now().to_rfc3339(),
            "spec": spec,
        });
        let body = serde_json::to_vec_pretty(&artifact)
            .map_err(|e| ToolError::new(ErrorKind::Unknown, e.to_string()))?;
        tokio::fs::write(&file, body).await.map_err(io_err)?;

        let path = file.display().to_string();
        Ok(ToolOutput::ok()
            .with_observation(format!("图表已生成: {path}"))
            .with_update(ContextUpdate::Chart {
                chart_spec: None,
                chart_image_path: Some(path),
            }))
    }
}
