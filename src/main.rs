//! Report Agent 演示入口
//!
//! 初始化日志、加载配置、准备内置 SQLite 示例库（sales 表），
//! 对命令行给出的占位符执行一次指定模式，并以 JSON 打印 AgentOutput。
//!
//! 用法：report-agent [占位符描述] [ptav|ptof|task_sql_validation|report_chart_generation] [配置文件]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Duration;
use report_agent::config::load_config;
use report_agent::core::{OutputKind, PlaceholderSpec, SchemaInfo};
use report_agent::llm::MockLlmClient;
use report_agent::tools::time_window::today_in;
use report_agent::tools::SqliteDataSource;
use report_agent::{AgentInput, ExecutionMode, OrchestratorBuilder};

const DEFAULT_PLACEHOLDER: &str = "统计本月销售额";

/// provider = "mock" 时的离线演示回复
const DEMO_DRAFT_SQL: &str = r#"{"sql": "SELECT region, SUM(amount) AS total_amount FROM sales WHERE sale_date BETWEEN '{{start_date}}' AND '{{end_date}}' GROUP BY region"}"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    report_agent::observability::init();

    let mut args = std::env::args().skip(1);
    let placeholder = args.next().unwrap_or_else(|| DEFAULT_PLACEHOLDER.to_string());
    let mode: ExecutionMode = args
        .next()
        .as_deref()
        .unwrap_or("ptav")
        .parse()
        .map_err(anyhow::Error::msg)?;
    let config_path = args.next().map(PathBuf::from);

    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        Default::default()
    });

    let today = today_in(&cfg.task.timezone);
    let db = SqliteDataSource::in_memory().context("Failed to open demo database")?;
    db.execute_batch(&demo_seed_sql(today))
        .context("Failed to seed demo database")?;

    let mut builder = OrchestratorBuilder::new(cfg.clone()).with_data_source(Arc::new(db));
    if cfg.llm.provider.eq_ignore_ascii_case("mock") {
        builder = builder.with_llm(Arc::new(
            MockLlmClient::new().with_reply("sql_draft", DEMO_DRAFT_SQL),
        ));
    }
    let orchestrator = builder.build();

    let mut input = AgentInput::new(
        placeholder.clone(),
        PlaceholderSpec::new("demo", placeholder).with_semantic_type("统计"),
    )
    .with_schema(SchemaInfo::new().with_table("sales", ["amount", "sale_date", "region"]));
    match mode {
        ExecutionMode::TaskSqlValidation | ExecutionMode::ReportChartGeneration => {
            let sql = "SELECT region, SUM(amount) AS total_amount FROM sales \
                       WHERE sale_date BETWEEN '{{start_date}}' AND '{{end_date}}' GROUP BY region";
            input = input.with_task_driven("current_sql", serde_json::json!(sql));
            if mode == ExecutionMode::ReportChartGeneration {
                input = input.with_output_kind(OutputKind::Chart);
            }
        }
        ExecutionMode::Ptav | ExecutionMode::Ptof => {}
    }

    let output = orchestrator.execute(input, mode).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&output).context("Failed to serialize output")?
    );
    Ok(())
}

fn demo_seed_sql(today: chrono::NaiveDate) -> String {
    let rows = [
        (120.5, 0, "华东"),
        (80.0, 1, "华南"),
        (200.0, 2, "华东"),
        (55.0, 40, "华北"),
    ];
    let values: Vec<String> = rows
        .iter()
        .map(|(amount, days_ago, region)| {
            let date = today - Duration::days(*days_ago);
            format!("({amount}, '{}', '{region}')", date.format("%Y-%m-%d"))
        })
        .collect();
    format!(
        "CREATE TABLE sales (amount REAL, sale_date TEXT, region TEXT);\n\
         INSERT INTO sales VALUES {};",
        values.join(", ")
    )
}
