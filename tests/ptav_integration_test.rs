//! 编排器集成测试：内存 SQLite + Mock LLM，覆盖四种模式与主要终止路径

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use report_agent::config::AppConfig;
    use report_agent::core::{OutputKind, PlaceholderSpec, SchemaInfo, TaskContext};
    use report_agent::llm::MockLlmClient;
    use report_agent::memory::StepKind;
    use report_agent::ptav::PtavEvent;
    use report_agent::tools::time_window::today_in;
    use report_agent::tools::{FnTool, SqliteDataSource};
    use report_agent::{AgentInput, ExecutionMode, OrchestratorBuilder};
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;

    const MONTHLY_SQL: &str = "SELECT SUM(amount) AS total_amount FROM sales \
                               WHERE sale_date BETWEEN '{{start_date}}' AND '{{end_date}}'";
    const REGION_SQL: &str = "SELECT region, SUM(amount) AS total_amount FROM sales \
                              WHERE sale_date BETWEEN '{{start_date}}' AND '{{end_date}}' GROUP BY region";

    fn sales_db() -> SqliteDataSource {
        let today = today_in(&TaskContext::default().timezone);
        let day = today.format("%Y-%m-%d");
        let db = SqliteDataSource::in_memory().unwrap();
        db.execute_batch(&format!(
            "CREATE TABLE sales (amount REAL, sale_date TEXT, region TEXT);
             INSERT INTO sales VALUES (120.5, '{day}', '华东'), (80.0, '{day}', '华南');"
        ))
        .unwrap();
        db
    }

    fn sales_schema() -> SchemaInfo {
        SchemaInfo::new().with_table("sales", ["amount", "sale_date", "region"])
    }

    fn monthly_input() -> AgentInput {
        AgentInput::new(
            "统计本月销售额",
            PlaceholderSpec::new("sales_month", "统计本月销售额").with_semantic_type("统计"),
        )
        .with_schema(sales_schema())
    }

    fn drafting_llm(sql: &str) -> Arc<MockLlmClient> {
        // 规划阶段返回无法解析的文本，迫使规划器走回退计划
        Arc::new(
            MockLlmClient::new()
                .with_reply("plan", "I think we should query the database")
                .with_reply("sql_draft", json!({ "sql": sql }).to_string()),
        )
    }

    fn tool_trace(output: &report_agent::AgentOutput) -> Vec<String> {
        output.metadata["tool_trace"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect()
    }

    #[tokio::test]
    async fn test_monthly_sales_succeeds_via_fallback_plans() {
        let llm = drafting_llm(MONTHLY_SQL);
        let orch = OrchestratorBuilder::new(AppConfig::default())
            .with_llm(llm.clone())
            .with_data_source(Arc::new(sales_db()))
            .build();

        let output = orch.execute(monthly_input(), ExecutionMode::Ptav).await;

        assert!(output.success, "output: {output:?}");
        assert_eq!(output.result, MONTHLY_SQL);
        assert_eq!(
            tool_trace(&output),
            vec!["time.window", "sql.draft", "sql.validate", "sql.execute"]
        );
        assert_eq!(output.metadata["row_count"], json!(1));
        assert_eq!(output.metadata["database_validated"], json!(true));
        assert_eq!(output.metadata["mode"], json!("ptav"));
        assert!(llm.calls_for_stage("plan") >= 4);
    }

    #[tokio::test]
    async fn test_sales_table_with_date_column() {
        let day = today_in(&TaskContext::default().timezone).format("%Y-%m-%d");
        let db = SqliteDataSource::in_memory().unwrap();
        db.execute_batch(&format!(
            "CREATE TABLE sales (amount REAL, date TEXT);
             INSERT INTO sales VALUES (10.0, '{day}');"
        ))
        .unwrap();
        let sql = "SELECT SUM(amount) AS total FROM sales WHERE date BETWEEN '{{start_date}}' AND '{{end_date}}'";
        let orch = OrchestratorBuilder::new(AppConfig::default())
            .with_llm(drafting_llm(sql))
            .with_data_source(Arc::new(db))
            .build();
        let input = AgentInput::new("统计本月销售额", PlaceholderSpec::new("p", "统计本月销售额"))
            .with_schema(SchemaInfo::new().with_table("sales", ["amount", "date"]));

        let output = orch.execute(input, ExecutionMode::Ptav).await;

        assert!(output.success, "output: {output:?}");
        assert!(output.result.contains("SELECT"));
        assert!(output.result.contains("sales"));
        assert!(output.metadata["iterations"].as_u64().unwrap() <= 15);
    }

    #[tokio::test]
    async fn test_repair_cap_stops_with_last_sql() {
        let corrected = "SELECT SUM(amount) AS total FROM sales";
        let validate = FnTool::new(
            "sql.validate",
            "总是报告问题的校验器",
            StepKind::SqlValidation,
            move |_payload| async move {
                Ok::<Value, String>(json!({
                    "success": true,
                    "context": {
                        "issues": ["金额列需要按币种换算"],
                        "corrected_sql": corrected,
                    }
                }))
            },
        );
        let orch = OrchestratorBuilder::new(AppConfig::default())
            .with_llm(drafting_llm(MONTHLY_SQL))
            .with_data_source(Arc::new(sales_db()))
            .with_tool(Arc::new(validate))
            .build();

        let output = orch.execute(monthly_input(), ExecutionMode::Ptav).await;

        assert!(!output.success);
        assert!(output.error().unwrap().contains("修复失败"), "output: {output:?}");
        assert_eq!(output.result, corrected);
        assert_eq!(output.metadata["sql_fix_attempts"], json!(3));
        let trace = tool_trace(&output);
        assert_eq!(trace.iter().filter(|t| *t == "sql.validate").count(), 4);
        assert!(!trace.contains(&"sql.execute".to_string()));
    }

    #[tokio::test]
    async fn test_empty_database_exits_early_on_schema_unavailable() {
        let db = SqliteDataSource::in_memory().unwrap();
        let orch = OrchestratorBuilder::new(AppConfig::default())
            .with_llm(drafting_llm(MONTHLY_SQL))
            .with_data_source(Arc::new(db))
            .build();
        let input = AgentInput::new("统计本月销售额", PlaceholderSpec::new("p", "统计本月销售额"));

        let output = orch.execute(input, ExecutionMode::Ptav).await;

        assert!(!output.success);
        assert_eq!(output.metadata["exit_pattern"], json!("schema_unavailable"));
        assert!(output.metadata["suggestion"].as_str().unwrap().contains("数据源"));
        let iterations = output.metadata["iterations"].as_u64().unwrap();
        assert!(iterations < 15);
        assert_eq!(iterations, 3);
    }

    #[tokio::test]
    async fn test_zero_timeout_aborts_before_first_iteration() {
        let mut config = AppConfig::default();
        config.agent.iteration_timeout_secs = 0;
        let orch = OrchestratorBuilder::new(config)
            .with_llm(drafting_llm(MONTHLY_SQL))
            .with_data_source(Arc::new(sales_db()))
            .build();

        let output = orch.execute(monthly_input(), ExecutionMode::Ptav).await;

        assert!(!output.success);
        assert!(output.error().unwrap().contains("执行超时"));
        assert_eq!(output.metadata["iterations"], json!(0));
        assert_eq!(output.metadata["phase"], json!("aborted"));
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts() {
        let orch = OrchestratorBuilder::new(AppConfig::default())
            .with_llm(drafting_llm(MONTHLY_SQL))
            .with_data_source(Arc::new(sales_db()))
            .build();
        let token = CancellationToken::new();
        token.cancel();

        let output = orch
            .execute_with_cancel(monthly_input(), ExecutionMode::Ptav, token)
            .await;

        assert!(!output.success);
        assert_eq!(output.error(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_refine_loop_stops_at_fix_cap() {
        let llm = Arc::new(
            MockLlmClient::new()
                .with_reply("plan", r#"{"tool": "sql.refine", "reason": "继续修复"}"#)
                .with_reply("sql_refine", r#"{"sql": "SELECT SUM(amount) AS total FROM sales"}"#),
        );
        let orch = OrchestratorBuilder::new(AppConfig::default())
            .with_llm(llm.clone())
            .with_data_source(Arc::new(sales_db()))
            .build();
        let input = monthly_input().with_task_driven("sql", json!("SELECT SUM(amout) FROM sales"));

        let output = orch.execute(input, ExecutionMode::Ptav).await;

        assert!(!output.success);
        assert_eq!(output.error(), Some("SQL修复失败：3次尝试后仍有问题"), "output: {output:?}");
        assert_eq!(output.metadata["sql_fix_attempts"], json!(3));
        assert_eq!(tool_trace(&output), vec!["sql.refine"; 3]);
        assert_eq!(llm.calls_for_stage("sql_refine"), 3);
        assert_eq!(output.result, "SELECT SUM(amount) AS total FROM sales");
    }

    #[tokio::test]
    async fn test_external_execution_failure_stops_immediately() {
        let execute = FnTool::new(
            "sql.execute",
            "只返回失败 JSON 的外部执行器",
            StepKind::SqlExecution,
            |_payload| async {
                Ok::<Value, String>(json!({"success": false, "error": "no such column: amt"}))
            },
        );
        let orch = OrchestratorBuilder::new(AppConfig::default())
            .with_llm(drafting_llm(MONTHLY_SQL))
            .with_data_source(Arc::new(sales_db()))
            .with_tool(Arc::new(execute))
            .build();

        let output = orch.execute(monthly_input(), ExecutionMode::Ptav).await;

        assert!(!output.success);
        assert_eq!(
            tool_trace(&output),
            vec!["time.window", "sql.draft", "sql.validate", "sql.execute"]
        );
        let error = output.error().unwrap();
        assert!(error.starts_with("SQL 执行失败"), "output: {output:?}");
        assert!(error.contains("no such column"));
        assert!(output.metadata.get("exit_pattern").is_none());
    }

    #[tokio::test]
    async fn test_validated_sql_counts_as_success_when_connection_drops() {
        let execute = FnTool::new(
            "sql.execute",
            "连接中断的执行器",
            StepKind::SqlExecution,
            |_payload| async { Err::<Value, String>("connection refused by host".to_string()) },
        );
        let orch = OrchestratorBuilder::new(AppConfig::default())
            .with_llm(drafting_llm(MONTHLY_SQL))
            .with_data_source(Arc::new(sales_db()))
            .with_tool(Arc::new(execute))
            .build();

        let output = orch.execute(monthly_input(), ExecutionMode::Ptav).await;

        assert!(output.success, "output: {output:?}");
        assert_eq!(output.result, MONTHLY_SQL);
        assert!(output.reason().unwrap().contains("数据库连接失败"));
        assert_eq!(output.metadata["database_validated"], json!(true));
    }

    #[tokio::test]
    async fn test_events_stream_iterations() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let orch = OrchestratorBuilder::new(AppConfig::default())
            .with_llm(drafting_llm(MONTHLY_SQL))
            .with_data_source(Arc::new(sales_db()))
            .with_event_sender(tx)
            .build();

        let output = orch.execute(monthly_input(), ExecutionMode::Ptav).await;
        assert!(output.success);

        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        assert_eq!(
            events.first(),
            Some(&PtavEvent::IterationStarted {
                iteration: 1,
                max_iterations: 15
            })
        );
        assert_eq!(
            events.last(),
            Some(&PtavEvent::Finished {
                success: true,
                iterations: 4
            })
        );
        let fallback_plans = events
            .iter()
            .filter(|e| matches!(e, PtavEvent::PlanReady { fallback: true, .. }))
            .count();
        assert_eq!(fallback_plans, 4);
    }

    #[tokio::test]
    async fn test_ptof_prefers_finalized_sql() {
        let llm = Arc::new(
            MockLlmClient::new().with_reply("finalize", json!({ "sql": MONTHLY_SQL }).to_string()),
        );
        let orch = OrchestratorBuilder::new(AppConfig::default())
            .with_llm(llm)
            .with_data_source(Arc::new(sales_db()))
            .build();

        let output = orch.execute(monthly_input(), ExecutionMode::Ptof).await;

        assert!(output.success, "output: {output:?}");
        assert_eq!(output.result, MONTHLY_SQL);
        assert_eq!(output.metadata["finalize_source"], json!("llm"));
        assert_eq!(tool_trace(&output), vec!["time.window"]);
    }

    #[tokio::test]
    async fn test_task_sql_validation_applies_one_correction() {
        let orch = OrchestratorBuilder::new(AppConfig::default())
            .with_llm(Arc::new(MockLlmClient::new()))
            .with_data_source(Arc::new(sales_db()))
            .build();
        let input = monthly_input().with_task_driven(
            "current_sql",
            json!("SELECT SUM(amount) FROM sale WHERE sale_date BETWEEN '{{start_date}}' AND '{{end_date}}'"),
        );

        let output = orch.execute(input, ExecutionMode::TaskSqlValidation).await;

        assert!(output.success, "output: {output:?}");
        assert!(output.result.contains("FROM sales"));
        assert!(output.result.contains("sale_date"));
        assert_eq!(output.metadata["corrected"], json!(true));
        assert_eq!(output.metadata["mode"], json!("task_sql_validation"));
    }

    #[tokio::test]
    async fn test_task_sql_validation_without_sql_fails() {
        let orch = OrchestratorBuilder::new(AppConfig::default())
            .with_llm(Arc::new(MockLlmClient::new()))
            .with_data_source(Arc::new(sales_db()))
            .build();

        let output = orch
            .execute(monthly_input(), ExecutionMode::TaskSqlValidation)
            .await;

        assert!(!output.success);
        assert_eq!(output.metadata["error_kind"], json!("invalid_input"));
        assert_eq!(output.metadata["recoverable"], json!(false));
    }

    #[tokio::test]
    async fn test_chart_generation_writes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.app.output_dir = dir.path().to_path_buf();
        let orch = OrchestratorBuilder::new(config)
            .with_llm(Arc::new(MockLlmClient::new()))
            .with_data_source(Arc::new(sales_db()))
            .build();
        let input = monthly_input()
            .with_task_driven("current_sql", json!(REGION_SQL))
            .with_output_kind(OutputKind::Chart);

        let output = orch
            .execute(input, ExecutionMode::ReportChartGeneration)
            .await;

        assert!(output.success, "output: {output:?}");
        assert!(output.result.starts_with(&dir.path().display().to_string()));
        assert!(std::path::Path::new(&output.result).exists());
        assert_eq!(
            tool_trace(&output),
            vec![
                "time.window",
                "sql.execute",
                "data.quality",
                "chart.spec",
                "word_chart_generator"
            ]
        );
    }

    #[tokio::test]
    async fn test_chart_generation_requires_sql() {
        let orch = OrchestratorBuilder::new(AppConfig::default())
            .with_llm(Arc::new(MockLlmClient::new()))
            .with_data_source(Arc::new(sales_db()))
            .build();
        let input = monthly_input().with_output_kind(OutputKind::Chart);

        let output = orch
            .execute(input, ExecutionMode::ReportChartGeneration)
            .await;

        assert!(!output.success);
        assert!(output.error().unwrap().contains("SQL"));
    }
}
