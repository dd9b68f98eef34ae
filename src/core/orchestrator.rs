//! 编排器：按模式分发并保证总是返回 AgentOutput
//!
//! ptav 走迭代循环；ptof / task_sql_validation / report_chart_generation 是单次或固定流水线。
//! 所有模式都在 catch_unwind 边界内执行，内部 panic 也映射为失败输出。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{
    AgentInput, AgentOutput, ErrorKind, ExecutionContext, ExecutionMode, RecoveryEngine,
    ToolError,
};
use crate::llm::{LlmClient, LlmPolicy};
use crate::memory::{ContextUpdate, SqlSource};
use crate::ptav::{ptav_loop, GoalValidator, Plan, PlanStep, Planner, PtavEvent, PtavSession};
use crate::tools::sql_draft::extract_sql;
use crate::tools::sql_validate::referenced_tables;
use crate::tools::{ExecutionResult, ToolExecutor, ToolRegistry};

/// PTOF 收尾时拼入 prompt 的观察条数上限
const FINALIZE_OBSERVATIONS: usize = 8;

pub struct Orchestrator {
    config: AppConfig,
    llm: Arc<dyn LlmClient>,
    planner: Planner,
    executor: ToolExecutor,
    validator: GoalValidator,
    recovery: RecoveryEngine,
    event_tx: Option<UnboundedSender<PtavEvent>>,
}

impl Orchestrator {
    pub(crate) fn from_parts(
        config: AppConfig,
        llm: Arc<dyn LlmClient>,
        registry: Arc<ToolRegistry>,
        event_tx: Option<UnboundedSender<PtavEvent>>,
    ) -> Self {
        Self {
            planner: Planner::new(llm.clone()),
            executor: ToolExecutor::new(registry, config.tools.tool_timeout_secs),
            validator: GoalValidator::new(config.agent.max_sql_fix_attempts),
            recovery: RecoveryEngine::new(&config.agent),
            config,
            llm,
            event_tx,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        self.executor.registry()
    }

    pub async fn execute(&self, input: AgentInput, mode: ExecutionMode) -> AgentOutput {
        self.execute_with_cancel(input, mode, CancellationToken::new())
            .await
    }

    /// 执行指定模式；取消令牌在每轮迭代边界与工具调用期间生效
    pub async fn execute_with_cancel(
        &self,
        input: AgentInput,
        mode: ExecutionMode,
        cancel_token: CancellationToken,
    ) -> AgentOutput {
        tracing::info!(mode = %mode, placeholder = %input.placeholder.id, "execute");
        let run = async {
            match mode {
                ExecutionMode::Ptav => {
                    let mut session = PtavSession::new(
                        &self.planner,
                        &self.executor,
                        &self.validator,
                        &self.recovery,
                        &self.config.agent,
                    )
                    .with_cancel_token(cancel_token.clone());
                    if let Some(tx) = &self.event_tx {
                        session = session.with_event_tx(tx);
                    }
                    ptav_loop(&session, input).await
                }
                ExecutionMode::Ptof => self.run_ptof(input).await,
                ExecutionMode::TaskSqlValidation => self.run_task_sql_validation(input).await,
                ExecutionMode::ReportChartGeneration => self.run_chart_generation(input).await,
            }
        };

        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(output) => output,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(mode = %mode, panic = %detail, "orchestrator panicked");
                let mut metadata = Map::new();
                metadata.insert("mode".into(), json!(mode.as_str()));
                AgentOutput::failure("", format!("internal error: {detail}"), metadata)
            }
        }
    }

    /// Plan → Tool → Observe → Finalize，各一次
    async fn run_ptof(&self, input: AgentInput) -> AgentOutput {
        let mut ctx = seeded_context(&input);
        let current = input.enriched(ctx.context_memory(), ctx.pool.schema_view(&input.schema));

        let outcome = match self.planner.generate_plan(&current, self.registry()).await {
            Ok(o) => o,
            Err(e) => {
                let metadata = mode_metadata(&ctx, ExecutionMode::Ptof);
                return AgentOutput::failure(ctx.current_sql(), format!("规划失败：{e}"), metadata);
            }
        };
        let result = self
            .executor
            .execute(&outcome.plan, &current, &ctx.pool)
            .await;
        ctx.apply(1, outcome.plan, &result);

        let (sql, source) = match self.finalize(&current, &ctx).await {
            Some(sql) => (sql, "llm"),
            None => (ctx.current_sql().to_string(), "resource_pool"),
        };
        let mut metadata = mode_metadata(&ctx, ExecutionMode::Ptof);
        metadata.insert("finalize_source".into(), json!(source));
        if sql.is_empty() {
            let error = ctx
                .last_error
                .clone()
                .unwrap_or_else(|| "PTOF 未产出 SQL".to_string());
            return AgentOutput::failure("", error, metadata);
        }
        AgentOutput::success(sql, metadata)
    }

    /// 收尾：让 LLM 依据观察给出最终 SQL（JSON {"sql": ...}）
    async fn finalize(&self, input: &AgentInput, ctx: &ExecutionContext) -> Option<String> {
        let skip = ctx
            .accumulated_observations
            .len()
            .saturating_sub(FINALIZE_OBSERVATIONS);
        let observations = ctx.accumulated_observations[skip..].join("\n- ");
        let prompt = format!(
            "根据以下信息给出占位符的最终 SQL。\n\n## 任务\n{}\n\n## 观察\n- {}\n\n## 当前 SQL\n{}\n\n只输出 {{\"sql\": \"...\"}}；无法给出时输出 {{\"sql\": \"\"}}。",
            input.goal(),
            observations,
            ctx.pool.current_sql().unwrap_or("（无）"),
        );
        let policy = LlmPolicy::new("finalize")
            .with_output_kind(input.constraints.output_kind)
            .with_user(input.user_id.clone());
        match self.llm.call(&prompt, &policy).await {
            Ok(text) => extract_sql(&text),
            Err(e) => {
                tracing::warn!(error = %e, "finalize call failed, using resource pool sql");
                None
            }
        }
    }

    /// 固定三步：时间窗口 → schema 确认 → SQL 校验，至多修正一次
    async fn run_task_sql_validation(&self, input: AgentInput) -> AgentOutput {
        let mode = ExecutionMode::TaskSqlValidation;
        let mut ctx = seeded_context(&input);
        let mut step = 0usize;

        if ctx.pool.time_window().is_none() && self.registry().contains("time.window") {
            step += 1;
            self.run_step(&mut ctx, &input, step, "time.window", json!({}))
                .await;
        }
        if self.registry().contains("schema.list_columns") {
            step += 1;
            let tables: Vec<String> = ctx
                .pool
                .current_sql()
                .map(referenced_tables)
                .unwrap_or_default();
            let args = if tables.is_empty() {
                json!({})
            } else {
                json!({ "tables": tables })
            };
            let result = self
                .run_step(&mut ctx, &input, step, "schema.list_columns", args)
                .await;
            if ctx.pool.column_details().is_empty() {
                let error = result
                    .error
                    .unwrap_or_else(|| ToolError::new(ErrorKind::SchemaMissing, "Schema 不可用"));
                return validation_failure(&ctx, mode, error.message, error.kind, false);
            }
        }

        if ctx.pool.current_sql().is_none() {
            return validation_failure(
                &ctx,
                mode,
                "没有待校验的 SQL（task_driven_context.current_sql）".to_string(),
                ErrorKind::InvalidInput,
                false,
            );
        }

        let mut corrected = false;
        loop {
            step += 1;
            let result = self
                .run_step(&mut ctx, &input, step, "sql.validate", json!({}))
                .await;
            if let Some(err) = result.error.clone() {
                return validation_failure(&ctx, mode, err.message, err.kind, corrected);
            }
            if ctx.pool.sql_validated() {
                let mut metadata = mode_metadata(&ctx, mode);
                metadata.insert("corrected".into(), json!(corrected));
                return AgentOutput::success(ctx.current_sql(), metadata);
            }
            if corrected {
                let issues = ctx.pool.last_issues().join("; ");
                return validation_failure(&ctx, mode, issues, ErrorKind::SqlSemantic, corrected);
            }

            corrected = true;
            match correction_from(&result) {
                Some(sql) => ctx.apply_correction(sql),
                None if self.registry().contains("sql.refine") => {
                    step += 1;
                    let refined = self
                        .run_step(&mut ctx, &input, step, "sql.refine", json!({}))
                        .await;
                    if let Some(err) = refined.error {
                        return validation_failure(&ctx, mode, err.message, err.kind, corrected);
                    }
                }
                None => {
                    let issues = ctx.pool.last_issues().join("; ");
                    return validation_failure(&ctx, mode, issues, ErrorKind::SqlSemantic, false);
                }
            }
        }
    }

    /// 固定流水线：（执行）→ 数据质量 → 图表规格 → 渲染
    async fn run_chart_generation(&self, input: AgentInput) -> AgentOutput {
        let mode = ExecutionMode::ReportChartGeneration;
        let mut ctx = seeded_context(&input);
        let mut step = 0usize;

        if ctx.pool.last_execution().is_none() {
            if ctx.pool.current_sql().is_none() {
                return AgentOutput::failure(
                    "",
                    "图表生成需要 SQL（task_driven_context.current_sql）",
                    mode_metadata(&ctx, mode),
                );
            }
            if ctx.pool.time_window().is_none() && self.registry().contains("time.window") {
                step += 1;
                self.run_step(&mut ctx, &input, step, "time.window", json!({}))
                    .await;
            }
            step += 1;
            let result = self
                .run_step(&mut ctx, &input, step, "sql.execute", json!({}))
                .await;
            if !ctx.pool.sql_executed_successfully() {
                let error = result
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "SQL 执行失败".to_string());
                return AgentOutput::failure("", error, mode_metadata(&ctx, mode));
            }
        }

        for tool in ["data.quality", "chart.spec", "word_chart_generator"] {
            step += 1;
            let result = self.run_step(&mut ctx, &input, step, tool, json!({})).await;
            if let Some(err) = result.error {
                return AgentOutput::failure(
                    "",
                    format!("{tool} 失败：{}", err.message),
                    mode_metadata(&ctx, mode),
                );
            }
            if tool == "data.quality" && ctx.pool.quality_passed() == Some(false) {
                let issues = ctx.pool.last_issues().join("; ");
                return AgentOutput::failure(
                    "",
                    format!("数据质量未通过：{issues}"),
                    mode_metadata(&ctx, mode),
                );
            }
        }

        match ctx.pool.chart_image_path() {
            Some(path) => AgentOutput::success(path, mode_metadata(&ctx, mode)),
            None => AgentOutput::failure("", "未生成图表文件", mode_metadata(&ctx, mode)),
        }
    }

    /// 固定流水线的一步：按名调用工具并合并结果
    async fn run_step(
        &self,
        ctx: &mut ExecutionContext,
        input: &AgentInput,
        step: usize,
        tool: &str,
        args: Value,
    ) -> ExecutionResult {
        let current = input.enriched(ctx.context_memory(), ctx.pool.schema_view(&input.schema));
        let result = self.executor.invoke(tool, &args, &current, &ctx.pool).await;
        let plan = Plan {
            thought: "固定流水线步骤".to_string(),
            steps: vec![PlanStep::tool_call(tool, "fixed pipeline").with_input(args)],
            expected_outcome: String::new(),
        };
        ctx.apply(step, plan, &result);
        result
    }
}

/// 用调用方提供的 schema、SQL 与时间窗口初始化上下文
fn seeded_context(input: &AgentInput) -> ExecutionContext {
    let mut ctx = ExecutionContext::new();
    ctx.pool.seed_schema(&input.schema);
    if let Some(sql) = input.provided_sql() {
        ctx.pool.update(ContextUpdate::Sql {
            sql: sql.to_string(),
            source: SqlSource::Provided,
        });
    }
    if let Some(window) = &input.task_context.time_window {
        ctx.pool.update(ContextUpdate::TimeWindow {
            window: window.clone(),
        });
    }
    ctx
}

fn correction_from(result: &ExecutionResult) -> Option<String> {
    result.updates.iter().find_map(|u| match u {
        ContextUpdate::Validation {
            corrected_sql: Some(sql),
            ..
        } if !sql.trim().is_empty() => Some(sql.clone()),
        _ => None,
    })
}

fn validation_failure(
    ctx: &ExecutionContext,
    mode: ExecutionMode,
    error: String,
    kind: ErrorKind,
    corrected: bool,
) -> AgentOutput {
    let mut metadata = mode_metadata(ctx, mode);
    metadata.insert("error_kind".into(), json!(kind.as_str()));
    metadata.insert("recoverable".into(), json!(RecoveryEngine::is_recoverable(kind)));
    metadata.insert("corrected".into(), json!(corrected));
    metadata.insert("issues".into(), json!(ctx.pool.last_issues()));
    AgentOutput::failure(ctx.current_sql(), error, metadata)
}

fn mode_metadata(ctx: &ExecutionContext, mode: ExecutionMode) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("mode".into(), json!(mode.as_str()));
    metadata.insert("session_id".into(), json!(ctx.session_id));
    metadata.insert("steps".into(), json!(ctx.iterations()));
    metadata.insert("sql_fix_attempts".into(), json!(ctx.sql_fix_attempts));
    metadata.insert("database_validated".into(), json!(ctx.pool.database_validated()));
    let tools: Vec<Value> = ctx
        .execution_history
        .iter()
        .map(|r| json!(r.tool))
        .collect();
    metadata.insert("tool_trace".into(), Value::Array(tools));
    if let Some(sql) = ctx.pool.current_sql() {
        metadata.insert("sql".into(), json!(sql));
    }
    if let Some(window) = ctx.pool.time_window() {
        metadata.insert("time_window".into(), json!(window.to_string()));
    }
    if let Some(summary) = ctx.pool.last_execution() {
        metadata.insert("row_count".into(), json!(summary.row_count));
    }
    if let Some(err) = &ctx.last_error {
        metadata.insert("last_error".into(), json!(err));
    }
    metadata
}
