//! PTAV 主循环
//!
//! Plan -> Tool -> Active（合并上下文）-> 模式分析 -> Validate -> 下一轮 Plan；
//! 受最大迭代数与墙钟超时双重约束，任何终止路径都产出 AgentOutput（失败时携带最后一次 SQL）。

use serde_json::{json, Map, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::AgentSection;
use crate::core::{
    AgentInput, AgentOutput, ExecutionContext, ExitPattern, LoopPhase, RecoveryAction,
    RecoveryEngine,
};
use crate::memory::{ContextUpdate, SqlSource};
use crate::ptav::{GoalValidator, Planner, PtavEvent, Stage};
use crate::tools::ToolExecutor;

/// 观察预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;
/// 输出 metadata 中保留的最近观察条数
const METADATA_OBSERVATIONS: usize = 5;
/// 计入修复次数的重写工具
const REFINE_TOOL: &str = "sql.refine";

/// PTAV 会话配置：必需组件 + 可选取消令牌与事件通道
pub struct PtavSession<'a> {
    pub planner: &'a Planner,
    pub executor: &'a ToolExecutor,
    pub validator: &'a GoalValidator,
    pub recovery: &'a RecoveryEngine,
    pub agent: &'a AgentSection,
    pub cancel_token: CancellationToken,
    pub event_tx: Option<&'a UnboundedSender<PtavEvent>>,
}

impl<'a> PtavSession<'a> {
    pub fn new(
        planner: &'a Planner,
        executor: &'a ToolExecutor,
        validator: &'a GoalValidator,
        recovery: &'a RecoveryEngine,
        agent: &'a AgentSection,
    ) -> Self {
        Self {
            planner,
            executor,
            validator,
            recovery,
            agent,
            cancel_token: CancellationToken::new(),
            event_tx: None,
        }
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn with_event_tx(mut self, tx: &'a UnboundedSender<PtavEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn send(&self, ev: PtavEvent) {
        if let Some(tx) = self.event_tx {
            let _ = tx.send(ev);
        }
    }
}

enum Termination {
    Achieved {
        result: String,
        reason: String,
    },
    Aborted {
        reason: String,
        exit: Option<(ExitPattern, String)>,
    },
}

impl Termination {
    fn aborted(reason: impl Into<String>) -> Self {
        Termination::Aborted {
            reason: reason.into(),
            exit: None,
        }
    }
}

/// 执行 PTAV 循环
pub async fn ptav_loop(session: &PtavSession<'_>, input: AgentInput) -> AgentOutput {
    let mut ctx = ExecutionContext::new();
    let stage = Stage::infer(&input);
    tracing::info!(
        session_id = %ctx.session_id,
        stage = %stage,
        goal = %input.goal(),
        "ptav loop started"
    );

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

    let base = input;
    let mut current = base.enriched(ctx.context_memory(), ctx.pool.schema_view(&base.schema));
    let termination = run_iterations(session, &base, &mut current, &mut ctx).await;

    let output = finish(&mut ctx, stage, termination);
    session.send(PtavEvent::Finished {
        success: output.success,
        iterations: ctx.iterations(),
    });
    tracing::info!(
        session_id = %ctx.session_id,
        success = output.success,
        iterations = ctx.iterations(),
        elapsed_ms = ctx.elapsed().as_millis() as u64,
        "ptav loop finished"
    );
    output
}

async fn run_iterations(
    session: &PtavSession<'_>,
    base: &AgentInput,
    current: &mut AgentInput,
    ctx: &mut ExecutionContext,
) -> Termination {
    let max_iterations = session.agent.max_iterations;
    let timeout = session.agent.iteration_timeout();
    let mut iteration = 0usize;

    loop {
        if session.cancel_token.is_cancelled() {
            return Termination::aborted("cancelled");
        }
        if ctx.elapsed() >= timeout {
            return Termination::aborted(format!(
                "执行超时：超过 {} 秒仍未完成",
                timeout.as_secs()
            ));
        }
        if iteration >= max_iterations {
            return Termination::aborted(format!("达到最大迭代次数 {max_iterations} 仍未完成"));
        }
        iteration += 1;
        session.send(PtavEvent::IterationStarted {
            iteration,
            max_iterations,
        });

        // PLANNING
        let outcome = match session
            .planner
            .generate_plan(current, session.executor.registry())
            .await
        {
            Ok(o) => o,
            Err(e) => {
                ctx.last_error = Some(e.to_string());
                return Termination::aborted(format!("规划失败：{e}"));
            }
        };
        tracing::debug!(iteration, tool = ?outcome.plan.first_tool(), fallback = outcome.source.is_fallback(), "plan");
        session.send(PtavEvent::PlanReady {
            stage: outcome.stage.to_string(),
            tool: outcome.plan.first_tool().map(str::to_string),
            fallback: outcome.source.is_fallback(),
        });

        if outcome.plan.first_tool() == Some(REFINE_TOOL) {
            if let Some(verdict) = session.validator.check_refine(current, ctx) {
                tracing::warn!(iteration, attempts = ctx.sql_fix_attempts, "refine refused, fix attempts exhausted");
                ctx.validation_results.push(verdict.clone());
                return Termination::aborted(verdict.reason);
            }
        }

        // EXECUTING
        ctx.transition(LoopPhase::Executing);
        let result = tokio::select! {
            _ = session.cancel_token.cancelled() => return Termination::aborted("cancelled"),
            r = session.executor.execute(&outcome.plan, current, &ctx.pool) => r,
        };
        if let Some(err) = &result.error {
            tracing::warn!(iteration, tool = ?result.tool, kind = err.kind.as_str(), error = %err.message, "tool failed");
        }
        session.send(PtavEvent::ToolResult {
            tool: result.tool.clone(),
            success: result.success,
            preview: observation_preview(&result.observations),
        });
        ctx.apply(iteration, outcome.plan, &result);

        // VALIDATING
        ctx.transition(LoopPhase::Validating);
        if let RecoveryAction::EarlyExit {
            pattern,
            reason,
            suggestion,
        } = session.recovery.analyze(ctx, current)
        {
            session.send(PtavEvent::EarlyExit {
                pattern: pattern.as_str().to_string(),
                reason: reason.clone(),
                suggestion: suggestion.clone(),
            });
            return Termination::Aborted {
                reason,
                exit: Some((pattern, suggestion)),
            };
        }

        let verdict = session.validator.validate(current, ctx, &result);
        tracing::debug!(iteration, achieved = verdict.goal_achieved, cont = verdict.should_continue, reason = %verdict.reason, "validation");
        ctx.validation_results.push(verdict.clone());
        session.send(PtavEvent::Validation {
            goal_achieved: verdict.goal_achieved,
            should_continue: verdict.should_continue,
            reason: verdict.reason.clone(),
        });

        if verdict.goal_achieved {
            ctx.goal_achieved = true;
            return Termination::Achieved {
                result: verdict.result.unwrap_or_else(|| ctx.current_sql().to_string()),
                reason: verdict.reason,
            };
        }
        if !verdict.should_continue {
            return Termination::aborted(verdict.reason);
        }
        if let Some(corrected) = verdict.correction {
            ctx.apply_correction(corrected);
        }

        ctx.transition(LoopPhase::Planning);
        *current = base.enriched(ctx.context_memory(), ctx.pool.schema_view(&base.schema));
    }
}

fn finish(ctx: &mut ExecutionContext, stage: Stage, termination: Termination) -> AgentOutput {
    let next = match termination {
        Termination::Achieved { .. } => LoopPhase::Finalized,
        Termination::Aborted { .. } => LoopPhase::Aborted,
    };
    ctx.transition(next);
    let mut metadata = base_metadata(ctx, stage);
    metadata.insert("phase".into(), json!(ctx.phase));
    match termination {
        Termination::Achieved { result, reason } => {
            metadata.insert("reason".into(), json!(reason));
            AgentOutput::success(result, metadata)
        }
        Termination::Aborted { reason, exit } => {
            metadata.insert("reason".into(), json!(reason));
            if let Some((pattern, suggestion)) = exit {
                metadata.insert("exit_pattern".into(), json!(pattern.as_str()));
                metadata.insert("suggestion".into(), json!(suggestion));
            }
            if let Some(err) = &ctx.last_error {
                metadata.insert("last_error".into(), json!(err));
            }
            tracing::warn!(session_id = %ctx.session_id, reason = %reason, "ptav loop aborted");
            AgentOutput::failure(ctx.current_sql(), reason, metadata)
        }
    }
}

fn base_metadata(ctx: &ExecutionContext, stage: Stage) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("mode".into(), json!("ptav"));
    metadata.insert("session_id".into(), json!(ctx.session_id));
    metadata.insert("stage".into(), json!(stage));
    metadata.insert("iterations".into(), json!(ctx.iterations()));
    metadata.insert("sql_fix_attempts".into(), json!(ctx.sql_fix_attempts));
    metadata.insert("elapsed_ms".into(), json!(ctx.elapsed().as_millis() as u64));
    metadata.insert("database_validated".into(), json!(ctx.pool.database_validated()));
    if let Some(sql) = ctx.pool.current_sql() {
        metadata.insert("sql".into(), json!(sql));
    }
    if let Some(window) = ctx.pool.time_window() {
        metadata.insert("time_window".into(), json!(window.to_string()));
    }
    if let Some(summary) = ctx.pool.last_execution() {
        metadata.insert("row_count".into(), json!(summary.row_count));
        metadata.insert("sample_rows".into(), json!(summary.sample_rows));
    }
    let tools: Vec<Value> = ctx
        .execution_history
        .iter()
        .map(|r| json!(r.tool))
        .collect();
    metadata.insert("tool_trace".into(), Value::Array(tools));
    let skip = ctx
        .accumulated_observations
        .len()
        .saturating_sub(METADATA_OBSERVATIONS);
    metadata.insert(
        "observations".into(),
        json!(&ctx.accumulated_observations[skip..]),
    );
    metadata
}

fn observation_preview(observations: &[String]) -> String {
    let joined = observations.join("; ");
    if joined.chars().count() > OBSERVATION_PREVIEW_CHARS {
        format!(
            "{}...",
            joined.chars().take(OBSERVATION_PREVIEW_CHARS).collect::<String>()
        )
    } else {
        joined
    }
}
