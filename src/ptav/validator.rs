//! 目标达成判定与 SQL 修复子循环
//!
//! 判定顺序：图表路径 → 执行成功且有数据 → 校验通过但仅因连接失败 → 修正建议（受修复上限约束）
//! → 执行失败且无修正 → 继续。sql.refine 在执行前由 check_refine 按同一上限拦截。

use serde::Serialize;

use crate::core::{AgentInput, ErrorKind, ExecutionContext, OutputKind};
use crate::memory::ContextUpdate;
use crate::tools::ExecutionResult;

/// 一次判定的结论
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationOutcome {
    pub goal_achieved: bool,
    pub should_continue: bool,
    pub reason: String,
    /// 达成时的最终结果（SQL 或图表路径）
    pub result: Option<String>,
    /// 需要由编排器施加的修正 SQL
    pub correction: Option<String>,
}

impl ValidationOutcome {
    fn achieved(result: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            goal_achieved: true,
            should_continue: false,
            reason: reason.into(),
            result: Some(result.into()),
            correction: None,
        }
    }

    fn proceed(reason: impl Into<String>) -> Self {
        Self {
            goal_achieved: false,
            should_continue: true,
            reason: reason.into(),
            result: None,
            correction: None,
        }
    }

    fn stop(reason: impl Into<String>) -> Self {
        Self {
            goal_achieved: false,
            should_continue: false,
            reason: reason.into(),
            result: None,
            correction: None,
        }
    }
}

pub struct GoalValidator {
    max_fix_attempts: u32,
}

impl GoalValidator {
    pub fn new(max_fix_attempts: u32) -> Self {
        Self { max_fix_attempts }
    }

    /// 本次请求的修复上限：配置与请求约束取较小者
    pub fn fix_cap(&self, input: &AgentInput) -> u32 {
        self.max_fix_attempts.min(input.constraints.max_attempts)
    }

    /// 计划要执行 sql.refine 时检查修复次数；已用尽则给出终止结论，工具不会被调用
    pub fn check_refine(&self, input: &AgentInput, ctx: &ExecutionContext) -> Option<ValidationOutcome> {
        let cap = self.fix_cap(input);
        (ctx.sql_fix_attempts >= cap).then(|| ValidationOutcome::stop(fix_exhausted(cap)))
    }

    pub fn validate(
        &self,
        input: &AgentInput,
        ctx: &ExecutionContext,
        exec: &ExecutionResult,
    ) -> ValidationOutcome {
        let pool = &ctx.pool;
        let sql = pool.current_sql().unwrap_or_default();

        if let Some(path) = pool.chart_image_path() {
            return ValidationOutcome::achieved(path, "图表已生成");
        }
        if input.constraints.output_kind == OutputKind::Chart {
            // 图表任务只认图表文件；SQL 成功执行只是中间步骤
            return match execution_failure(exec) {
                Some(kind) if kind != ErrorKind::Connection && !has_correction(exec) => {
                    ValidationOutcome::stop(format!("SQL 执行失败：{}", error_text(exec)))
                }
                _ => ValidationOutcome::proceed("等待图表生成"),
            };
        }

        if !sql.is_empty() && pool.sql_executed_successfully() {
            match pool.last_execution() {
                Some(summary) if summary.row_count > 0 => {
                    return ValidationOutcome::achieved(
                        sql,
                        format!("SQL 执行成功，返回 {} 行", summary.row_count),
                    );
                }
                _ => return ValidationOutcome::proceed("SQL 执行成功但无数据，需要调整"),
            }
        }

        if !sql.is_empty() && pool.sql_validated() && exec.error_kind() == Some(ErrorKind::Connection)
        {
            return ValidationOutcome::achieved(
                sql,
                "SQL 已通过校验，数据库连接失败未能执行（视为成功）",
            );
        }

        let cap = self.fix_cap(input);
        if let Some(corrected) = corrected_sql(exec) {
            if ctx.sql_fix_attempts >= cap {
                return ValidationOutcome::stop(fix_exhausted(cap));
            }
            let mut outcome = ValidationOutcome::proceed(format!(
                "校验发现问题，应用修正（第 {} 次）",
                ctx.sql_fix_attempts + 1
            ));
            outcome.correction = Some(corrected.to_string());
            return outcome;
        }
        if !pool.last_issues().is_empty() && !pool.sql_validated() && ctx.sql_fix_attempts >= cap {
            return ValidationOutcome::stop(fix_exhausted(cap));
        }

        if execution_failure(exec).is_some() {
            return ValidationOutcome::stop(format!("SQL 执行失败：{}", error_text(exec)));
        }

        match exec.tool.as_deref() {
            Some(tool) if exec.success => ValidationOutcome::proceed(format!("{tool} 完成，继续规划")),
            Some(tool) => ValidationOutcome::proceed(format!("{tool} 失败：{}", error_text(exec))),
            None => ValidationOutcome::proceed("本轮没有执行工具"),
        }
    }
}

fn fix_exhausted(cap: u32) -> String {
    format!("SQL修复失败：{cap}次尝试后仍有问题")
}

/// 本轮数据库执行失败的错误标签
fn execution_failure(exec: &ExecutionResult) -> Option<ErrorKind> {
    exec.updates.iter().find_map(|u| match u {
        ContextUpdate::Execution {
            success: false,
            error,
            ..
        } => Some(error.as_ref().map(|e| e.kind).unwrap_or(ErrorKind::Unknown)),
        _ => None,
    })
}

fn corrected_sql(exec: &ExecutionResult) -> Option<&str> {
    exec.updates.iter().find_map(|u| match u {
        ContextUpdate::Validation {
            passed: false,
            corrected_sql: Some(sql),
            ..
        } if !sql.trim().is_empty() => Some(sql.as_str()),
        _ => None,
    })
}

fn has_correction(exec: &ExecutionResult) -> bool {
    corrected_sql(exec).is_some()
}

fn error_text(exec: &ExecutionResult) -> String {
    exec.error
        .as_ref()
        .map(|e| e.message.clone())
        .unwrap_or_else(|| "未知错误".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PlaceholderSpec, ToolError};
    use crate::memory::{ExecutionSummary, SqlSource};
    use serde_json::json;

    fn input() -> AgentInput {
        AgentInput::new("x", PlaceholderSpec::new("p", "统计本月销售额"))
    }

    fn exec(tool: &str, success: bool, updates: Vec<ContextUpdate>, error: Option<ToolError>) -> ExecutionResult {
        ExecutionResult {
            tool: Some(tool.to_string()),
            success,
            updates,
            observations: vec![],
            error,
            duration_ms: 1,
        }
    }

    fn ctx_with_sql(sql: &str) -> ExecutionContext {
        let mut ctx = ExecutionContext::new();
        ctx.pool.update(ContextUpdate::Sql {
            sql: sql.into(),
            source: SqlSource::Draft,
        });
        ctx
    }

    fn apply(ctx: &mut ExecutionContext, result: &ExecutionResult) {
        ctx.pool.apply_all(result.updates.clone());
    }

    #[test]
    fn test_achieved_when_executed_with_rows() {
        let mut ctx = ctx_with_sql("SELECT SUM(amount) FROM sales");
        let result = exec(
            "sql.execute",
            true,
            vec![ContextUpdate::Execution {
                success: true,
                summary: Some(ExecutionSummary {
                    columns: vec!["total".into()],
                    row_count: 1,
                    sample_rows: vec![json!({"total": 30})],
                }),
                error: None,
            }],
            None,
        );
        apply(&mut ctx, &result);
        let outcome = GoalValidator::new(3).validate(&input(), &ctx, &result);
        assert!(outcome.goal_achieved);
        assert_eq!(outcome.result.as_deref(), Some("SELECT SUM(amount) FROM sales"));
    }

    #[test]
    fn test_empty_result_continues() {
        let mut ctx = ctx_with_sql("SELECT 1 WHERE 0");
        let result = exec(
            "sql.execute",
            true,
            vec![ContextUpdate::Execution {
                success: true,
                summary: Some(ExecutionSummary::default()),
                error: None,
            }],
            None,
        );
        apply(&mut ctx, &result);
        let outcome = GoalValidator::new(3).validate(&input(), &ctx, &result);
        assert!(!outcome.goal_achieved);
        assert!(outcome.should_continue);
    }

    #[test]
    fn test_validated_sql_with_connection_failure_counts_as_success() {
        let mut ctx = ctx_with_sql("SELECT SUM(amount) FROM sales");
        ctx.pool.update(ContextUpdate::Validation {
            passed: true,
            issues: vec![],
            corrected_sql: None,
            database_validated: false,
        });
        let err = ToolError::new(ErrorKind::Connection, "connection refused");
        let result = exec(
            "sql.execute",
            false,
            vec![ContextUpdate::Execution {
                success: false,
                summary: None,
                error: Some(err.clone()),
            }],
            Some(err),
        );
        apply(&mut ctx, &result);
        let outcome = GoalValidator::new(3).validate(&input(), &ctx, &result);
        assert!(outcome.goal_achieved);
        assert!(outcome.reason.contains("连接"));
    }

    #[test]
    fn test_correction_until_cap() {
        let validator = GoalValidator::new(3);
        let mut ctx = ctx_with_sql("SELECT amout FROM sales");
        let result = exec(
            "sql.validate",
            true,
            vec![ContextUpdate::Validation {
                passed: false,
                issues: vec!["列 amout 不存在".into()],
                corrected_sql: Some("SELECT amount FROM sales".into()),
                database_validated: false,
            }],
            None,
        );
        apply(&mut ctx, &result);

        let outcome = validator.validate(&input(), &ctx, &result);
        assert!(outcome.should_continue);
        assert_eq!(outcome.correction.as_deref(), Some("SELECT amount FROM sales"));

        ctx.sql_fix_attempts = 3;
        let outcome = validator.validate(&input(), &ctx, &result);
        assert!(!outcome.should_continue);
        assert!(!outcome.goal_achieved);
        assert_eq!(outcome.reason, "SQL修复失败：3次尝试后仍有问题");
    }

    #[test]
    fn test_refine_refused_once_attempts_exhausted() {
        let validator = GoalValidator::new(3);
        let mut ctx = ctx_with_sql("SELECT amout FROM sales");
        ctx.sql_fix_attempts = 2;
        assert!(validator.check_refine(&input(), &ctx).is_none());

        ctx.sql_fix_attempts = 3;
        let outcome = validator.check_refine(&input(), &ctx).unwrap();
        assert!(!outcome.should_continue);
        assert_eq!(outcome.reason, "SQL修复失败：3次尝试后仍有问题");
    }

    #[test]
    fn test_cap_follows_request_constraint() {
        let validator = GoalValidator::new(3);
        let mut req = input();
        req.constraints.max_attempts = 1;
        assert_eq!(validator.fix_cap(&req), 1);
        assert_eq!(validator.fix_cap(&input()), 3);
    }

    #[test]
    fn test_execution_failure_without_correction_stops() {
        let mut ctx = ctx_with_sql("SELECT amount FROM sales");
        let err = ToolError::new(ErrorKind::SqlSemantic, "no such column: amount");
        let result = exec(
            "sql.execute",
            false,
            vec![ContextUpdate::Execution {
                success: false,
                summary: None,
                error: Some(err.clone()),
            }],
            Some(err),
        );
        apply(&mut ctx, &result);
        let outcome = GoalValidator::new(3).validate(&input(), &ctx, &result);
        assert!(!outcome.should_continue);
        assert!(outcome.reason.contains("no such column"));
    }

    #[test]
    fn test_other_tool_failure_continues() {
        let ctx = ExecutionContext::new();
        let result = exec(
            "schema.list_columns",
            false,
            vec![],
            Some(ToolError::new(ErrorKind::SchemaMissing, "无表")),
        );
        let outcome = GoalValidator::new(3).validate(&input(), &ctx, &result);
        assert!(outcome.should_continue);
    }

    #[test]
    fn test_chart_path_achieves() {
        let mut ctx = ExecutionContext::new();
        let result = exec(
            "word_chart_generator",
            true,
            vec![ContextUpdate::Chart {
                chart_spec: None,
                chart_image_path: Some("/tmp/chart.json".into()),
            }],
            None,
        );
        apply(&mut ctx, &result);
        let chart_input = input().with_output_kind(OutputKind::Chart);
        let outcome = GoalValidator::new(3).validate(&chart_input, &ctx, &result);
        assert!(outcome.goal_achieved);
        assert_eq!(outcome.result.as_deref(), Some("/tmp/chart.json"));
    }
}
