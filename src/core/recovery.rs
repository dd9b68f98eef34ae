//! 错误恢复引擎：基于执行历史的提前退出模式分析
//!
//! 只匹配工具在源头打上的 ErrorKind 标签，不做字符串搜索。
//! 每种退出都附带可读原因与可操作建议，避免在无望的情况下耗尽迭代预算。

use crate::config::AgentSection;
use crate::core::{AgentInput, ErrorKind, ExecutionContext, ExitPattern, RecoveryAction};

#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    min_iterations: usize,
    repeated_failure_threshold: usize,
    schema_fetch_attempts: usize,
    connection_error_threshold: usize,
    no_progress_iterations: usize,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(&AgentSection::default())
    }
}

impl RecoveryEngine {
    pub fn new(agent: &AgentSection) -> Self {
        Self {
            min_iterations: agent.early_exit_min_iterations,
            repeated_failure_threshold: agent.repeated_failure_threshold,
            schema_fetch_attempts: agent.schema_fetch_attempts,
            connection_error_threshold: agent.connection_error_threshold,
            no_progress_iterations: agent.no_progress_iterations,
        }
    }

    /// 分析执行历史，决定继续还是提前退出
    pub fn analyze(&self, ctx: &ExecutionContext, input: &AgentInput) -> RecoveryAction {
        let history = &ctx.execution_history;
        let iterations = history.len();
        if iterations < self.min_iterations {
            return RecoveryAction::Continue;
        }

        let schema_attempts = history
            .iter()
            .filter(|r| r.tool.as_deref().is_some_and(|t| t.starts_with("schema.")))
            .count();
        if ctx.pool.column_details().is_empty()
            && input.schema.is_empty()
            && schema_attempts >= self.schema_fetch_attempts
        {
            return exit(
                ExitPattern::SchemaUnavailable,
                format!("Schema 不可用：{schema_attempts} 次获取后仍没有任何表结构"),
                "请检查数据源配置与访问权限，确认目标库中存在业务表",
            );
        }

        let connection_errors = history
            .iter()
            .filter(|r| r.error_kind == Some(ErrorKind::Connection))
            .count();
        if connection_errors >= self.connection_error_threshold {
            return exit(
                ExitPattern::ConnectionUnstable,
                format!("数据库连接不稳定：已出现 {connection_errors} 次连接错误"),
                "请检查数据库网络连通性与连接配置后重试",
            );
        }

        let n = self.repeated_failure_threshold;
        if n > 0 && iterations >= n {
            let tail = &history[iterations - n..];
            let same_tool = tail
                .iter()
                .all(|r| r.tool.is_some() && r.tool == tail[0].tool);
            if same_tool && tail.iter().all(|r| !r.success) {
                let tool = tail[0].tool.clone().unwrap_or_default();
                return exit(
                    ExitPattern::RepeatedFailure,
                    format!("工具 {tool} 连续 {n} 次执行失败"),
                    match tail[n - 1].error_kind {
                        Some(ErrorKind::Llm) => "请检查 LLM 服务可用性与 API Key 配置",
                        Some(ErrorKind::Timeout) => "请检查数据源负载或调大工具超时时间",
                        Some(ErrorKind::Permission) => "请为查询账号授予所需表的只读权限",
                        _ => "请检查该工具的输入与依赖配置，或简化占位符描述后重试",
                    },
                );
            }
        }

        if iterations >= self.no_progress_iterations && ctx.pool.current_sql().is_none() {
            return exit(
                ExitPattern::NoProgress,
                format!("{iterations} 轮迭代后仍未生成 SQL"),
                "请补充更明确的占位符描述（指标、维度、时间范围）或提供表结构",
            );
        }

        RecoveryAction::Continue
    }

    /// 错误是否可通过修正 SQL 恢复（task_sql_validation 模式输出用）
    pub fn is_recoverable(kind: ErrorKind) -> bool {
        matches!(
            kind,
            ErrorKind::SqlSyntax | ErrorKind::SqlSemantic | ErrorKind::Timeout | ErrorKind::Llm
        )
    }
}

fn exit(pattern: ExitPattern, reason: String, suggestion: &str) -> RecoveryAction {
    tracing::warn!(pattern = pattern.as_str(), reason = %reason, "early exit");
    RecoveryAction::EarlyExit {
        pattern,
        reason,
        suggestion: suggestion.to_string(),
    }
}
