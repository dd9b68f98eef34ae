//! 循环状态：阶段状态机与 ExecutionContext
//!
//! ExecutionContext 由单个循环实例独占，循环结束产出 AgentOutput 后即丢弃，不持久化。

use std::time::Instant;

use serde::Serialize;

use crate::core::ErrorKind;
use crate::memory::{ContextMemory, ContextUpdate, ResourcePool, SqlSource};
use crate::ptav::{Plan, ValidationOutcome};
use crate::tools::ExecutionResult;

/// 循环阶段：PLANNING → EXECUTING → VALIDATING → (PLANNING | FINALIZED | ABORTED)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Planning,
    Executing,
    Validating,
    Finalized,
    Aborted,
}

impl LoopPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopPhase::Finalized | LoopPhase::Aborted)
    }

    /// 合法迁移；终态之后不再迁移
    pub fn can_transition_to(self, next: LoopPhase) -> bool {
        use LoopPhase::*;
        matches!(
            (self, next),
            (Planning, Executing)
                | (Executing, Validating)
                | (Validating, Planning)
                | (Validating, Finalized)
                | (Planning | Executing | Validating, Aborted)
        )
    }
}

/// 单轮记录
#[derive(Clone, Debug, Serialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub plan: Plan,
    pub tool: Option<String>,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub duration_ms: u64,
}

#[derive(Debug)]
pub struct ExecutionContext {
    pub session_id: String,
    pub phase: LoopPhase,
    pub validation_results: Vec<ValidationOutcome>,
    pub execution_history: Vec<IterationRecord>,
    pub accumulated_observations: Vec<String>,
    pub goal_achieved: bool,
    pub last_error: Option<String>,
    /// 已施加的修复次数（sql.refine 重写与 corrected_sql 均计入）
    pub sql_fix_attempts: u32,
    pub pool: ResourcePool,
    started: Instant,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            phase: LoopPhase::Planning,
            validation_results: Vec::new(),
            execution_history: Vec::new(),
            accumulated_observations: Vec::new(),
            goal_achieved: false,
            last_error: None,
            sql_fix_attempts: 0,
            pool: ResourcePool::new(),
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    pub fn iterations(&self) -> usize {
        self.execution_history.len()
    }

    /// 迁移阶段；非法迁移只记录告警，不改变状态
    pub fn transition(&mut self, next: LoopPhase) {
        if self.phase.can_transition_to(next) {
            self.phase = next;
        } else {
            tracing::warn!(from = ?self.phase, to = ?next, "ignored illegal phase transition");
        }
    }

    /// 合并一次执行结果：记录历史、写入 ResourcePool、统计修复次数
    pub fn apply(&mut self, iteration: usize, plan: Plan, result: &ExecutionResult) {
        let refined = result.updates.iter().any(|u| {
            matches!(
                u,
                ContextUpdate::Sql {
                    source: SqlSource::Refine,
                    ..
                }
            )
        });
        if refined {
            self.sql_fix_attempts += 1;
        }
        self.pool.apply_all(result.updates.iter().cloned());
        self.accumulated_observations
            .extend(result.observations.iter().cloned());
        if let Some(err) = &result.error {
            self.last_error = Some(err.message.clone());
            self.pool.note_error(err.message.clone());
        }
        self.execution_history.push(IterationRecord {
            iteration,
            plan,
            tool: result.tool.clone(),
            success: result.success,
            error_kind: result.error_kind(),
            duration_ms: result.duration_ms,
        });
    }

    /// 施加验证器给出的修正 SQL，计入修复次数
    pub fn apply_correction(&mut self, sql: impl Into<String>) {
        self.sql_fix_attempts += 1;
        self.pool.update(ContextUpdate::Sql {
            sql: sql.into(),
            source: SqlSource::Correction,
        });
    }

    /// 为下一轮规划重建压缩状态（修复次数由本结构体独占）
    pub fn context_memory(&self) -> ContextMemory {
        self.pool
            .build_context_memory()
            .with_fix_attempts(self.sql_fix_attempts)
    }

    pub fn current_sql(&self) -> &str {
        self.pool.current_sql().unwrap_or_default()
    }
}
