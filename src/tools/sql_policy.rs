//! sql.policy：只读策略与行数策略（追加或收紧 LIMIT）

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::core::{AgentInput, ToolError};
use crate::memory::{ContextUpdate, SqlSource, StepContext, StepKind};
use crate::tools::sql_validate::read_only_issue;
use crate::tools::{Tool, ToolOutput};

static TRAILING_LIMIT_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// 返回应用行数上限后的 SQL；已有更小的 LIMIT 时原样返回 None
pub fn apply_row_limit(sql: &str, limit: usize) -> Option<String> {
    let body = sql.trim().trim_end_matches(';').trim_end();
    let re = TRAILING_LIMIT_RE
        .get_or_init(|| Regex::new(r"(?i)\bLIMIT\s+(\d+)\s*(\bOFFSET\s+\d+\s*)?$").ok())
        .as_ref()?;
    match re.captures(body) {
        Some(caps) => {
            let current: usize = caps.get(1)?.as_str().parse().ok()?;
            if current <= limit {
                return None;
            }
            let m = caps.get(1)?;
            Some(format!("{}{}{}", &body[..m.start()], limit, &body[m.end()..]))
        }
        None => Some(format!("{body} LIMIT {limit}")),
    }
}

pub struct SqlPolicyTool {
    default_row_limit: usize,
}

impl SqlPolicyTool {
    pub fn new(default_row_limit: usize) -> Self {
        Self { default_row_limit }
    }
}

#[async_trait]
impl Tool for SqlPolicyTool {
    fn name(&self) -> &str {
        "sql.policy"
    }

    fn description(&self) -> &str {
        "对当前 SQL 施加行数上限（追加或收紧 LIMIT）。"
    }

    fn step_kind(&self) -> StepKind {
        StepKind::SqlValidation
    }

    async fn execute(
        &self,
        _args: &Value,
        input: &AgentInput,
        resources: &StepContext,
    ) -> Result<ToolOutput, ToolError> {
        let sql = resources
            .current_sql
            .as_deref()
            .ok_or_else(|| ToolError::invalid_input("没有可施加策略的 SQL"))?;
        if let Some(issue) = read_only_issue(sql) {
            return Err(ToolError::invalid_input(issue));
        }
        let limit = input.constraints.row_limit.unwrap_or(self.default_row_limit);

        Ok(match apply_row_limit(sql, limit) {
            Some(limited) => ToolOutput::ok()
                .with_observation(format!("已施加 LIMIT {limit}"))
                .with_update(ContextUpdate::Sql {
                    sql: limited,
                    source: SqlSource::Policy,
                }),
            None => ToolOutput::ok().with_observation("SQL 已满足行数策略"),
        })
    }
}
