//! 错误类型、错误标签与恢复动作
//!
//! 工具在出错处给错误打上 ErrorKind 标签，编排层的模式分析只匹配标签；
//! 对只返回字符串的外部工具，ErrorKind::classify 按中英文关键词补打标签。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmError;

/// 错误标签（封闭集合）：由工具在源头标注
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 数据库连接 / 网络故障
    Connection,
    /// 表或 schema 不存在 / 不可用
    SchemaMissing,
    /// SQL 语法错误
    SqlSyntax,
    /// 列不存在、歧义列等语义错误
    SqlSemantic,
    Timeout,
    Permission,
    InvalidInput,
    Llm,
    Unknown,
}

const CONNECTION_KEYWORDS: &[&str] = &[
    "connection",
    "connect to",
    "network",
    "refused",
    "unreachable",
    "broken pipe",
    "reset by peer",
    "连接",
    "网络",
];
const TIMEOUT_KEYWORDS: &[&str] = &["timeout", "timed out", "超时"];
const SCHEMA_KEYWORDS: &[&str] = &[
    "no such table",
    "table not found",
    "unknown table",
    "doesn't exist",
    "无表",
    "表不存在",
    "schema unavailable",
    "表结构",
];
const SEMANTIC_KEYWORDS: &[&str] = &[
    "no such column",
    "unknown column",
    "ambiguous",
    "列不存在",
    "字段不存在",
];
const SYNTAX_KEYWORDS: &[&str] = &["syntax", "parse error", "incomplete input", "语法"];
const PERMISSION_KEYWORDS: &[&str] = &["permission", "denied", "not authorized", "权限"];

impl ErrorKind {
    /// 按关键词为未打标签的错误消息分类（兼容只返回字符串的外部工具）
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        let hit = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));

        if hit(CONNECTION_KEYWORDS) {
            ErrorKind::Connection
        } else if hit(TIMEOUT_KEYWORDS) {
            ErrorKind::Timeout
        } else if hit(SCHEMA_KEYWORDS) {
            ErrorKind::SchemaMissing
        } else if hit(SEMANTIC_KEYWORDS) {
            ErrorKind::SqlSemantic
        } else if hit(SYNTAX_KEYWORDS) {
            ErrorKind::SqlSyntax
        } else if hit(PERMISSION_KEYWORDS) {
            ErrorKind::Permission
        } else {
            ErrorKind::Unknown
        }
    }

    pub fn is_connection(self) -> bool {
        matches!(self, ErrorKind::Connection)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::SchemaMissing => "schema_missing",
            ErrorKind::SqlSyntax => "sql_syntax",
            ErrorKind::SqlSemantic => "sql_semantic",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Permission => "permission",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Llm => "llm",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// 工具级错误：带标签的消息
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// 未知来源的错误消息：按关键词补打标签
    pub fn classified(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: ErrorKind::classify(&message),
            message,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }
}

impl From<LlmError> for ToolError {
    fn from(e: LlmError) -> Self {
        let kind = match e {
            LlmError::Timeout => ErrorKind::Timeout,
            _ => ErrorKind::Llm,
        };
        ToolError::new(kind, e.to_string())
    }
}

/// 编排层错误（规划、工具、LLM、配置、取消）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Planning failed: {0}")]
    PlanningFailed(String),

    /// 计划结构非法或引用了当前阶段白名单外的工具（消息以 invalid_plan 开头）
    #[error("{0}")]
    InvalidPlan(String),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(#[from] ToolError),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Unknown tool: {0}")]
    HallucinatedTool(String),

    #[error("LLM error: {0}")]
    LlmError(#[from] LlmError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Cancelled")]
    Cancelled,
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::ToolExecutionFailed(e) => e.kind,
            AgentError::ToolTimeout(_) => ErrorKind::Timeout,
            AgentError::LlmError(LlmError::Timeout) => ErrorKind::Timeout,
            AgentError::LlmError(_) => ErrorKind::Llm,
            AgentError::InvalidInput(_) | AgentError::ConfigError(_) => ErrorKind::InvalidInput,
            _ => ErrorKind::Unknown,
        }
    }
}

/// 触发提前退出的模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitPattern {
    /// 同一工具连续失败
    RepeatedFailure,
    /// 多次获取后 schema 仍为空
    SchemaUnavailable,
    /// 连接类错误反复出现
    ConnectionUnstable,
    /// 多轮后仍未产出 SQL
    NoProgress,
}

impl ExitPattern {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitPattern::RepeatedFailure => "repeated_failure",
            ExitPattern::SchemaUnavailable => "schema_unavailable",
            ExitPattern::ConnectionUnstable => "connection_unstable",
            ExitPattern::NoProgress => "no_progress",
        }
    }
}

/// 恢复引擎根据执行历史给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 无异常模式，继续循环
    Continue,
    /// 立即终止，附带可读原因与可操作建议
    EarlyExit {
        pattern: ExitPattern,
        reason: String,
        suggestion: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_connection() {
        assert_eq!(ErrorKind::classify("Connection refused"), ErrorKind::Connection);
        assert_eq!(ErrorKind::classify("数据库连接失败"), ErrorKind::Connection);
        assert_eq!(ErrorKind::classify("network is unreachable"), ErrorKind::Connection);
    }

    #[test]
    fn test_classify_schema_and_sql() {
        assert_eq!(ErrorKind::classify("无表：数据源中没有可用的表"), ErrorKind::SchemaMissing);
        assert_eq!(ErrorKind::classify("no such table: orders"), ErrorKind::SchemaMissing);
        assert_eq!(ErrorKind::classify("no such column: amt"), ErrorKind::SqlSemantic);
        assert_eq!(ErrorKind::classify("near \"FORM\": syntax error"), ErrorKind::SqlSyntax);
    }

    #[test]
    fn test_classify_timeout_and_unknown() {
        assert_eq!(ErrorKind::classify("query timed out"), ErrorKind::Timeout);
        assert_eq!(ErrorKind::classify("执行超时"), ErrorKind::Timeout);
        assert_eq!(ErrorKind::classify("something odd"), ErrorKind::Unknown);
    }

    #[test]
    fn test_tool_error_from_llm_error() {
        let e: ToolError = LlmError::Timeout.into();
        assert_eq!(e.kind, ErrorKind::Timeout);
        let e: ToolError = LlmError::ApiError("bad key".into()).into();
        assert_eq!(e.kind, ErrorKind::Llm);
    }

    #[test]
    fn test_agent_error_kind() {
        let e = AgentError::ToolExecutionFailed(ToolError::new(ErrorKind::Connection, "down"));
        assert_eq!(e.kind(), ErrorKind::Connection);
        assert_eq!(AgentError::Cancelled.kind(), ErrorKind::Unknown);
    }
}
