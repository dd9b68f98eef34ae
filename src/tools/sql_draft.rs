//! sql.draft / sql.refine：调用 LLM 生成或修复 SQL
//!
//! 两者都只拿到本步需要的上下文（StepContext），prompt 大小与迭代次数无关。
//! 时间过滤一律写成 {{start_date}} / {{end_date}} 占位符，执行前由 sql.execute 替换。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{AgentInput, ErrorKind, ToolError};
use crate::llm::{extract_json_object, strip_code_fence, Complexity, LlmClient, LlmPolicy};
use crate::memory::{ColumnDetails, ContextUpdate, SqlSource, StepContext, StepKind};
use crate::tools::{Tool, ToolOutput};

const HARD_SEMANTICS: &[&str] = &["同比", "环比", "排名", "排行", "留存", "占比"];

/// 从 LLM 回复中取出 SQL：JSON 的 sql 字段优先，其次代码块 / 纯文本中的 SELECT / WITH 语句
pub fn extract_sql(text: &str) -> Option<String> {
    if let Some(sql) = extract_json_object(text)
        .as_ref()
        .and_then(|v| v.get("sql"))
        .and_then(Value::as_str)
    {
        let sql = sql.trim();
        return (!sql.is_empty()).then(|| sql.to_string());
    }
    let body = strip_code_fence(text);
    let upper = body.to_uppercase();
    let start = ["SELECT", "WITH"]
        .iter()
        .filter_map(|k| upper.find(k))
        .min()?;
    let sql = body.get(start..)?.trim();
    (!sql.is_empty()).then(|| sql.to_string())
}

fn format_schema(details: &ColumnDetails) -> String {
    details
        .iter()
        .map(|(table, cols)| {
            let cols = cols
                .iter()
                .map(|c| match &c.data_type {
                    Some(t) => format!("{} {}", c.name, t),
                    None => c.name.clone(),
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("- {table}({cols})")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn complexity_for(input: &AgentInput) -> Complexity {
    let semantic = input.placeholder.semantic_type.as_deref().unwrap_or("");
    if HARD_SEMANTICS
        .iter()
        .any(|k| semantic.contains(k) || input.goal().contains(k))
    {
        Complexity::High
    } else {
        Complexity::Medium
    }
}

fn policy_for(stage: &str, input: &AgentInput) -> LlmPolicy {
    LlmPolicy::new(stage)
        .with_complexity(complexity_for(input))
        .with_output_kind(input.constraints.output_kind)
        .with_user(input.user_id.clone())
}

fn common_sections(input: &AgentInput, resources: &StepContext) -> Vec<String> {
    let mut sections = vec![format!("## 目标\n{}", input.goal())];
    if let Some(t) = &input.placeholder.semantic_type {
        sections.push(format!("语义类型: {t}"));
    }
    if let Some(g) = &input.placeholder.granularity {
        sections.push(format!("时间粒度: {g}"));
    }
    if let Some(details) = &resources.column_details {
        sections.push(format!("## 可用表结构\n{}", format_schema(details)));
    }
    if let Some(col) = &resources.recommended_time_column {
        sections.push(format!("推荐时间列: {col}"));
    }
    if let Some(w) = &resources.time_window {
        sections.push(format!(
            "时间窗口: {w}。时间过滤请写成 BETWEEN '{{{{start_date}}}}' AND '{{{{end_date}}}}'，不要写死日期。"
        ));
    }
    sections
}

pub struct SqlDraftTool {
    llm: Arc<dyn LlmClient>,
}

impl SqlDraftTool {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Tool for SqlDraftTool {
    fn name(&self) -> &str {
        "sql.draft"
    }

    fn description(&self) -> &str {
        "根据目标与已获取的表结构生成只读 SQL（需先获取表结构）。"
    }

    fn step_kind(&self) -> StepKind {
        StepKind::SqlGeneration
    }

    async fn execute(
        &self,
        _args: &Value,
        input: &AgentInput,
        resources: &StepContext,
    ) -> Result<ToolOutput, ToolError> {
        let has_schema = resources
            .column_details
            .as_ref()
            .map(|d| !d.is_empty())
            .unwrap_or(false);
        if !has_schema {
            return Err(ToolError::new(
                ErrorKind::SchemaMissing,
                "生成 SQL 前需要先获取表结构",
            ));
        }

        let mut sections = common_sections(input, resources);
        if let Some(ctx) = &resources.template_context {
            sections.push(format!("## 模板上下文\n{ctx}"));
        }
        if !input.task_driven_context.is_empty() {
            sections.push(format!(
                "## 业务上下文\n{}",
                Value::Object(input.task_driven_context.clone())
            ));
        }
        sections.push("只使用上面列出的表和列，输出 JSON：{\"sql\": \"SELECT ...\"}".to_string());

        let reply = self
            .llm
            .call(&sections.join("\n\n"), &policy_for("sql_draft", input))
            .await?;
        let sql = extract_sql(&reply)
            .ok_or_else(|| ToolError::new(ErrorKind::Llm, "LLM 未返回有效 SQL"))?;

        Ok(ToolOutput::ok()
            .with_observation(format!("生成 SQL（{} 字符）", sql.chars().count()))
            .with_update(ContextUpdate::Sql {
                sql,
                source: SqlSource::Draft,
            }))
    }
}

pub struct SqlRefineTool {
    llm: Arc<dyn LlmClient>,
}

impl SqlRefineTool {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Tool for SqlRefineTool {
    fn name(&self) -> &str {
        "sql.refine"
    }

    fn description(&self) -> &str {
        "根据校验问题或执行错误修复当前 SQL。"
    }

    fn step_kind(&self) -> StepKind {
        StepKind::SqlRefinement
    }

    async fn execute(
        &self,
        _args: &Value,
        input: &AgentInput,
        resources: &StepContext,
    ) -> Result<ToolOutput, ToolError> {
        let current = resources
            .current_sql
            .as_deref()
            .ok_or_else(|| ToolError::invalid_input("没有可修复的 SQL"))?;

        let mut sections = common_sections(input, resources);
        sections.push(format!("## 当前 SQL\n{current}"));
        if !resources.issues.is_empty() {
            sections.push(format!("## 校验问题\n- {}", resources.issues.join("\n- ")));
        }
        if let Some(err) = &resources.last_error {
            sections.push(format!("## 最近错误\n{err}"));
        }
        sections.push("修复上述问题，输出 JSON：{\"sql\": \"SELECT ...\"}".to_string());

        let reply = self
            .llm
            .call(&sections.join("\n\n"), &policy_for("sql_refine", input))
            .await?;
        let sql = extract_sql(&reply)
            .ok_or_else(|| ToolError::new(ErrorKind::Llm, "LLM 未返回修复后的 SQL"))?;

        Ok(ToolOutput::ok()
            .with_observation("SQL 已按问题修复")
            .with_update(ContextUpdate::Sql {
                sql,
                source: SqlSource::Refine,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PlaceholderSpec;
    use crate::llm::MockLlmClient;
    use crate::memory::ColumnDetail;
    use serde_json::json;

    fn resources() -> StepContext {
        let mut details = ColumnDetails::new();
        details.insert(
            "sales".into(),
            vec![ColumnDetail::typed("amount", "REAL"), ColumnDetail::typed("sale_date", "DATE")],
        );
        StepContext {
            column_details: Some(details),
            ..StepContext::default()
        }
    }

    #[test]
    fn test_extract_sql_variants() {
        assert_eq!(extract_sql(r#"{"sql": "SELECT 1"}"#).as_deref(), Some("SELECT 1"));
        assert_eq!(
            extract_sql("```sql\nSELECT SUM(amount) FROM sales\n```").as_deref(),
            Some("SELECT SUM(amount) FROM sales")
        );
        assert_eq!(
            extract_sql("这是查询：with t as (select 1) select * from t").as_deref(),
            Some("with t as (select 1) select * from t")
        );
        assert!(extract_sql("抱歉，无法生成").is_none());
        assert!(extract_sql(r#"{"sql": ""}"#).is_none());
    }

    #[tokio::test]
    async fn test_draft_requires_schema() {
        let tool = SqlDraftTool::new(Arc::new(MockLlmClient::new()));
        let input = AgentInput::new("统计本月销售额", PlaceholderSpec::default());
        let err = tool
            .execute(&json!({}), &input, &StepContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SchemaMissing);
    }

    #[tokio::test]
    async fn test_draft_uses_schema_in_prompt() {
        let llm = Arc::new(
            MockLlmClient::new().with_reply("sql_draft", r#"{"sql": "SELECT SUM(amount) FROM sales"}"#),
        );
        let tool = SqlDraftTool::new(llm.clone());
        let input = AgentInput::new("统计本月销售额", PlaceholderSpec::new("p", "统计本月销售额"));
        let out = tool.execute(&json!({}), &input, &resources()).await.unwrap();
        assert_eq!(
            out.updates,
            vec![ContextUpdate::Sql {
                sql: "SELECT SUM(amount) FROM sales".into(),
                source: SqlSource::Draft
            }]
        );
        let (stage, prompt) = &llm.prompts()[0];
        assert_eq!(stage, "sql_draft");
        assert!(prompt.contains("sales(amount REAL, sale_date DATE)"));
    }

    #[tokio::test]
    async fn test_refine_passes_issues() {
        let llm = Arc::new(MockLlmClient::new().with_reply("sql_refine", "SELECT amount FROM sales"));
        let tool = SqlRefineTool::new(llm.clone());
        let input = AgentInput::new("x", PlaceholderSpec::default());
        let mut res = resources();
        res.current_sql = Some("SELECT amt FROM sales".into());
        res.issues = vec!["no such column: amt".into()];
        let out = tool.execute(&json!({}), &input, &res).await.unwrap();
        assert!(matches!(
            &out.updates[0],
            ContextUpdate::Sql { source: SqlSource::Refine, .. }
        ));
        assert!(llm.prompts()[0].1.contains("no such column: amt"));

        let err = tool
            .execute(&json!({}), &input, &resources())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_llm_failure_is_tagged() {
        let llm = Arc::new(
            MockLlmClient::new().with_error("sql_draft", crate::llm::LlmError::Timeout),
        );
        let tool = SqlDraftTool::new(llm);
        let input = AgentInput::new("x", PlaceholderSpec::default());
        let err = tool.execute(&json!({}), &input, &resources()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }
}
