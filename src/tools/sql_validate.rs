//! sql.validate：静态检查 + 数据库 EXPLAIN
//!
//! 静态检查基于 sqlparser 的语法树：必须是单条只读查询，引用的表与 table.column 列要存在
//! （与已获取的 schema 比对，编辑距离不超过 2 的拼写错误给出 corrected_sql）。静态检查通过后再交给数据库 EXPLAIN，
//! 成功即 database_validated。数据库不可达不算 SQL 问题，只标记未做数据库校验。
//!
//! 发现问题时工具本身仍返回成功，问题写在 Validation 更新里，由验证器决定修复还是终止。

use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use sqlparser::ast::{visit_statements, Expr, ObjectName, Query, Statement, Visit, Visitor};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;

use crate::core::{AgentInput, ErrorKind, ToolError};
use crate::memory::{ColumnDetails, ContextUpdate, StepContext, StepKind};
use crate::tools::{DataSource, Tool, ToolOutput};

/// 拼写纠正允许的最大编辑距离
const MAX_CORRECTION_DISTANCE: usize = 2;

static DB_ERROR_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// 解析后的查询结构：引用的表与 table.column 引用
#[derive(Debug, Default, PartialEq)]
pub struct QueryShape {
    pub tables: Vec<String>,
    pub qualified_columns: Vec<(String, String)>,
}

#[derive(Default)]
struct ShapeCollector {
    ctes: BTreeSet<String>,
    relations: Vec<String>,
    qualified: Vec<(String, String)>,
}

impl Visitor for ShapeCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(cte.alias.name.value.to_lowercase());
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        let name = relation
            .0
            .iter()
            .map(|ident| ident.value.as_str())
            .collect::<Vec<_>>()
            .join(".");
        if !self.relations.contains(&name) {
            self.relations.push(name);
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if let Expr::CompoundIdentifier(parts) = expr {
            if let [.., table, column] = parts.as_slice() {
                let pair = (table.value.clone(), column.value.clone());
                if !self.qualified.contains(&pair) {
                    self.qualified.push(pair);
                }
            }
        }
        ControlFlow::Continue(())
    }
}

/// EXPLAIN / 解析前用固定日期替换时间占位符
fn fill_placeholders(sql: &str) -> String {
    sql.replace("{{start_date}}", "1970-01-01")
        .replace("{{end_date}}", "1970-01-01")
}

/// 解析为单条只读查询；不满足时返回问题描述
pub fn parse_query(sql: &str) -> Result<Statement, String> {
    let mut statements = Parser::parse_sql(&SQLiteDialect {}, &fill_placeholders(sql))
        .map_err(|e| format!("SQL 语法错误: {e}"))?;
    if statements.len() != 1 {
        return Err(format!("只允许单条 SQL 语句，当前有 {} 条", statements.len()));
    }
    match statements.pop() {
        Some(statement @ Statement::Query(_)) => {
            // CTE 中嵌套的 INSERT / UPDATE / DELETE 同样不允许
            let nested = visit_statements(&statement, |inner| match inner {
                Statement::Query(_) => ControlFlow::Continue(()),
                _ => ControlFlow::Break(()),
            });
            if nested.is_break() {
                return Err("查询中包含写操作语句".to_string());
            }
            Ok(statement)
        }
        Some(other) => {
            let head = other
                .to_string()
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_uppercase();
            Err(format!("只允许 SELECT / WITH 查询，当前语句以 {head} 开头"))
        }
        None => Err("SQL 为空".to_string()),
    }
}

/// 只读检查；返回问题描述
pub fn read_only_issue(sql: &str) -> Option<String> {
    parse_query(sql).err()
}

/// 查询引用的表（去掉 CTE 名）与 table.column 引用
pub fn query_shape(sql: &str) -> Result<QueryShape, String> {
    let statement = parse_query(sql)?;
    let mut collector = ShapeCollector::default();
    let _ = statement.visit(&mut collector);
    let ShapeCollector {
        ctes,
        relations,
        qualified,
    } = collector;
    Ok(QueryShape {
        tables: relations
            .into_iter()
            .filter(|t| !ctes.contains(&t.to_lowercase()))
            .collect(),
        qualified_columns: qualified,
    })
}

/// FROM / JOIN 引用的表名；无法解析时为空
pub fn referenced_tables(sql: &str) -> Vec<String> {
    query_shape(sql).map(|s| s.tables).unwrap_or_default()
}

/// 在候选中找编辑距离最近且不超过阈值的名称
pub fn closest_name<'a>(name: &str, candidates: impl IntoIterator<Item = &'a String>) -> Option<&'a String> {
    let lower = name.to_lowercase();
    candidates
        .into_iter()
        .map(|c| (strsim::levenshtein(&lower, &c.to_lowercase()), c))
        .filter(|(d, _)| *d > 0 && *d <= MAX_CORRECTION_DISTANCE)
        .min_by_key(|(d, _)| *d)
        .map(|(_, c)| c)
}

/// 按单词边界替换标识符（大小写不敏感）
fn replace_identifier(sql: &str, from: &str, to: &str) -> String {
    match Regex::new(&format!(r"(?i)\b{}\b", regex::escape(from))) {
        Ok(re) => re.replace_all(sql, regex::NoExpand(to)).into_owned(),
        Err(_) => sql.to_string(),
    }
}

#[derive(Debug, Default)]
struct StaticReport {
    issues: Vec<String>,
    corrected_sql: Option<String>,
}

fn static_check(sql: &str, details: &ColumnDetails) -> StaticReport {
    let mut report = StaticReport::default();
    let shape = match query_shape(sql) {
        Ok(shape) => shape,
        Err(issue) => {
            report.issues.push(issue);
            return report;
        }
    };

    if details.is_empty() {
        return report;
    }
    let known: Vec<&String> = details.keys().collect();
    let mut corrected = sql.to_string();
    let mut changed = false;
    for reference in &shape.tables {
        let table = reference.rsplit('.').next().unwrap_or(reference).to_string();
        if known.iter().any(|k| k.eq_ignore_ascii_case(&table)) {
            continue;
        }
        match closest_name(&table, known.iter().copied()) {
            Some(fix) => {
                report
                    .issues
                    .push(format!("表 {table} 不存在，可能是 {fix}"));
                corrected = replace_identifier(&corrected, &table, fix);
                changed = true;
            }
            None => report.issues.push(format!("表 {table} 不存在")),
        }
    }
    // 别名引用无法与表对应，跳过
    for (table, column) in &shape.qualified_columns {
        let Some(cols) = details
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(table))
            .map(|(_, cols)| cols)
        else {
            continue;
        };
        if cols.is_empty() || cols.iter().any(|c| c.name.eq_ignore_ascii_case(column)) {
            continue;
        }
        let names: Vec<String> = cols.iter().map(|c| c.name.clone()).collect();
        match closest_name(column, names.iter()) {
            Some(fix) => {
                report
                    .issues
                    .push(format!("列 {table}.{column} 不存在，可能是 {fix}"));
                corrected = replace_identifier(&corrected, column, fix);
                changed = true;
            }
            None => report.issues.push(format!("列 {table}.{column} 不存在")),
        }
    }
    if changed {
        report.corrected_sql = Some(corrected);
    }
    report
}

/// 针对数据库报出的 no such column / no such table 给出纠正
fn correction_from_db_error(sql: &str, message: &str, details: &ColumnDetails) -> Option<String> {
    let re = DB_ERROR_RE
        .get_or_init(|| {
            Regex::new(r"no such (column|table): ([A-Za-z_][A-Za-z0-9_]*\.)?([A-Za-z_][A-Za-z0-9_]*)").ok()
        })
        .as_ref()?;
    let caps = re.captures(message)?;
    let kind = caps.get(1)?.as_str();
    let bad = caps.get(3)?.as_str();
    let candidates: Vec<String> = if kind == "column" {
        details
            .values()
            .flatten()
            .map(|c| c.name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    } else {
        details.keys().cloned().collect()
    };
    let fix = closest_name(bad, candidates.iter())?;
    Some(replace_identifier(sql, bad, fix))
}

pub struct SqlValidateTool {
    source: Option<Arc<dyn DataSource>>,
}

impl SqlValidateTool {
    /// 无数据源时只做静态检查
    pub fn new(source: Option<Arc<dyn DataSource>>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Tool for SqlValidateTool {
    fn name(&self) -> &str {
        "sql.validate"
    }

    fn description(&self) -> &str {
        "校验当前 SQL：只读、语法、表是否存在，并在数据库上 EXPLAIN。参数: {\"sql\": \"...\"}，省略则校验当前 SQL。"
    }

    fn step_kind(&self) -> StepKind {
        StepKind::SqlValidation
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"sql": {"type": "string"}},
            "required": []
        })
    }

    async fn execute(
        &self,
        args: &Value,
        _input: &AgentInput,
        resources: &StepContext,
    ) -> Result<ToolOutput, ToolError> {
        let sql = args
            .get("sql")
            .and_then(Value::as_str)
            .or(resources.current_sql.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ToolError::invalid_input("没有可校验的 SQL"))?
            .to_string();
        let empty = ColumnDetails::new();
        let details = resources.column_details.as_ref().unwrap_or(&empty);

        let mut report = static_check(&sql, details);
        let mut output = ToolOutput::ok();
        let mut database_validated = false;

        if report.issues.is_empty() {
            match &self.source {
                Some(source) => match source.explain(&fill_placeholders(&sql)).await {
                    Ok(()) => {
                        database_validated = true;
                        output = output.with_observation(format!("EXPLAIN 通过（{}）", source.name()));
                    }
                    Err(e) if matches!(e.kind, ErrorKind::Connection | ErrorKind::Timeout) => {
                        output = output.with_observation(format!("数据库不可达，仅完成静态校验: {}", e.message));
                    }
                    Err(e) => {
                        report.corrected_sql = correction_from_db_error(&sql, &e.message, details);
                        report.issues.push(e.message);
                    }
                },
                None => {
                    output = output.with_observation("未配置数据源，仅完成静态校验");
                }
            }
        }

        let passed = report.issues.is_empty();
        if !passed {
            output = output.with_observation(format!("发现 {} 个问题: {}", report.issues.len(), report.issues.join("; ")));
        }
        Ok(output.with_update(ContextUpdate::Validation {
            passed,
            issues: report.issues,
            corrected_sql: report.corrected_sql,
            database_validated,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PlaceholderSpec;
    use crate::memory::ColumnDetail;
    use crate::tools::SqliteDataSource;

    fn details() -> ColumnDetails {
        let mut d = ColumnDetails::new();
        d.insert(
            "sales".into(),
            vec![
                ColumnDetail::typed("amount", "REAL"),
                ColumnDetail::typed("sale_date", "TEXT"),
            ],
        );
        d
    }

    fn resources(sql: &str) -> StepContext {
        StepContext {
            current_sql: Some(sql.to_string()),
            column_details: Some(details()),
            ..StepContext::default()
        }
    }

    fn validation(out: &ToolOutput) -> (bool, Vec<String>, Option<String>, bool) {
        match out.updates.last() {
            Some(ContextUpdate::Validation {
                passed,
                issues,
                corrected_sql,
                database_validated,
            }) => (*passed, issues.clone(), corrected_sql.clone(), *database_validated),
            other => panic!("unexpected {other:?}"),
        }
    }

    fn db() -> Arc<dyn DataSource> {
        let db = SqliteDataSource::in_memory().unwrap();
        db.execute_batch("CREATE TABLE sales (amount REAL, sale_date TEXT);")
            .unwrap();
        Arc::new(db)
    }

    fn input() -> AgentInput {
        AgentInput::new("x", PlaceholderSpec::default())
    }

    #[test]
    fn test_read_only() {
        assert!(read_only_issue("SELECT 1").is_none());
        assert!(read_only_issue("with t as (select 1) select * from t").is_none());
        assert!(read_only_issue("DELETE FROM sales").is_some());
        assert!(read_only_issue("SELECT 1; DROP TABLE sales").is_some());
        // 列名和注释里的 update 不算写操作
        assert!(read_only_issue("SELECT updated_at FROM t").is_none());
        assert!(read_only_issue("SELECT SUM(amount) FROM sales -- update: include refunds later").is_none());
        assert!(read_only_issue("SELECT /* delete */ amount FROM sales").is_none());
        assert!(read_only_issue("UPDATE sales SET amount = 0").is_some());
        assert!(read_only_issue("").is_some());
    }

    #[test]
    fn test_syntax_errors_are_issues() {
        let report = static_check("SELECT SUM(amount FROM sales", &details());
        assert!(report.issues[0].starts_with("SQL 语法错误"), "{:?}", report.issues);
        assert!(report.corrected_sql.is_none());
        // 未加引号的占位符也能解析
        assert!(static_check("SELECT amount FROM sales WHERE sale_date >= {{start_date}}", &details())
            .issues
            .is_empty());
    }

    #[test]
    fn test_referenced_tables_skip_cte() {
        let sql = "WITH m AS (SELECT * FROM sales) SELECT * FROM m JOIN regions r ON 1=1";
        assert_eq!(referenced_tables(sql), vec!["sales", "regions"]);
        // 函数参数里的 FROM 不是表
        assert_eq!(
            referenced_tables("SELECT EXTRACT(YEAR FROM sale_date) FROM sales"),
            vec!["sales"]
        );
    }

    #[test]
    fn test_static_typo_correction() {
        let report = static_check("SELECT SUM(amount) FROM salez", &details());
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.corrected_sql.as_deref(), Some("SELECT SUM(amount) FROM sales"));

        let report = static_check("SELECT * FROM customers", &details());
        assert!(report.corrected_sql.is_none());
        assert!(report.issues[0].contains("customers"));
    }

    #[test]
    fn test_qualified_column_check() {
        let report = static_check("SELECT SUM(sales.amout) FROM sales", &details());
        assert_eq!(report.issues.len(), 1);
        assert_eq!(
            report.corrected_sql.as_deref(),
            Some("SELECT SUM(sales.amount) FROM sales")
        );
        // 别名引用不做列检查
        assert!(static_check("SELECT s.whatever FROM sales s", &details()).issues.is_empty());
    }

    #[test]
    fn test_literals_do_not_confuse_checks() {
        let report = static_check(
            "SELECT SUM(amount) FROM sales WHERE sale_date BETWEEN '{{start_date}}' AND '{{end_date}}' AND 'x(' <> 'delete'",
            &details(),
        );
        assert!(report.issues.is_empty(), "{:?}", report.issues);
    }

    #[tokio::test]
    async fn test_explain_pass_sets_database_validated() {
        let tool = SqlValidateTool::new(Some(db()));
        let out = tool
            .execute(
                &json!({}),
                &input(),
                &resources("SELECT SUM(amount) FROM sales WHERE sale_date BETWEEN '{{start_date}}' AND '{{end_date}}'"),
            )
            .await
            .unwrap();
        assert_eq!(validation(&out), (true, vec![], None, true));
    }

    #[tokio::test]
    async fn test_explain_column_error_gets_correction() {
        let tool = SqlValidateTool::new(Some(db()));
        let out = tool
            .execute(&json!({}), &input(), &resources("SELECT SUM(amout) FROM sales"))
            .await
            .unwrap();
        assert!(out.success);
        let (passed, issues, corrected, db_ok) = validation(&out);
        assert!(!passed);
        assert!(issues[0].contains("no such column"));
        assert_eq!(corrected.as_deref(), Some("SELECT SUM(amount) FROM sales"));
        assert!(!db_ok);
    }

    #[tokio::test]
    async fn test_static_only_without_source() {
        let tool = SqlValidateTool::new(None);
        let out = tool
            .execute(&json!({"sql": "SELECT amount FROM sales"}), &input(), &StepContext::default())
            .await
            .unwrap();
        assert_eq!(validation(&out), (true, vec![], None, false));

        let err = tool
            .execute(&json!({}), &input(), &StepContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }
}
