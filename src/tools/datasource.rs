//! 数据源抽象与 SQLite 实现
//!
//! DataSource 是 schema 工具、sql.validate 与 sql.execute 共用的数据库接缝。
//! SqliteDataSource 在 spawn_blocking 中使用 rusqlite，错误消息按关键词打标签
//! （no such table → SchemaMissing，syntax error → SqlSyntax ...）。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{Map, Number, Value};

use crate::core::{ErrorKind, ToolError};
use crate::memory::ColumnDetail;

/// 查询结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryRows {
    pub columns: Vec<String>,
    /// 每行一个 JSON 对象（列名 -> 值）
    pub rows: Vec<Value>,
    /// 结果超过 max_rows 被截断
    pub truncated: bool,
}

#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    async fn list_tables(&self) -> Result<Vec<String>, ToolError>;

    /// 表不存在时返回 SchemaMissing
    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnDetail>, ToolError>;

    /// 不执行，只让数据库解析并规划 SQL
    async fn explain(&self, sql: &str) -> Result<(), ToolError>;

    async fn query(&self, sql: &str, max_rows: usize) -> Result<QueryRows, ToolError>;
}

pub struct SqliteDataSource {
    name: String,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDataSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ToolError> {
        let name = path.as_ref().display().to_string();
        let conn = Connection::open(path).map_err(sqlite_error)?;
        Ok(Self::from_connection(name, conn))
    }

    pub fn in_memory() -> Result<Self, ToolError> {
        let conn = Connection::open_in_memory().map_err(sqlite_error)?;
        Ok(Self::from_connection(":memory:", conn))
    }

    pub fn from_connection(name: impl Into<String>, conn: Connection) -> Self {
        Self {
            name: name.into(),
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// 同步执行建表 / 灌数脚本（初始化用）
    pub fn execute_batch(&self, sql: &str) -> Result<(), ToolError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ToolError::new(ErrorKind::Connection, format!("数据库连接锁失效: {e}")))?;
        conn.execute_batch(sql).map_err(sqlite_error)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, ToolError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, ToolError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|e| {
                ToolError::new(ErrorKind::Connection, format!("数据库连接锁失效: {e}"))
            })?;
            f(&guard)
        })
        .await
        .map_err(|e| ToolError::new(ErrorKind::Unknown, format!("数据库任务异常: {e}")))?
    }
}

fn sqlite_error(e: rusqlite::Error) -> ToolError {
    ToolError::classified(e.to_string())
}

/// 仅允许 [A-Za-z0-9_] 组成的表名进入 PRAGMA
fn is_plain_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<blob {} bytes>", b.len())),
    }
}

#[async_trait]
impl DataSource for SqliteDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tables(&self) -> Result<Vec<String>, ToolError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master \
                     WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
                     ORDER BY name",
                )
                .map_err(sqlite_error)?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(sqlite_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sqlite_error)?;
            Ok(names)
        })
        .await
    }

    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnDetail>, ToolError> {
        if !is_plain_identifier(table) {
            return Err(ToolError::invalid_input(format!("非法表名: {table}")));
        }
        let table = table.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!("PRAGMA table_info(\"{table}\")"))
                .map_err(sqlite_error)?;
            let columns = stmt
                .query_map([], |row| {
                    let name: String = row.get(1)?;
                    let data_type: String = row.get(2)?;
                    let not_null: i64 = row.get(3)?;
                    Ok(ColumnDetail {
                        name,
                        data_type: (!data_type.is_empty()).then_some(data_type),
                        nullable: not_null == 0,
                    })
                })
                .map_err(sqlite_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sqlite_error)?;
            if columns.is_empty() {
                return Err(ToolError::new(
                    ErrorKind::SchemaMissing,
                    format!("表不存在: {table}"),
                ));
            }
            Ok(columns)
        })
        .await
    }

    async fn explain(&self, sql: &str) -> Result<(), ToolError> {
        let sql = format!("EXPLAIN QUERY PLAN {}", sql.trim().trim_end_matches(';'));
        self.with_conn(move |conn| {
            conn.prepare(&sql).map(|_| ()).map_err(sqlite_error)
        })
        .await
    }

    async fn query(&self, sql: &str, max_rows: usize) -> Result<QueryRows, ToolError> {
        let sql = sql.trim().trim_end_matches(';').to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(sqlite_error)?;
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let mut rows = stmt.query([]).map_err(sqlite_error)?;
            let mut out = QueryRows {
                columns: columns.clone(),
                ..QueryRows::default()
            };
            while let Some(row) = rows.next().map_err(sqlite_error)? {
                if out.rows.len() >= max_rows {
                    out.truncated = true;
                    break;
                }
                let mut obj = Map::with_capacity(columns.len());
                for (i, col) in columns.iter().enumerate() {
                    let value = row.get_ref(i).map_err(sqlite_error)?;
                    obj.insert(col.clone(), to_json(value));
                }
                out.rows.push(Value::Object(obj));
            }
            Ok(out)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sales_db() -> SqliteDataSource {
        let db = SqliteDataSource::in_memory().unwrap();
        db.execute_batch(
            "CREATE TABLE sales (id INTEGER PRIMARY KEY, amount REAL NOT NULL, sale_date TEXT, region TEXT);
             INSERT INTO sales (amount, sale_date, region) VALUES (100.5, '2026-10-01', '华东'), (200, '2026-10-02', '华南');",
        )
        .unwrap();
        db
    }

    #[tokio::test]
    async fn test_list_and_describe() {
        let db = sales_db();
        assert_eq!(db.list_tables().await.unwrap(), vec!["sales".to_string()]);
        let cols = db.describe_table("sales").await.unwrap();
        assert_eq!(cols.len(), 4);
        assert_eq!(cols[1].name, "amount");
        assert_eq!(cols[1].data_type.as_deref(), Some("REAL"));
        assert!(!cols[1].nullable);

        let err = db.describe_table("orders").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SchemaMissing);
        let err = db.describe_table("x; DROP TABLE sales").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_explain_tags_errors() {
        let db = sales_db();
        assert!(db.explain("SELECT SUM(amount) FROM sales").await.is_ok());
        let err = db.explain("SELECT amount FROM salez").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SchemaMissing);
        let err = db.explain("SELECT amt FROM sales").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SqlSemantic);
        let err = db.explain("SELECT amount FORM sales").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SqlSyntax);
    }

    #[tokio::test]
    async fn test_query_rows_and_truncation() {
        let db = sales_db();
        let rows = db
            .query("SELECT region, amount FROM sales ORDER BY id;", 10)
            .await
            .unwrap();
        assert_eq!(rows.columns, vec!["region", "amount"]);
        assert_eq!(rows.rows.len(), 2);
        assert_eq!(rows.rows[0]["region"], "华东");
        assert!(!rows.truncated);

        let rows = db.query("SELECT * FROM sales", 1).await.unwrap();
        assert_eq!(rows.rows.len(), 1);
        assert!(rows.truncated);
    }
}
