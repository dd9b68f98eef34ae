//! ContextMemory：ResourcePool 的有损压缩投影
//!
//! 只含布尔标记、计数与简短摘要，不含列细节或 SQL 正文，用于规划器 prompt。

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMemory {
    pub has_sql: bool,
    pub schema_available: bool,
    pub sql_validated: bool,
    pub database_validated: bool,
    pub sql_executed_successfully: bool,
    pub has_chart_spec: bool,
    pub has_chart_image: bool,
    /// 已知表名（不含列）
    pub tables: Vec<String>,
    pub sql_length: usize,
    pub sql_fix_attempts: u32,
    pub last_error_summary: Option<String>,
    /// 未解决的校验 / 质量问题数
    pub pending_issues: usize,
    pub result_rows: Option<usize>,
    pub time_range: Option<String>,
}

impl ContextMemory {
    pub fn with_fix_attempts(mut self, attempts: u32) -> Self {
        self.sql_fix_attempts = attempts;
        self
    }

    /// 格式化为规划器 prompt 的一节
    pub fn to_prompt_section(&self) -> String {
        let flag = |b: bool| if b { "是" } else { "否" };
        let mut lines = vec![
            "## 当前状态".to_string(),
            format!("- 已有 SQL: {}（长度 {}）", flag(self.has_sql), self.sql_length),
            format!("- Schema 可用: {}", flag(self.schema_available)),
            format!(
                "- SQL 已校验: {}，数据库校验: {}",
                flag(self.sql_validated),
                flag(self.database_validated)
            ),
            format!("- SQL 已成功执行: {}", flag(self.sql_executed_successfully)),
            format!("- 修复次数: {}", self.sql_fix_attempts),
        ];
        if !self.tables.is_empty() {
            lines.push(format!("- 已知表: {}", self.tables.join(", ")));
        }
        if let Some(range) = &self.time_range {
            lines.push(format!("- 时间窗口: {range}"));
        }
        if let Some(rows) = self.result_rows {
            lines.push(format!("- 结果行数: {rows}"));
        }
        if self.pending_issues > 0 {
            lines.push(format!("- 待修复问题: {} 个", self.pending_issues));
        }
        if self.has_chart_spec || self.has_chart_image {
            lines.push(format!(
                "- 图表规格: {}，图表文件: {}",
                flag(self.has_chart_spec),
                flag(self.has_chart_image)
            ));
        }
        if let Some(err) = &self.last_error_summary {
            lines.push(format!("- 最近错误: {err}"));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_section_empty() {
        let s = ContextMemory::default().to_prompt_section();
        assert!(s.contains("已有 SQL: 否"));
        assert!(!s.contains("最近错误"));
    }

    #[test]
    fn test_prompt_section_with_state() {
        let m = ContextMemory {
            has_sql: true,
            sql_length: 30,
            tables: vec!["sales".into()],
            last_error_summary: Some("no such column: amt".into()),
            pending_issues: 2,
            ..Default::default()
        }
        .with_fix_attempts(1);
        let s = m.to_prompt_section();
        assert!(s.contains("已有 SQL: 是（长度 30）"));
        assert!(s.contains("已知表: sales"));
        assert!(s.contains("修复次数: 1"));
        assert!(s.contains("待修复问题: 2 个"));
        assert!(s.contains("no such column"));
    }
}
