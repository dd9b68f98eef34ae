//! 工具层：Tool trait、注册表、执行器、数据源与参考工具集
//!
//! 参考工具集覆盖 schema 发现、时间窗口、SQL 生成 / 修复 / 校验 / 策略 / 执行、数据质量与图表；
//! 编排器只按名称调用，调用方可用同名工具覆盖其中任何一个。

pub mod chart;
pub mod data_quality;
pub mod datasource;
pub mod executor;
pub mod registry;
pub mod schema;
pub mod schema_cache;
pub mod schema_tools;
pub mod sql_draft;
pub mod sql_execute;
pub mod sql_policy;
pub mod sql_validate;
pub mod time_window;

use std::sync::Arc;
use std::time::Duration;

pub use chart::{ChartSpecTool, WordChartGeneratorTool};
pub use data_quality::DataQualityTool;
pub use datasource::{DataSource, QueryRows, SqliteDataSource};
pub use executor::{ExecutionResult, ToolExecutor};
pub use registry::{FnTool, Tool, ToolOutput, ToolRegistry};
pub use schema::plan_schema_json;
pub use schema_cache::SchemaCache;
pub use schema_tools::{ListColumnsTool, ListTablesTool};
pub use sql_draft::{SqlDraftTool, SqlRefineTool};
pub use sql_execute::SqlExecuteTool;
pub use sql_policy::SqlPolicyTool;
pub use sql_validate::SqlValidateTool;
pub use time_window::TimeWindowTool;

use crate::config::AppConfig;
use crate::llm::LlmClient;

/// 按配置注册参考工具集；没有数据源时不注册 schema.* 与 sql.execute，sql.validate 只做静态检查
pub fn reference_registry(
    config: &AppConfig,
    llm: Arc<dyn LlmClient>,
    source: Option<Arc<dyn DataSource>>,
    cache: Option<Arc<SchemaCache>>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(TimeWindowTool);
    registry.register(SqlDraftTool::new(llm.clone()));
    registry.register(SqlRefineTool::new(llm));
    registry.register(SqlValidateTool::new(source.clone()));
    registry.register(SqlPolicyTool::new(config.tools.default_row_limit));
    registry.register(DataQualityTool);
    registry.register(ChartSpecTool);
    registry.register(WordChartGeneratorTool::new(config.app.output_dir.clone()));

    if let Some(source) = source {
        let cache = cache.unwrap_or_else(|| {
            Arc::new(SchemaCache::new(Duration::from_secs(
                config.tools.schema_cache_ttl_secs,
            )))
        });
        registry.register(ListTablesTool::new(source.clone(), cache.clone()));
        registry.register(ListColumnsTool::new(source.clone(), cache));
        registry.register(SqlExecuteTool::new(
            source,
            config.tools.default_row_limit,
            config.tools.sample_rows,
        ));
    }
    registry
}
