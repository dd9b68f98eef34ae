//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `REPORT_AGENT__*` 覆盖
//! （双下划线表示嵌套，如 `REPORT_AGENT__AGENT__MAX_ITERATIONS=10`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub task: TaskSection,
}

/// [app] 段：应用名、图表产物目录
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 图表产物输出目录，未设置时用 ./output
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            output_dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock；优先级由 API Key 与 provider 共同决定
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub deepseek: LlmModelOverride,
    #[serde(default)]
    pub openai: LlmModelOverride,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            deepseek: LlmModelOverride::default(),
            openai: LlmModelOverride::default(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmModelOverride {
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [agent] 段：PTAV 循环的迭代上限、墙钟超时、修复次数与提前退出阈值
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// 整个循环的墙钟超时（秒），在每轮迭代边界检查
    #[serde(default = "default_iteration_timeout_secs")]
    pub iteration_timeout_secs: u64,
    #[serde(default = "default_max_sql_fix_attempts")]
    pub max_sql_fix_attempts: u32,
    /// 从第几轮起开始做模式分析
    #[serde(default = "default_early_exit_min_iterations")]
    pub early_exit_min_iterations: usize,
    /// 多少轮仍无 SQL 视为无进展
    #[serde(default = "default_no_progress_iterations")]
    pub no_progress_iterations: usize,
    /// 同一工具连续失败多少次视为重复失败
    #[serde(default = "default_repeated_failure_threshold")]
    pub repeated_failure_threshold: usize,
    /// 连接类错误累计多少次视为连接不稳定
    #[serde(default = "default_connection_error_threshold")]
    pub connection_error_threshold: usize,
    /// schema 获取尝试多少次后仍为空视为不可用
    #[serde(default = "default_schema_fetch_attempts")]
    pub schema_fetch_attempts: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            iteration_timeout_secs: default_iteration_timeout_secs(),
            max_sql_fix_attempts: default_max_sql_fix_attempts(),
            early_exit_min_iterations: default_early_exit_min_iterations(),
            no_progress_iterations: default_no_progress_iterations(),
            repeated_failure_threshold: default_repeated_failure_threshold(),
            connection_error_threshold: default_connection_error_threshold(),
            schema_fetch_attempts: default_schema_fetch_attempts(),
        }
    }
}

impl AgentSection {
    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }
}

fn default_max_iterations() -> usize {
    15
}

fn default_iteration_timeout_secs() -> u64 {
    300
}

fn default_max_sql_fix_attempts() -> u32 {
    3
}

fn default_early_exit_min_iterations() -> usize {
    3
}

fn default_no_progress_iterations() -> usize {
    5
}

fn default_repeated_failure_threshold() -> usize {
    3
}

fn default_connection_error_threshold() -> usize {
    3
}

fn default_schema_fetch_attempts() -> usize {
    2
}

/// [tools] 段：工具超时、行数策略、schema 缓存
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// 未指定 row_limit 时 sql.policy 使用的 LIMIT
    #[serde(default = "default_row_limit")]
    pub default_row_limit: usize,
    /// sql.execute 写回上下文的样例行数
    #[serde(default = "default_sample_rows")]
    pub sample_rows: usize,
    #[serde(default = "default_schema_cache_ttl_secs")]
    pub schema_cache_ttl_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            default_row_limit: default_row_limit(),
            sample_rows: default_sample_rows(),
            schema_cache_ttl_secs: default_schema_cache_ttl_secs(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_row_limit() -> usize {
    1000
}

fn default_sample_rows() -> usize {
    5
}

fn default_schema_cache_ttl_secs() -> u64 {
    300
}

/// [task] 段：任务调度上下文的默认时区与 cron
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSection {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_cron")]
    pub cron: String,
}

impl Default for TaskSection {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            cron: default_cron(),
        }
    }
}

pub(crate) fn default_timezone() -> String {
    "Asia/Shanghai".to_string()
}

pub(crate) fn default_cron() -> String {
    "0 9 * * *".to_string()
}

/// 从 config 目录加载配置，环境变量 REPORT_AGENT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 REPORT_AGENT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("REPORT_AGENT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_iterations, 15);
        assert_eq!(cfg.agent.iteration_timeout_secs, 300);
        assert_eq!(cfg.agent.max_sql_fix_attempts, 3);
        assert_eq!(cfg.task.timezone, "Asia/Shanghai");
        assert_eq!(cfg.task.cron, "0 9 * * *");
        assert_eq!(cfg.tools.default_row_limit, 1000);
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[agent]\nmax_iterations = 7\niteration_timeout_secs = 42\n\n[tools]\ndefault_row_limit = 50"
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.agent.max_iterations, 7);
        assert_eq!(cfg.agent.iteration_timeout(), Duration::from_secs(42));
        assert_eq!(cfg.tools.default_row_limit, 50);
        // 未出现的键保持默认
        assert_eq!(cfg.agent.max_sql_fix_attempts, 3);
        assert_eq!(cfg.tools.tool_timeout_secs, 30);
    }
}
