//! 编排器构建器：统一的初始化逻辑
//!
//! 按配置装配 LLM、数据源、schema 缓存与工具注册表；调用方注入的同名工具覆盖参考实现。
//! 缓存由构建器显式创建并注入，每个编排器实例各自持有，不使用进程级全局状态。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::config::AppConfig;
use crate::core::Orchestrator;
use crate::llm::{create_llm_from_config, LlmClient};
use crate::ptav::PtavEvent;
use crate::tools::{reference_registry, DataSource, SchemaCache, Tool};

pub struct OrchestratorBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    source: Option<Arc<dyn DataSource>>,
    cache: Option<Arc<SchemaCache>>,
    extra_tools: Vec<Arc<dyn Tool>>,
    event_tx: Option<UnboundedSender<PtavEvent>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            source: None,
            cache: None,
            extra_tools: Vec::new(),
            event_tx: None,
        }
    }

    /// 指定 LLM 客户端；未指定时按配置与环境变量创建
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_data_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// 注入 schema 缓存（多个编排器可显式共享同一缓存）
    pub fn with_schema_cache(mut self, cache: Arc<SchemaCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// 追加或覆盖工具（按名称覆盖参考工具）
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.extra_tools.push(tool);
        self
    }

    pub fn with_event_sender(mut self, tx: UnboundedSender<PtavEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn build(self) -> Orchestrator {
        let llm = self
            .llm
            .unwrap_or_else(|| create_llm_from_config(&self.config));
        let cache = self.cache.unwrap_or_else(|| {
            Arc::new(SchemaCache::new(Duration::from_secs(
                self.config.tools.schema_cache_ttl_secs,
            )))
        });
        let mut registry = reference_registry(&self.config, llm.clone(), self.source, Some(cache));
        for tool in self.extra_tools {
            registry.register_arc(tool);
        }
        tracing::info!(tools = ?registry.tool_names(), "orchestrator built");
        Orchestrator::from_parts(self.config, llm, Arc::new(registry), self.event_tx)
    }
}

/// 便捷函数：从配置文件创建构建器，加载失败时使用默认配置
pub fn create_orchestrator_builder(config_path: Option<PathBuf>) -> OrchestratorBuilder {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    OrchestratorBuilder::new(config)
}
