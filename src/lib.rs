//! Report Agent - 报告占位符智能体核心
//!
//! 将模板中的自然语言占位符（如「{{销售额:本月}}」）转换为可执行 SQL，
//! 在数据源上执行并产出结果或图表。核心是单步 PTAV（Plan → Tool → Active → Validate）循环。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、输入输出类型、循环状态、提前退出分析、编排器与构建器
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / 路由 / Mock）
//! - **memory**: ResourcePool（完整中间产物）与 ContextMemory（压缩投影）
//! - **observability**: 日志初始化
//! - **ptav**: Planner、GoalValidator、PTAV 主循环与过程事件
//! - **tools**: 工具注册表、执行器、数据源与 SQL / 图表工具集

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod ptav;
pub mod tools;

pub use crate::core::{
    AgentInput, AgentOutput, ExecutionMode, Orchestrator, OrchestratorBuilder,
};
