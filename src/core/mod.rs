//! 核心编排层：错误与恢复、输入输出类型、循环状态、编排器与构建器

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod state;
pub mod types;

pub use builder::{create_orchestrator_builder, OrchestratorBuilder};
pub use error::{AgentError, ErrorKind, ExitPattern, RecoveryAction, ToolError};
pub use orchestrator::Orchestrator;
pub use recovery::RecoveryEngine;
pub use state::{ExecutionContext, IterationRecord, LoopPhase};
pub use types::{
    AgentInput, AgentOutput, Constraints, ExecutionMode, OutputKind, PlaceholderSpec, SchemaInfo,
    TaskContext, TimeWindow,
};
