//! 记忆层：ResourcePool（完整中间产物）与 ContextMemory（供下一轮规划的压缩投影）

pub mod context_memory;
pub mod conversation;
pub mod resource_pool;

pub use context_memory::ContextMemory;
pub use conversation::{Message, Role};
pub use resource_pool::{
    ColumnDetail, ColumnDetails, ContextUpdate, ExecutionSummary, ResourcePool, SqlSource,
    StepContext, StepKind,
};
