//! 检索层：Agent 目录、执行器（超时 / 取消 / 审计）与内置 Agent（运营数据、政策文档、长期记忆）

pub mod executor;
pub mod memory;
pub mod operations;
pub mod policy;
pub mod registry;
pub mod types;

pub use executor::AgentExecutor;
pub use memory::MemoryAgent;
pub use operations::{OperationsAgent, RecordKind};
pub use policy::PolicyAgent;
pub use registry::{AgentCatalog, RetrievalAgent};
pub use types::{
    AgentId, AgentOutcome, Budget, EvidenceBundle, EvidenceItem, RetrievalRequest, MEMORY, OPERATIONS, POLICY,
};
