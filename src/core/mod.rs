//! 核心编排层：错误与恢复、运行状态机、运行监管、后台任务监管、编排器与构建器

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod run_supervisor;
pub mod state;
pub mod task_supervisor;

pub use builder::{create_orchestrator_builder, OrchestratorBuilder};
pub use error::{DetachedTaskError, PipelineError, RecoveryAction, RetrievalCause, RetrievalError};
pub use orchestrator::{Orchestrator, OrchestratorParts, QueryRequest, RunHandle, RunResult};
pub use recovery::RecoveryEngine;
pub use run_supervisor::RunSupervisor;
pub use state::{RunState, RunStateMachine, TransitionError};
pub use task_supervisor::{
    DetachedStatus, DetachedTaskId, DetachedTaskKind, DetachedTaskRecord, SupervisorStats, TaskSupervisor,
};
