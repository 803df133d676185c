//! 编排错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 PipelineError 决定 DegradeEvidence / Escalate / Abort。

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::core::state::TransitionError;
use crate::retrieval::AgentId;
use crate::workflow::JoinError;

/// 单次运行中可能出现的错误（按阶段划分）
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("Ingestion failed: {0}")]
    Ingestion(String),

    #[error("Planning failed: {0}")]
    Planning(String),

    /// 单个检索 Agent 失败：非致命，降级为空证据 + 错误标记
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error("Reasoning failed: {0}")]
    Reasoning(String),

    /// 安全闸门自身故障：绝不能默认放行，运行会被解析为 ESCALATE
    #[error("Safety gate failed: {0}")]
    Gate(String),

    #[error("Run timed out after {}ms", .0.as_millis())]
    RunTimeout(Duration),

    /// 调用方断开或主动取消
    #[error("Run cancelled")]
    Cancelled,

    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// 扇入屏障状态不一致（内部错误）
    #[error(transparent)]
    Join(#[from] JoinError),
}

impl PipelineError {
    /// 是否终止本次运行（检索错误只降级证据，不终止）
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PipelineError::Retrieval(_))
    }

    /// 简短类别名（写入 error 事件与日志）
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Ingestion(_) => "ingestion",
            PipelineError::Planning(_) => "planning",
            PipelineError::Retrieval(_) => "retrieval",
            PipelineError::Reasoning(_) => "reasoning",
            PipelineError::Gate(_) => "gate",
            PipelineError::RunTimeout(_) => "run_timeout",
            PipelineError::Cancelled => "cancelled",
            PipelineError::Transition(_) => "transition",
            PipelineError::Join(_) => "join",
        }
    }
}

/// 检索失败原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum RetrievalCause {
    /// 超过单 Agent 超时
    Timeout { after_ms: u64 },
    /// 后端返回错误
    Backend(String),
    /// 运行被取消时仍未完成
    Cancelled,
    /// Agent 任务 panic
    Panicked(String),
}

impl std::fmt::Display for RetrievalCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetrievalCause::Timeout { after_ms } => write!(f, "timed out after {after_ms}ms"),
            RetrievalCause::Backend(msg) => write!(f, "backend error: {msg}"),
            RetrievalCause::Cancelled => write!(f, "cancelled"),
            RetrievalCause::Panicked(msg) => write!(f, "panicked: {msg}"),
        }
    }
}

/// 单个检索 Agent 的失败：来源 + 原因
///
/// 字段名 `source` 与 thiserror 的错误链约定冲突，故手写 Display / Error。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetrievalError {
    pub source: AgentId,
    pub cause: RetrievalCause,
}

impl std::fmt::Display for RetrievalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Retrieval agent '{}' failed: {}", self.source, self.cause)
    }
}

impl std::error::Error for RetrievalError {}

impl RetrievalError {
    pub fn new(source: AgentId, cause: RetrievalCause) -> Self {
        Self { source, cause }
    }

    pub fn backend(source: AgentId, msg: impl Into<String>) -> Self {
        Self::new(source, RetrievalCause::Backend(msg.into()))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.cause, RetrievalCause::Timeout { .. })
    }
}

/// 后台任务失败：只记录日志与诊断，不影响已交付的结果
#[derive(Error, Debug, Clone)]
#[error("Detached task '{task}' failed: {cause}")]
pub struct DetachedTaskError {
    pub task: String,
    pub cause: String,
}

impl DetachedTaskError {
    pub fn new(task: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            cause: cause.into(),
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 记为错误标记，证据降级后继续
    DegradeEvidence,
    /// 交由人工处理（闸门故障）
    Escalate,
    /// 终止本次运行并发出终止 error 事件
    Abort,
}
