//! 错误恢复引擎
//!
//! 根据 PipelineError 类型返回 RecoveryAction，供编排器决定是降级证据、交由人工还是终止运行。

use crate::core::{PipelineError, RecoveryAction};

/// 失败策略：检索错误降级、闸门故障升级、其余致命错误终止
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &PipelineError) -> RecoveryAction {
        match err {
            PipelineError::Retrieval(_) => RecoveryAction::DegradeEvidence,
            PipelineError::Gate(_) => RecoveryAction::Escalate,
            PipelineError::Ingestion(_)
            | PipelineError::Planning(_)
            | PipelineError::Reasoning(_)
            | PipelineError::RunTimeout(_)
            | PipelineError::Cancelled
            | PipelineError::Transition(_)
            | PipelineError::Join(_) => RecoveryAction::Abort,
        }
    }
}
