//! 扇入屏障（join-count）
//!
//! 以计划中的 Agent 集合初始化，剩余计数降为 0 时才能产出 EvidenceBundle；
//! 未派发或重复上报的 Agent 直接拒绝，保证证据包与计划一一对应。

use std::collections::HashMap;

use thiserror::Error;

use crate::retrieval::{AgentId, AgentOutcome, EvidenceBundle};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    #[error("Agent '{0}' was not dispatched in this run")]
    UnknownAgent(AgentId),
    #[error("Agent '{0}' already reported an outcome")]
    DuplicateOutcome(AgentId),
    #[error("Join is incomplete: {remaining} agent(s) still pending")]
    Incomplete { remaining: usize },
}

/// 扇入屏障
#[derive(Debug)]
pub struct JoinBarrier {
    /// 计划顺序
    order: Vec<AgentId>,
    outcomes: HashMap<AgentId, Option<AgentOutcome>>,
    remaining: usize,
}

impl JoinBarrier {
    /// 以派发的 Agent 列表初始化（调用方保证无重复）
    pub fn new(dispatched: &[AgentId]) -> Self {
        let outcomes: HashMap<AgentId, Option<AgentOutcome>> =
            dispatched.iter().map(|id| (id.clone(), None)).collect();
        Self {
            order: dispatched.to_vec(),
            remaining: outcomes.len(),
            outcomes,
        }
    }

    /// 记录一个 Agent 的终止结果，返回剩余未完成数
    pub fn record(&mut self, agent: AgentId, outcome: AgentOutcome) -> Result<usize, JoinError> {
        let slot = self
            .outcomes
            .get_mut(&agent)
            .ok_or_else(|| JoinError::UnknownAgent(agent.clone()))?;
        if slot.is_some() {
            return Err(JoinError::DuplicateOutcome(agent));
        }
        *slot = Some(outcome);
        self.remaining -= 1;
        Ok(self.remaining)
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    /// 尚未上报的 Agent（按计划顺序）
    pub fn pending(&self) -> Vec<AgentId> {
        self.order
            .iter()
            .filter(|id| matches!(self.outcomes.get(*id), Some(None)))
            .cloned()
            .collect()
    }

    /// 全部终止后产出证据包
    pub fn into_bundle(self) -> Result<EvidenceBundle, JoinError> {
        if !self.is_complete() {
            return Err(JoinError::Incomplete {
                remaining: self.remaining,
            });
        }
        let outcomes = self
            .outcomes
            .into_iter()
            .filter_map(|(id, o)| o.map(|o| (id, o)))
            .collect();
        Ok(EvidenceBundle::from_parts(self.order, outcomes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RetrievalError;

    fn ids(names: &[&str]) -> Vec<AgentId> {
        names.iter().map(|n| AgentId::new(*n)).collect()
    }

    #[test]
    fn test_join_only_after_all_outcomes() {
        let mut barrier = JoinBarrier::new(&ids(&["a", "b", "c"]));
        assert_eq!(
            barrier.record(AgentId::new("b"), AgentOutcome::Completed { items: vec![] }),
            Ok(2)
        );
        assert_eq!(barrier.pending(), ids(&["a", "c"]));
        barrier
            .record(
                AgentId::new("a"),
                AgentOutcome::Failed {
                    error: RetrievalError::backend(AgentId::new("a"), "down"),
                },
            )
            .unwrap();
        assert!(!barrier.is_complete());

        barrier
            .record(AgentId::new("c"), AgentOutcome::Completed { items: vec![] })
            .unwrap();
        let bundle = barrier.into_bundle().unwrap();
        assert_eq!(bundle.len(), 3);
        assert_eq!(bundle.failures().count(), 1);
        let order: Vec<&str> = bundle.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_rejects_unknown_and_duplicate() {
        let mut barrier = JoinBarrier::new(&ids(&["a"]));
        assert_eq!(
            barrier.record(AgentId::new("x"), AgentOutcome::Completed { items: vec![] }),
            Err(JoinError::UnknownAgent(AgentId::new("x")))
        );
        barrier
            .record(AgentId::new("a"), AgentOutcome::Completed { items: vec![] })
            .unwrap();
        assert_eq!(
            barrier.record(AgentId::new("a"), AgentOutcome::Completed { items: vec![] }),
            Err(JoinError::DuplicateOutcome(AgentId::new("a")))
        );
    }

    #[test]
    fn test_incomplete_and_empty() {
        let barrier = JoinBarrier::new(&ids(&["a"]));
        assert_eq!(
            barrier.into_bundle().unwrap_err(),
            JoinError::Incomplete { remaining: 1 }
        );
        let empty = JoinBarrier::new(&[]);
        assert!(empty.is_complete());
        assert!(empty.into_bundle().unwrap().is_empty());
    }
}
