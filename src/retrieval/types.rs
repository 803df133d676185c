//! 检索类型：Agent 标识、证据、预算、检索请求、证据包

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::RetrievalError;
use crate::pipeline::{CaseEntities, Intent};

/// 内置 Agent 标识
pub const OPERATIONS: &str = "operations";
pub const POLICY: &str = "policy";
pub const MEMORY: &str = "memory";

/// 检索 Agent 标识
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// 单条证据：由且仅由一个 Agent 产出
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EvidenceItem {
    pub agent: AgentId,
    /// 来源标识（文档 ID、记录 ID 等）
    pub source: String,
    pub excerpt: String,
    /// 相关度，[0,1]
    pub score: f32,
}

impl EvidenceItem {
    pub fn new(agent: AgentId, source: impl Into<String>, excerpt: impl Into<String>, score: f32) -> Self {
        Self {
            agent,
            source: source.into(),
            excerpt: excerpt.into(),
            score: score.clamp(0.0, 1.0),
        }
    }
}

/// 检索预算：条数上限 + 时间上限
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Budget {
    pub max_items: usize,
    pub timeout: Duration,
}

/// 交给检索 Agent 的只读上下文快照（各 Agent 共享同一份 Arc，无可变共享状态）
#[derive(Clone, Debug, Serialize)]
pub struct RetrievalRequest {
    pub run_id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub query: String,
    pub entities: CaseEntities,
    pub intent: Intent,
    pub summary: Option<String>,
}

/// 单个 Agent 的终止结果
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AgentOutcome {
    Completed { items: Vec<EvidenceItem> },
    Failed { error: RetrievalError },
}

impl AgentOutcome {
    pub fn items(&self) -> &[EvidenceItem] {
        match self {
            AgentOutcome::Completed { items } => items,
            AgentOutcome::Failed { .. } => &[],
        }
    }

    pub fn error(&self) -> Option<&RetrievalError> {
        match self {
            AgentOutcome::Completed { .. } => None,
            AgentOutcome::Failed { error } => Some(error),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error().is_some()
    }
}

/// 证据包：Agent -> 结果；条目数恒等于计划中派发的 Agent 数，只能由 JoinBarrier 在全部终止后产出
#[derive(Clone, Debug, Default, Serialize)]
pub struct EvidenceBundle {
    /// 按计划顺序
    order: Vec<AgentId>,
    outcomes: HashMap<AgentId, AgentOutcome>,
}

impl EvidenceBundle {
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(order: Vec<AgentId>, outcomes: HashMap<AgentId, AgentOutcome>) -> Self {
        Self { order, outcomes }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, agent: &AgentId) -> Option<&AgentOutcome> {
        self.outcomes.get(agent)
    }

    /// 按计划顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = (&AgentId, &AgentOutcome)> {
        self.order
            .iter()
            .filter_map(move |id| self.outcomes.get(id).map(|o| (id, o)))
    }

    /// 所有成功证据
    pub fn items(&self) -> impl Iterator<Item = &EvidenceItem> {
        self.iter().flat_map(|(_, o)| o.items().iter())
    }

    pub fn item_count(&self) -> usize {
        self.items().count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &RetrievalError> {
        self.iter().filter_map(|(_, o)| o.error())
    }

    pub fn succeeded_agents(&self) -> usize {
        self.iter().filter(|(_, o)| !o.is_failure()).count()
    }

    pub fn has_evidence(&self) -> bool {
        self.items().next().is_some()
    }
}
