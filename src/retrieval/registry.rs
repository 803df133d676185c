//! 检索 Agent 目录
//!
//! 所有 Agent 实现 RetrievalAgent trait（id / description / retrieve），由 AgentCatalog 按 id 注册；
//! 目录同时记录启用集合，Planner 只能选出已启用的 Agent。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::RetrievalError;
use crate::retrieval::{AgentId, Budget, EvidenceItem, RetrievalRequest};

/// 检索 Agent：并发安全、无共享可变状态、幂等
#[async_trait]
pub trait RetrievalAgent: Send + Sync {
    /// 目录中的唯一标识
    fn id(&self) -> &str;

    fn description(&self) -> &str;

    /// 返回按相关度排列的证据，条数不超过 budget.max_items
    async fn retrieve(
        &self,
        request: &RetrievalRequest,
        budget: &Budget,
    ) -> Result<Vec<EvidenceItem>, RetrievalError>;
}

/// Agent 目录：按 id 存储 Arc<dyn RetrievalAgent>，并维护启用集合
#[derive(Default, Clone)]
pub struct AgentCatalog {
    agents: HashMap<AgentId, Arc<dyn RetrievalAgent>>,
    /// None 表示全部启用
    enabled: Option<BTreeSet<AgentId>>,
}

impl AgentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: impl RetrievalAgent + 'static) {
        self.register_arc(Arc::new(agent));
    }

    pub fn register_arc(&mut self, agent: Arc<dyn RetrievalAgent>) {
        let id = AgentId::new(agent.id());
        self.agents.insert(id, agent);
    }

    /// 限定启用集合；未注册的 id 被忽略并告警
    pub fn set_enabled<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = BTreeSet::new();
        for id in ids {
            let id = AgentId::new(id.as_ref());
            if self.agents.contains_key(&id) {
                set.insert(id);
            } else {
                tracing::warn!(agent = %id, "enabled agent is not registered, ignoring");
            }
        }
        self.enabled = Some(set);
    }

    pub fn is_enabled(&self, id: &AgentId) -> bool {
        self.agents.contains_key(id)
            && self.enabled.as_ref().map_or(true, |set| set.contains(id))
    }

    /// 仅返回已启用的 Agent
    pub fn get(&self, id: &AgentId) -> Option<Arc<dyn RetrievalAgent>> {
        if self.is_enabled(id) {
            self.agents.get(id).cloned()
        } else {
            None
        }
    }

    /// 已启用的 id（排序，便于日志与测试）
    pub fn enabled_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self
            .agents
            .keys()
            .filter(|id| self.is_enabled(id))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// 返回 (id, description) 列表
    pub fn descriptions(&self) -> Vec<(String, String)> {
        self.enabled_ids()
            .into_iter()
            .filter_map(|id| {
                self.agents
                    .get(&id)
                    .map(|a| (id.to_string(), a.description().to_string()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
