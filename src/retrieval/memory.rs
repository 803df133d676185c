//! 记忆 Agent：经 MemoryStore 读取用户的分层记忆与应用级语义记忆

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::RetrievalError;
use crate::memory::{MemoryScope, MemoryStore, MemoryTier};
use crate::retrieval::{AgentId, Budget, EvidenceItem, RetrievalAgent, RetrievalRequest, MEMORY};

/// (作用域是否为用户, 层级, 基础分)
const READS: [(bool, MemoryTier, f32); 4] = [
    (true, MemoryTier::Episodic, 0.7),
    (true, MemoryTier::Procedural, 0.6),
    (true, MemoryTier::Semantic, 0.6),
    (false, MemoryTier::Semantic, 0.5),
];

pub struct MemoryAgent {
    store: Arc<dyn MemoryStore>,
}

impl MemoryAgent {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RetrievalAgent for MemoryAgent {
    fn id(&self) -> &str {
        MEMORY
    }

    fn description(&self) -> &str {
        "Long-term memory: the user's history plus application-wide operational facts"
    }

    async fn retrieve(
        &self,
        request: &RetrievalRequest,
        budget: &Budget,
    ) -> Result<Vec<EvidenceItem>, RetrievalError> {
        let id = AgentId::new(MEMORY);
        let user_scope = MemoryScope::User(request.user_id.clone());
        let app_scope = MemoryScope::Application;
        let mut items = Vec::new();

        for (user, tier, base) in READS {
            if items.len() >= budget.max_items {
                break;
            }
            let scope = if user { &user_scope } else { &app_scope };
            let records = self
                .store
                .read(scope, tier, &request.query, budget.max_items - items.len())
                .await
                .map_err(|e| RetrievalError::backend(id.clone(), e))?;
            let n = records.len().max(1) as f32;
            items.extend(records.into_iter().enumerate().map(|(rank, r)| {
                // 同一层级内按排名衰减
                let score = base * (1.0 - rank as f32 / (2.0 * n));
                EvidenceItem::new(
                    id.clone(),
                    format!("memory:{}:{}", tier.as_str(), if user { "user" } else { "app" }),
                    r.content,
                    score,
                )
            }));
        }
        Ok(items)
    }
}
