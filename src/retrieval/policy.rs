//! 政策文档 Agent：对政策文档做关键词重叠检索

use std::collections::HashSet;

use async_trait::async_trait;

use crate::config::PolicyEntry;
use crate::core::RetrievalError;
use crate::memory::tokenize_lower;
use crate::retrieval::{AgentId, Budget, EvidenceItem, RetrievalAgent, RetrievalRequest, POLICY};

/// 摘录最大字符数
const EXCERPT_CHARS: usize = 280;

struct PolicyDoc {
    id: String,
    title: String,
    body: String,
    tokens: HashSet<String>,
}

#[derive(Default)]
pub struct PolicyAgent {
    docs: Vec<PolicyDoc>,
}

impl PolicyAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(mut self, id: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        let title = title.into();
        let body = body.into();
        let tokens = tokenize_lower(&format!("{title} {body}"));
        self.docs.push(PolicyDoc {
            id: id.into(),
            title,
            body,
            tokens,
        });
        self
    }

    pub fn from_entries(entries: &[PolicyEntry]) -> Self {
        entries.iter().fold(Self::new(), |agent, e| {
            agent.with_document(e.id.clone(), e.title.clone(), e.body.clone())
        })
    }
}

#[async_trait]
impl RetrievalAgent for PolicyAgent {
    fn id(&self) -> &str {
        POLICY
    }

    fn description(&self) -> &str {
        "Refund, compensation and safety policy documents"
    }

    async fn retrieve(
        &self,
        request: &RetrievalRequest,
        budget: &Budget,
    ) -> Result<Vec<EvidenceItem>, RetrievalError> {
        // 问题类型本身也作为查询词（如 "refund"）
        let mut query = tokenize_lower(&request.query);
        query.extend(tokenize_lower(&request.intent.issue.as_str().replace('_', " ")));
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, &PolicyDoc)> = self
            .docs
            .iter()
            .map(|d| (query.intersection(&d.tokens).count(), d))
            .filter(|(s, _)| *s > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));

        let denom = query.len() as f32;
        Ok(scored
            .into_iter()
            .take(budget.max_items)
            .map(|(hits, d)| {
                let excerpt: String = format!("{}: {}", d.title, d.body)
                    .chars()
                    .take(EXCERPT_CHARS)
                    .collect();
                EvidenceItem::new(AgentId::new(POLICY), d.id.clone(), excerpt, hits as f32 / denom)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::pipeline::{CaseEntities, Intent, IssueKind};

    #[tokio::test]
    async fn test_ranked_by_overlap_and_budget() {
        let agent = PolicyAgent::new()
            .with_document("p-refund", "Refund policy", "Orders delivered late by more than 30 minutes get a refund")
            .with_document("p-quality", "Food quality", "Cold or damaged food is replaced")
            .with_document("p-account", "Account", "Password resets via email");
        let mut intent = Intent::fallback();
        intent.issue = IssueKind::Refund;
        let request = RetrievalRequest {
            run_id: "r".into(),
            user_id: "u".into(),
            conversation_id: "c".into(),
            query: "my order was delivered late, cold food".into(),
            entities: CaseEntities::default(),
            intent,
            summary: None,
        };

        let items = agent
            .retrieve(&request, &Budget { max_items: 1, timeout: Duration::from_secs(1) })
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].source, "p-refund");
        assert!(items[0].score > 0.0 && items[0].score <= 1.0);
    }
}
