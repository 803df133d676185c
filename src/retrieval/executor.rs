//! 检索执行器
//!
//! 持有 AgentCatalog 与预算，execute(agent_id, request, cancel) 在超时内调用 Agent，
//! 超时、取消、后端错误与 panic 都转为 AgentOutcome::Failed（永不向上抛出）；
//! 每次调用输出结构化审计日志（JSON）。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::task_supervisor::panic_message;
use crate::core::{RetrievalCause, RetrievalError};
use crate::retrieval::{AgentCatalog, AgentId, AgentOutcome, Budget, RetrievalRequest};

/// 检索执行器：可 Clone，每个扇出任务持有一份
#[derive(Clone)]
pub struct AgentExecutor {
    catalog: AgentCatalog,
    budget: Budget,
}

impl AgentExecutor {
    pub fn new(catalog: AgentCatalog, max_items: usize, timeout: Duration) -> Self {
        Self {
            catalog,
            budget: Budget { max_items, timeout },
        }
    }

    pub fn catalog(&self) -> &AgentCatalog {
        &self.catalog
    }

    pub fn budget(&self) -> Budget {
        self.budget
    }

    /// 执行单个 Agent，总是返回终止结果
    pub async fn execute(
        &self,
        agent_id: &AgentId,
        request: Arc<RetrievalRequest>,
        cancel: CancellationToken,
    ) -> AgentOutcome {
        let start = Instant::now();
        let outcome = self.run(agent_id, &request, &cancel).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let label = match &outcome {
            AgentOutcome::Completed { .. } => "ok",
            AgentOutcome::Failed { error } => match error.cause {
                RetrievalCause::Timeout { .. } => "timeout",
                RetrievalCause::Cancelled => "cancelled",
                _ => "error",
            },
        };
        let audit = serde_json::json!({
            "event": "retrieval_audit",
            "run_id": request.run_id,
            "agent": agent_id.as_str(),
            "ok": !outcome.is_failure(),
            "outcome": label,
            "duration_ms": duration_ms,
            "items": outcome.items().len(),
        });
        tracing::info!(audit = %audit.to_string(), "retrieval");
        outcome
    }

    async fn run(
        &self,
        agent_id: &AgentId,
        request: &RetrievalRequest,
        cancel: &CancellationToken,
    ) -> AgentOutcome {
        let Some(agent) = self.catalog.get(agent_id) else {
            return failed(agent_id, RetrievalCause::Backend("agent is not enabled".to_string()));
        };
        let budget = self.budget;
        let call = AssertUnwindSafe(agent.retrieve(request, &budget)).catch_unwind();

        let result = tokio::select! {
            _ = cancel.cancelled() => return failed(agent_id, RetrievalCause::Cancelled),
            r = timeout(budget.timeout, call) => r,
        };

        match result {
            Err(_) => failed(
                agent_id,
                RetrievalCause::Timeout {
                    after_ms: budget.timeout.as_millis() as u64,
                },
            ),
            Ok(Err(payload)) => failed(agent_id, RetrievalCause::Panicked(panic_message(payload.as_ref()))),
            Ok(Ok(Err(mut e))) => {
                // 来源以目录 id 为准
                e.source = agent_id.clone();
                AgentOutcome::Failed { error: e }
            }
            Ok(Ok(Ok(mut items))) => {
                if items.len() > budget.max_items {
                    tracing::warn!(
                        agent = %agent_id,
                        returned = items.len(),
                        max_items = budget.max_items,
                        "Agent exceeded item budget, truncating"
                    );
                    items.truncate(budget.max_items);
                }
                for item in items.iter_mut() {
                    item.agent = agent_id.clone();
                }
                AgentOutcome::Completed { items }
            }
        }
    }
}

fn failed(agent_id: &AgentId, cause: RetrievalCause) -> AgentOutcome {
    AgentOutcome::Failed {
        error: RetrievalError::new(agent_id.clone(), cause),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::pipeline::{CaseEntities, Intent};
    use crate::retrieval::{EvidenceItem, RetrievalAgent};

    struct Slow {
        id: &'static str,
        delay: Duration,
        items: usize,
    }

    #[async_trait]
    impl RetrievalAgent for Slow {
        fn id(&self) -> &str {
            self.id
        }

        fn description(&self) -> &str {
            "sleeps then returns items"
        }

        async fn retrieve(
            &self,
            _request: &RetrievalRequest,
            _budget: &Budget,
        ) -> Result<Vec<EvidenceItem>, RetrievalError> {
            tokio::time::sleep(self.delay).await;
            if self.id == "boom" {
                panic!("backend exploded");
            }
            Ok((0..self.items)
                .map(|i| EvidenceItem::new(AgentId::new("wrong"), format!("doc-{i}"), "text", 0.5))
                .collect())
        }
    }

    fn request() -> Arc<RetrievalRequest> {
        Arc::new(RetrievalRequest {
            run_id: "r1".into(),
            user_id: "u1".into(),
            conversation_id: "c1".into(),
            query: "where is my order".into(),
            entities: CaseEntities::default(),
            intent: Intent::fallback(),
            summary: None,
        })
    }

    fn executor() -> AgentExecutor {
        let mut catalog = AgentCatalog::new();
        catalog.register(Slow { id: "fast", delay: Duration::from_millis(50), items: 8 });
        catalog.register(Slow { id: "slow", delay: Duration::from_millis(200), items: 1 });
        catalog.register(Slow { id: "boom", delay: Duration::from_millis(1), items: 0 });
        AgentExecutor::new(catalog, 3, Duration::from_millis(150))
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncates_to_budget_and_stamps_agent() {
        let out = executor()
            .execute(&AgentId::new("fast"), request(), CancellationToken::new())
            .await;
        assert_eq!(out.items().len(), 3);
        assert!(out.items().iter().all(|i| i.agent.as_str() == "fast"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_failed_outcome() {
        let out = executor()
            .execute(&AgentId::new("slow"), request(), CancellationToken::new())
            .await;
        let err = out.error().expect("timed out");
        assert!(err.is_timeout());
        assert_eq!(err.source.as_str(), "slow");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_panic_are_captured() {
        let exec = executor();
        let token = CancellationToken::new();
        token.cancel();
        let out = exec.execute(&AgentId::new("slow"), request(), token).await;
        assert_eq!(out.error().map(|e| e.cause.clone()), Some(RetrievalCause::Cancelled));

        let out = exec
            .execute(&AgentId::new("boom"), request(), CancellationToken::new())
            .await;
        assert!(matches!(
            out.error().map(|e| &e.cause),
            Some(RetrievalCause::Panicked(msg)) if msg.contains("exploded")
        ));
    }

    #[tokio::test]
    async fn test_unknown_agent_is_backend_failure() {
        let out = executor()
            .execute(&AgentId::new("ghost"), request(), CancellationToken::new())
            .await;
        assert!(matches!(out.error().map(|e| &e.cause), Some(RetrievalCause::Backend(_))));
    }
}
