//! 扇出 / 扇入：为 Plan 中每个 Agent 派发独立任务，全部终止后经 JoinBarrier 产出证据包
//!
//! 每个任务持有运行取消令牌的子令牌；运行被取消时中止全部在途任务并返回 Cancelled。
//! 单个 Agent 的失败只作为 error 标记事件发出，不会使运行失败。

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::{PipelineError, RetrievalCause, RetrievalError, RunState};
use crate::pipeline::{EventKind, EventStreamer};
use crate::retrieval::{AgentExecutor, AgentId, AgentOutcome, EvidenceBundle, RetrievalRequest};
use crate::workflow::JoinBarrier;

/// 派发并等待全部 Agent；空计划立即汇合
pub async fn fan_out(
    executor: &AgentExecutor,
    agents: &[AgentId],
    request: Arc<RetrievalRequest>,
    cancel: &CancellationToken,
    events: &mut EventStreamer,
) -> Result<EvidenceBundle, PipelineError> {
    let mut barrier = JoinBarrier::new(agents);
    if barrier.is_complete() {
        return Ok(barrier.into_bundle()?);
    }

    let mut tasks = JoinSet::new();
    for id in agents {
        events.emit(EventKind::ToolCall { agent: id.clone() });
        let executor = executor.clone();
        let request = Arc::clone(&request);
        let token = cancel.child_token();
        let id = id.clone();
        tasks.spawn(async move {
            let outcome = executor.execute(&id, request, token).await;
            (id, outcome)
        });
    }

    while !barrier.is_complete() {
        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tasks.abort_all();
                tracing::info!(run_id = %request.run_id, pending = barrier.remaining(), "Retrieval cancelled");
                return Err(PipelineError::Cancelled);
            }
            joined = tasks.join_next() => joined,
        };
        match joined {
            Some(Ok((id, outcome))) => {
                report(events, &request.run_id, &id, &outcome);
                barrier.record(id, outcome)?;
            }
            Some(Err(e)) => {
                tracing::error!(run_id = %request.run_id, error = %e, "Retrieval task terminated abnormally");
            }
            None => break,
        }
    }

    // 任务被异常终止而未上报结果的 Agent 按失败处理，保证证据包与计划一一对应
    for id in barrier.pending() {
        let outcome = AgentOutcome::Failed {
            error: RetrievalError::new(
                id.clone(),
                RetrievalCause::Panicked("task terminated without an outcome".to_string()),
            ),
        };
        report(events, &request.run_id, &id, &outcome);
        barrier.record(id, outcome)?;
    }

    Ok(barrier.into_bundle()?)
}

fn report(events: &mut EventStreamer, run_id: &str, id: &AgentId, outcome: &AgentOutcome) {
    match outcome {
        AgentOutcome::Completed { items } => {
            events.emit(EventKind::EvidenceFound {
                agent: id.clone(),
                items: items.clone(),
            });
        }
        AgentOutcome::Failed { error } => {
            tracing::warn!(run_id = %run_id, agent = %id, error = %error, "Retrieval agent failed, degrading evidence");
            events.emit(EventKind::Error {
                stage: RunState::Retrieving,
                kind: "retrieval".to_string(),
                message: error.to_string(),
                fatal: false,
                agent: Some(id.clone()),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::pipeline::{CaseEntities, Intent, StreamEvent};
    use crate::retrieval::{AgentCatalog, Budget, EvidenceItem, RetrievalAgent};

    struct Delayed {
        id: &'static str,
        delay: Duration,
        items: usize,
    }

    #[async_trait]
    impl RetrievalAgent for Delayed {
        fn id(&self) -> &str {
            self.id
        }

        fn description(&self) -> &str {
            "test agent"
        }

        async fn retrieve(
            &self,
            _request: &RetrievalRequest,
            _budget: &Budget,
        ) -> Result<Vec<EvidenceItem>, RetrievalError> {
            tokio::time::sleep(self.delay).await;
            Ok((0..self.items)
                .map(|i| EvidenceItem::new(AgentId::new(self.id), format!("{}-{i}", self.id), "x", 0.9))
                .collect())
        }
    }

    fn setup() -> AgentExecutor {
        let mut catalog = AgentCatalog::new();
        catalog.register(Delayed { id: "a", delay: Duration::from_millis(50), items: 2 });
        catalog.register(Delayed { id: "b", delay: Duration::from_millis(200), items: 1 });
        catalog.register(Delayed { id: "c", delay: Duration::from_millis(10), items: 0 });
        AgentExecutor::new(catalog, 5, Duration::from_millis(150))
    }

    fn request() -> Arc<RetrievalRequest> {
        Arc::new(RetrievalRequest {
            run_id: "r".into(),
            user_id: "u".into(),
            conversation_id: "c".into(),
            query: "q".into(),
            entities: CaseEntities::default(),
            intent: Intent::fallback(),
            summary: None,
        })
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_waits_for_all_and_marks_timeouts() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut events = EventStreamer::new("r", tx);
        let ids = vec![AgentId::new("a"), AgentId::new("b"), AgentId::new("c")];
        let bundle = fan_out(&setup(), &ids, request(), &CancellationToken::new(), &mut events)
            .await
            .unwrap();

        assert_eq!(bundle.len(), 3);
        assert_eq!(bundle.get(&AgentId::new("a")).unwrap().items().len(), 2);
        assert!(bundle.get(&AgentId::new("b")).unwrap().error().unwrap().is_timeout());
        assert!(bundle.get(&AgentId::new("c")).unwrap().items().is_empty());

        let names: Vec<&str> = drain(&mut rx).iter().map(|e| e.kind.name()).collect();
        assert_eq!(names.iter().filter(|n| **n == "tool_call").count(), 3);
        assert_eq!(names.iter().filter(|n| **n == "evidence_found").count(), 2);
        assert_eq!(names.iter().filter(|n| **n == "error").count(), 1);
        assert!(names[..3].iter().all(|n| *n == "tool_call"));
    }

    #[tokio::test]
    async fn test_empty_plan_joins_immediately() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut events = EventStreamer::new("r", tx);
        let bundle = fan_out(&setup(), &[], request(), &CancellationToken::new(), &mut events)
            .await
            .unwrap();
        assert!(bundle.is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_in_flight_tasks() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut events = EventStreamer::new("r", tx);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let ids = vec![AgentId::new("a"), AgentId::new("b")];
        let err = fan_out(&setup(), &ids, request(), &cancel, &mut events)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }
}
