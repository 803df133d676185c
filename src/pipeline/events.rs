//! 运行过程事件：阶段开始 / 结束、证据、Agent 调用、错误、最终裁决
//!
//! EventStreamer 为每次运行分配严格递增的序号；final 或致命 error 发出后流即关闭，之后的 emit 被拒绝。

use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::RunState;
use crate::pipeline::Verdict;
use crate::retrieval::{AgentId, EvidenceItem};

/// 事件内容（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    StageStarted { stage: RunState },
    StageFinished { stage: RunState },
    /// 派发检索 Agent
    ToolCall { agent: AgentId },
    /// 某个 Agent 返回的证据（可为空列表）
    EvidenceFound { agent: AgentId, items: Vec<EvidenceItem> },
    /// fatal 为 false 时只是标记（如单个 Agent 失败），流继续
    Error {
        stage: RunState,
        kind: String,
        message: String,
        fatal: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent: Option<AgentId>,
    },
    Final { verdict: Verdict },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::StageStarted { .. } => "stage_started",
            EventKind::StageFinished { .. } => "stage_finished",
            EventKind::ToolCall { .. } => "tool_call",
            EventKind::EvidenceFound { .. } => "evidence_found",
            EventKind::Error { .. } => "error",
            EventKind::Final { .. } => "final",
        }
    }

    /// final 与致命 error 为终止事件
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::Final { .. } | EventKind::Error { fatal: true, .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamEvent {
    pub run_id: String,
    pub seq: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// 单次运行的事件发射器（由驱动运行的任务独占，无需加锁）
pub struct EventStreamer {
    run_id: String,
    tx: mpsc::UnboundedSender<StreamEvent>,
    next_seq: u64,
    closed: bool,
}

impl EventStreamer {
    pub fn new(run_id: impl Into<String>, tx: mpsc::UnboundedSender<StreamEvent>) -> Self {
        Self {
            run_id: run_id.into(),
            tx,
            next_seq: 1,
            closed: false,
        }
    }

    /// 追加事件，返回分配的序号；流关闭后返回 None
    pub fn emit(&mut self, kind: EventKind) -> Option<u64> {
        if self.closed {
            tracing::warn!(run_id = %self.run_id, event = kind.name(), "Event emitted after terminal event, dropping");
            return None;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        if kind.is_terminal() {
            self.closed = true;
        }
        tracing::debug!(run_id = %self.run_id, seq, event = kind.name(), "emit");
        let event = StreamEvent {
            run_id: self.run_id.clone(),
            seq,
            kind,
        };
        // 接收端已断开：由断开监听负责取消运行
        let _ = self.tx.send(event);
        Some(seq)
    }

    pub fn stage_started(&mut self, stage: RunState) -> Option<u64> {
        self.emit(EventKind::StageStarted { stage })
    }

    pub fn stage_finished(&mut self, stage: RunState) -> Option<u64> {
        self.emit(EventKind::StageFinished { stage })
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// 已发出的事件数
    pub fn emitted(&self) -> u64 {
        self.next_seq - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_is_strictly_increasing_and_closes_after_terminal() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut s = EventStreamer::new("r1", tx);
        assert_eq!(s.stage_started(RunState::Ingesting), Some(1));
        assert_eq!(
            s.emit(EventKind::Error {
                stage: RunState::Retrieving,
                kind: "retrieval".into(),
                message: "agent down".into(),
                fatal: false,
                agent: Some(AgentId::new("policy")),
            }),
            Some(2)
        );
        assert!(!s.is_closed());
        assert_eq!(
            s.emit(EventKind::Error {
                stage: RunState::Reasoning,
                kind: "reasoning".into(),
                message: "boom".into(),
                fatal: true,
                agent: None,
            }),
            Some(3)
        );
        assert!(s.is_closed());
        assert_eq!(s.stage_finished(RunState::Reasoning), None);
        assert_eq!(s.emitted(), 3);

        let mut seqs = Vec::new();
        while let Ok(e) = rx.try_recv() {
            seqs.push(e.seq);
        }
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_serialized_shape() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut s = EventStreamer::new("r1", tx);
        s.emit(EventKind::ToolCall { agent: AgentId::new("memory") });
        let json = serde_json::to_value(rx.try_recv().unwrap()).unwrap();
        assert_eq!(json["type"], "tool_call");
        assert_eq!(json["agent"], "memory");
        assert_eq!(json["seq"], 1);
        assert_eq!(json["run_id"], "r1");
    }

    #[test]
    fn test_send_after_receiver_dropped_does_not_panic() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut s = EventStreamer::new("r1", tx);
        assert_eq!(s.stage_started(RunState::Ingesting), Some(1));
    }
}
