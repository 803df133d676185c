//! 裁决与升级：Verdict、升级包、升级通道
//!
//! ESCALATE 时不给出回答，而是构造升级包（原因、置信度、上下文快照）交给人工队列。

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::pipeline::{Candidate, IssueKind, RunContext, ViolationKind};

/// 裁决类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictKind {
    AutoRespond,
    Escalate,
}

/// 同步路径的最终产物
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    AutoRespond { candidate: Candidate },
    Escalate { packet: EscalationPacket },
}

impl Verdict {
    pub fn kind(&self) -> VerdictKind {
        match self {
            Verdict::AutoRespond { .. } => VerdictKind::AutoRespond,
            Verdict::Escalate { .. } => VerdictKind::Escalate,
        }
    }

    pub fn candidate(&self) -> Option<&Candidate> {
        match self {
            Verdict::AutoRespond { candidate } => Some(candidate),
            Verdict::Escalate { .. } => None,
        }
    }

    pub fn packet(&self) -> Option<&EscalationPacket> {
        match self {
            Verdict::AutoRespond { .. } => None,
            Verdict::Escalate { packet } => Some(packet),
        }
    }

    /// 写回会话的回复文本
    pub fn reply_text(&self) -> String {
        match self {
            Verdict::AutoRespond { candidate } => candidate.answer.clone(),
            Verdict::Escalate { packet } => match &packet.ticket {
                Some(ticket) => format!(
                    "Your request has been passed to a support specialist (ticket {ticket}). We will get back to you shortly."
                ),
                None => "Your request has been passed to a support specialist. We will get back to you shortly."
                    .to_string(),
            },
        }
    }
}

/// 升级原因
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EscalationReason {
    RuleViolation { violations: Vec<ViolationKind> },
    LowConfidence { confidence: f32, threshold: f32 },
    /// 闸门自身故障
    GateFailure { message: String },
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EscalationReason::RuleViolation { violations } => {
                let names: Vec<&str> = violations.iter().map(|v| v.as_str()).collect();
                write!(f, "rule violation: {}", names.join(", "))
            }
            EscalationReason::LowConfidence { confidence, threshold } => {
                write!(f, "low confidence {confidence:.2} < {threshold:.2}")
            }
            EscalationReason::GateFailure { message } => write!(f, "safety gate failure: {message}"),
        }
    }
}

/// 交给人工的上下文快照
#[derive(Clone, Debug, Serialize)]
pub struct ContextSnapshot {
    pub run_id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub turn: u64,
    pub query: String,
    pub issue: Option<IssueKind>,
    pub summary: Option<String>,
    pub recent_messages: Vec<String>,
    pub trace: Vec<String>,
    pub failures: Vec<String>,
}

impl ContextSnapshot {
    pub fn capture(ctx: &RunContext) -> Self {
        Self {
            run_id: ctx.ids.run_id.clone(),
            user_id: ctx.ids.user_id.clone(),
            conversation_id: ctx.ids.conversation_id.clone(),
            turn: ctx.ids.turn,
            query: ctx.query().to_string(),
            issue: ctx.intent.as_ref().map(|i| i.issue),
            summary: ctx.summary.clone(),
            recent_messages: ctx
                .window
                .messages()
                .iter()
                .map(|m| format!("{}: {}", m.role.as_str(), m.content))
                .collect(),
            trace: ctx
                .scratchpad
                .trace
                .iter()
                .map(|n| format!("[{}] {}", n.stage, n.note))
                .collect(),
            failures: ctx.scratchpad.failures.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct EscalationPacket {
    pub reason: EscalationReason,
    pub confidence: Option<f32>,
    /// 1 为最高
    pub severity: u8,
    pub snapshot: ContextSnapshot,
    /// 未采用的候选回答（供人工参考）
    pub candidate: Option<String>,
    /// 升级通道返回的工单号；提交失败时为 None
    pub ticket: Option<String>,
}

impl EscalationPacket {
    pub fn new(reason: EscalationReason, candidate: Option<&Candidate>, ctx: &RunContext) -> Self {
        let sla_risk = ctx.intent.as_ref().map_or(false, |i| i.sla_risk);
        let critical = matches!(reason, EscalationReason::GateFailure { .. })
            || matches!(&reason, EscalationReason::RuleViolation { violations }
                if violations.iter().any(|v| matches!(v, ViolationKind::SafetyFlag | ViolationKind::CriticalEvidenceFailure)));
        Self {
            confidence: candidate.map(|c| c.confidence),
            severity: if sla_risk || critical { 1 } else { 2 },
            snapshot: ContextSnapshot::capture(ctx),
            candidate: candidate.map(|c| c.answer.clone()),
            ticket: None,
            reason,
        }
    }
}

/// 升级通道：提交升级包，返回工单号
#[async_trait]
pub trait EscalationSink: Send + Sync {
    async fn submit(&self, packet: &EscalationPacket) -> Result<String, String>;
}

/// 内存升级队列（本地运行与测试）
#[derive(Default)]
pub struct InMemoryEscalationSink {
    next: AtomicU64,
    submitted: Mutex<Vec<EscalationPacket>>,
}

impl InMemoryEscalationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn submitted(&self) -> Vec<EscalationPacket> {
        self.submitted.lock().await.clone()
    }
}

#[async_trait]
impl EscalationSink for InMemoryEscalationSink {
    async fn submit(&self, packet: &EscalationPacket) -> Result<String, String> {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let ticket = format!("ESC-{n:05}");
        let mut stored = packet.clone();
        stored.ticket = Some(ticket.clone());
        self.submitted.lock().await.push(stored);
        Ok(ticket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ingest, Intent, Persona, RunIds};
    use crate::retrieval::EvidenceBundle;

    fn ctx(sla_risk: bool) -> RunContext {
        let mut ctx = RunContext::new(
            RunIds {
                run_id: "r".into(),
                user_id: "u".into(),
                conversation_id: "c".into(),
                turn: 2,
            },
            Persona::Customer,
            10,
        );
        ctx.case = Some(ingest("where is order 9", "u", Persona::Customer).unwrap());
        ctx.intent = Some(Intent {
            sla_risk,
            ..Intent::fallback()
        });
        ctx
    }

    #[test]
    fn test_severity() {
        let cand = Candidate::new("maybe", 0.4, EvidenceBundle::empty());
        let low = EscalationPacket::new(
            EscalationReason::LowConfidence { confidence: 0.4, threshold: 0.7 },
            Some(&cand),
            &ctx(false),
        );
        assert_eq!(low.severity, 2);
        assert_eq!(low.confidence, Some(0.4));
        assert_eq!(low.snapshot.query, "where is order 9");

        let sla = EscalationPacket::new(
            EscalationReason::LowConfidence { confidence: 0.4, threshold: 0.7 },
            Some(&cand),
            &ctx(true),
        );
        assert_eq!(sla.severity, 1);

        let gate = EscalationPacket::new(
            EscalationReason::GateFailure { message: "ruleset down".into() },
            None,
            &ctx(false),
        );
        assert_eq!(gate.severity, 1);
        assert!(gate.candidate.is_none());
    }

    #[tokio::test]
    async fn test_in_memory_sink_assigns_tickets() {
        let sink = InMemoryEscalationSink::new();
        let packet = EscalationPacket::new(
            EscalationReason::RuleViolation { violations: vec![ViolationKind::Pii] },
            None,
            &ctx(false),
        );
        assert_eq!(sink.submit(&packet).await.unwrap(), "ESC-00001");
        assert_eq!(sink.submit(&packet).await.unwrap(), "ESC-00002");
        let stored = sink.submitted().await;
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].ticket.as_deref(), Some("ESC-00001"));
    }
}
