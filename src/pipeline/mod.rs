//! 运行流水线各阶段：摄取、意图分类、规划、推理、安全闸门、升级、事件流

pub mod context;
pub mod escalation;
pub mod events;
pub mod ingestion;
pub mod intent;
pub mod planner;
pub mod reasoning;
pub mod safety;

pub use context::{RunContext, RunIds};
pub use escalation::{
    ContextSnapshot, EscalationPacket, EscalationReason, EscalationSink, InMemoryEscalationSink, Verdict, VerdictKind,
};
pub use events::{EventKind, EventStreamer, StreamEvent};
pub use ingestion::{ingest, normalize, CaseEntities, CaseFile, Persona};
pub use intent::{Intent, IntentClassifier, IssueKind, KeywordClassifier, LlmIntentClassifier, Severity};
pub use planner::{Plan, Planner};
pub use reasoning::{Candidate, EvidenceReasoner, LlmReasoner, Reasoner, NO_EVIDENCE_CONFIDENCE};
pub use safety::{
    GateDecision, GatePolicy, PatternRuleset, RuleContext, RuleReport, Ruleset, SafetyGate, TextRole, ViolationKind,
};
