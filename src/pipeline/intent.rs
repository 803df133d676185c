//! 意图分类：问题类型、严重程度、SLA 风险、安全标记
//!
//! 分类器可插拔：KeywordClassifier（默认，确定性）与 LlmIntentClassifier（解析模型 JSON，异常输出回退为 Other/Low）。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::PipelineError;
use crate::llm::{extract_json_block, LlmClient};
use crate::memory::Message;
use crate::pipeline::CaseFile;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Refund,
    DeliveryDelay,
    Quality,
    Safety,
    Account,
    Other,
}

impl IssueKind {
    pub const ALL: [IssueKind; 6] = [
        IssueKind::Refund,
        IssueKind::DeliveryDelay,
        IssueKind::Quality,
        IssueKind::Safety,
        IssueKind::Account,
        IssueKind::Other,
    ];

    /// 配置 [routing] 段中使用的键名
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::Refund => "refund",
            IssueKind::DeliveryDelay => "delivery_delay",
            IssueKind::Quality => "quality",
            IssueKind::Safety => "safety",
            IssueKind::Account => "account",
            IssueKind::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s.trim().to_lowercase())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
}

/// 分类结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub issue: IssueKind,
    pub severity: Severity,
    pub sla_risk: bool,
    #[serde(default)]
    pub safety_flags: Vec<String>,
}

impl Intent {
    pub fn fallback() -> Self {
        Self {
            issue: IssueKind::Other,
            severity: Severity::Low,
            sla_risk: false,
            safety_flags: Vec::new(),
        }
    }
}

/// 意图分类器
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, case: &CaseFile) -> Result<Intent, PipelineError>;
}

/// 关键词分类器：按词表判定问题类型，安全类关键词同时写入 safety_flags
#[derive(Debug, Default, Clone)]
pub struct KeywordClassifier;

const SAFETY_TERMS: &[&str] = &[
    "allergic", "allergy", "food poisoning", "sick", "hospital", "unsafe", "harass", "threat",
    "accident", "injured",
];
const REFUND_TERMS: &[&str] = &["refund", "money back", "charged", "chargeback", "reimburse"];
const DELAY_TERMS: &[&str] = &["late", "delay", "delayed", "still waiting", "where is my", "hasn't arrived", "not arrived"];
const QUALITY_TERMS: &[&str] = &["cold", "wrong item", "missing item", "spilled", "stale", "bad quality", "damaged"];
const ACCOUNT_TERMS: &[&str] = &["account", "password", "login", "log in", "email address", "profile"];
const URGENT_TERMS: &[&str] = &["urgent", "immediately", "asap", "furious", "unacceptable"];

fn hits(text: &str, terms: &[&str]) -> Vec<String> {
    terms
        .iter()
        .filter(|t| text.contains(*t))
        .map(|t| t.to_string())
        .collect()
}

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify_text(&self, text: &str) -> Intent {
        let text = text.to_lowercase();
        let safety_flags = hits(&text, SAFETY_TERMS);

        let issue = if !safety_flags.is_empty() {
            IssueKind::Safety
        } else if !hits(&text, REFUND_TERMS).is_empty() {
            IssueKind::Refund
        } else if !hits(&text, DELAY_TERMS).is_empty() {
            IssueKind::DeliveryDelay
        } else if !hits(&text, QUALITY_TERMS).is_empty() {
            IssueKind::Quality
        } else if !hits(&text, ACCOUNT_TERMS).is_empty() {
            IssueKind::Account
        } else {
            IssueKind::Other
        };

        let urgent = !hits(&text, URGENT_TERMS).is_empty();
        let severity = match (issue, urgent) {
            (IssueKind::Safety, _) => Severity::High,
            (_, true) => Severity::High,
            (IssueKind::Refund | IssueKind::DeliveryDelay | IssueKind::Quality, false) => Severity::Medium,
            _ => Severity::Low,
        };
        let sla_risk = issue == IssueKind::DeliveryDelay && severity >= Severity::Medium;

        Intent {
            issue,
            severity,
            sla_risk,
            safety_flags,
        }
    }
}

#[async_trait]
impl IntentClassifier for KeywordClassifier {
    async fn classify(&self, case: &CaseFile) -> Result<Intent, PipelineError> {
        Ok(self.classify_text(&case.normalized))
    }
}

const CLASSIFY_PROMPT: &str = "You are an intent classification system for food delivery support. \
Respond ONLY with valid JSON: {\"issue\": \"refund|delivery_delay|quality|safety|account|other\", \
\"severity\": \"low|medium|high\", \"sla_risk\": bool, \"safety_flags\": [string]}";

/// 基于 LLM 的分类器：模型失败或输出无法解析时回退到默认分类，不产生错误
pub struct LlmIntentClassifier {
    llm: Arc<dyn LlmClient>,
}

impl LlmIntentClassifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl IntentClassifier for LlmIntentClassifier {
    async fn classify(&self, case: &CaseFile) -> Result<Intent, PipelineError> {
        let messages = vec![
            Message::system(CLASSIFY_PROMPT),
            Message::user(format!("Query: {}", case.normalized)),
        ];
        let reply = match self.llm.complete(&messages).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, "Intent model call failed, using fallback intent");
                return Ok(Intent::fallback());
            }
        };
        let parsed = extract_json_block(&reply).and_then(|json| serde_json::from_str::<Intent>(json).ok());
        Ok(parsed.unwrap_or_else(|| {
            tracing::warn!("Intent model returned unparsable output, using fallback intent");
            Intent::fallback()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use crate::pipeline::{ingest, Persona};

    #[test]
    fn test_keyword_classification() {
        let c = KeywordClassifier::new();
        assert_eq!(c.classify_text("I want a refund for order 12").issue, IssueKind::Refund);
        assert_eq!(c.classify_text("my food is late").issue, IssueKind::DeliveryDelay);
        assert_eq!(c.classify_text("the pizza was cold").issue, IssueKind::Quality);
        assert_eq!(c.classify_text("reset my password").issue, IssueKind::Account);
        assert_eq!(c.classify_text("hello there").issue, IssueKind::Other);
    }

    #[test]
    fn test_safety_terms_raise_flags_and_severity() {
        let intent = KeywordClassifier::new().classify_text("I got food poisoning, want a refund");
        assert_eq!(intent.issue, IssueKind::Safety);
        assert_eq!(intent.severity, Severity::High);
        assert_eq!(intent.safety_flags, vec!["food poisoning".to_string()]);
    }

    #[test]
    fn test_delay_carries_sla_risk() {
        let intent = KeywordClassifier::new().classify_text("order 5 is delayed");
        assert!(intent.sla_risk);
    }

    #[test]
    fn test_issue_kind_parse() {
        assert_eq!(IssueKind::parse("Delivery_Delay"), Some(IssueKind::DeliveryDelay));
        assert_eq!(IssueKind::parse("unknown"), None);
    }

    #[tokio::test]
    async fn test_llm_classifier_parses_json() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![Ok(
            "```json\n{\"issue\": \"quality\", \"severity\": \"medium\", \"sla_risk\": false}\n```".to_string(),
        )]));
        let case = ingest("the burger was raw", "u1", Persona::Customer).unwrap();
        let intent = LlmIntentClassifier::new(llm).classify(&case).await.unwrap();
        assert_eq!(intent.issue, IssueKind::Quality);
        assert!(intent.safety_flags.is_empty());
    }

    #[tokio::test]
    async fn test_llm_classifier_falls_back_on_garbage() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![Ok("not json at all".to_string())]));
        let case = ingest("hi", "u1", Persona::Customer).unwrap();
        let intent = LlmIntentClassifier::new(llm).classify(&case).await.unwrap();
        assert_eq!(intent, Intent::fallback());
    }
}
