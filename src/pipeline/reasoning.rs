//! 推理阶段：synthesize(EvidenceBundle, context) -> Candidate
//!
//! 证据为空也必须给出置信度（低置信度而非错误）。
//! EvidenceReasoner 为默认的确定性实现；LlmReasoner 通过 LlmClient 生成回答。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::PipelineError;
use crate::llm::{extract_json_block, LlmClient};
use crate::memory::Message;
use crate::pipeline::RunContext;
use crate::retrieval::{EvidenceBundle, EvidenceItem};

/// 无证据时的固定置信度
pub const NO_EVIDENCE_CONFIDENCE: f32 = 0.2;
/// 参与合成回答的证据条数
const TOP_ITEMS: usize = 3;

/// 候选回答
#[derive(Clone, Debug, Serialize)]
pub struct Candidate {
    pub answer: String,
    /// [0,1]
    pub confidence: f32,
    pub evidence: EvidenceBundle,
}

impl Candidate {
    pub fn new(answer: impl Into<String>, confidence: f32, evidence: EvidenceBundle) -> Self {
        let confidence = if confidence.is_nan() { 0.0 } else { confidence.clamp(0.0, 1.0) };
        Self {
            answer: answer.into(),
            confidence,
            evidence,
        }
    }
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn synthesize(&self, evidence: EvidenceBundle, ctx: &RunContext) -> Result<Candidate, PipelineError>;
}

fn top_items(evidence: &EvidenceBundle) -> Vec<&EvidenceItem> {
    let mut items: Vec<&EvidenceItem> = evidence.items().collect();
    items.sort_by(|a, b| b.score.total_cmp(&a.score));
    items.truncate(TOP_ITEMS);
    items
}

/// 确定性推理：取得分最高的证据拼成回答；置信度 = 基线 + 证据得分 + Agent 覆盖率
#[derive(Debug, Default, Clone)]
pub struct EvidenceReasoner;

impl EvidenceReasoner {
    pub fn new() -> Self {
        Self
    }

    fn confidence(evidence: &EvidenceBundle, top: &[&EvidenceItem]) -> f32 {
        if top.is_empty() {
            return NO_EVIDENCE_CONFIDENCE;
        }
        let mean_score = top.iter().map(|i| i.score).sum::<f32>() / top.len() as f32;
        let coverage = evidence.succeeded_agents() as f32 / evidence.len().max(1) as f32;
        0.35 + 0.4 * mean_score + 0.25 * coverage
    }
}

#[async_trait]
impl Reasoner for EvidenceReasoner {
    async fn synthesize(&self, evidence: EvidenceBundle, ctx: &RunContext) -> Result<Candidate, PipelineError> {
        let top = top_items(&evidence);
        let confidence = Self::confidence(&evidence, &top);

        let answer = if top.is_empty() {
            match ctx.summary.as_deref() {
                Some(summary) if !summary.trim().is_empty() => format!(
                    "I could not find records for this request. Based on our conversation so far ({}), a support specialist can follow up.",
                    summary.lines().last().unwrap_or(summary).trim()
                ),
                _ => "Thanks for reaching out. I could not find specific records for this request yet; could you share your order number?"
                    .to_string(),
            }
        } else {
            let lines: Vec<String> = top
                .iter()
                .map(|i| format!("- {} (source: {})", i.excerpt, i.source))
                .collect();
            format!("Here is what I found about your request:\n{}", lines.join("\n"))
        };

        Ok(Candidate::new(answer, confidence, evidence))
    }
}

const REASONING_PROMPT: &str = "You are a food delivery support assistant. Answer the customer using ONLY the evidence provided. \
Respond ONLY with valid JSON: {\"answer\": string, \"confidence\": number between 0 and 1}";

#[derive(Deserialize)]
struct ModelAnswer {
    answer: String,
    confidence: f32,
}

/// 基于 LLM 的推理：输出无法解析时返回 ReasoningError
pub struct LlmReasoner {
    llm: Arc<dyn LlmClient>,
}

impl LlmReasoner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn build_messages(evidence: &EvidenceBundle, ctx: &RunContext) -> Vec<Message> {
        let mut prompt = String::new();
        if let Some(summary) = &ctx.summary {
            prompt.push_str(&format!("## Conversation summary\n{summary}\n\n"));
        }
        if !ctx.window.is_empty() {
            prompt.push_str(&format!("## Recent messages\n{}\n\n", ctx.window.transcript()));
        }
        prompt.push_str("## Evidence\n");
        for (agent, outcome) in evidence.iter() {
            match outcome.error() {
                Some(e) => prompt.push_str(&format!("- [{agent}] unavailable: {}\n", e.cause)),
                None if outcome.items().is_empty() => prompt.push_str(&format!("- [{agent}] no results\n")),
                None => {
                    for item in outcome.items() {
                        prompt.push_str(&format!("- [{agent}] {} ({:.2}): {}\n", item.source, item.score, item.excerpt));
                    }
                }
            }
        }
        prompt.push('\n');
        prompt.push_str(&ctx.scratchpad.to_prompt_section());
        prompt.push_str(&format!("## Question\n{}", ctx.query()));
        vec![Message::system(REASONING_PROMPT), Message::user(prompt)]
    }
}

#[async_trait]
impl Reasoner for LlmReasoner {
    async fn synthesize(&self, evidence: EvidenceBundle, ctx: &RunContext) -> Result<Candidate, PipelineError> {
        let messages = Self::build_messages(&evidence, ctx);
        let reply = self
            .llm
            .complete(&messages)
            .await
            .map_err(PipelineError::Reasoning)?;
        let parsed: ModelAnswer = extract_json_block(&reply)
            .and_then(|json| serde_json::from_str(json).ok())
            .ok_or_else(|| PipelineError::Reasoning("model returned unparsable answer".to_string()))?;
        if parsed.answer.trim().is_empty() {
            return Err(PipelineError::Reasoning("model returned an empty answer".to_string()));
        }
        Ok(Candidate::new(parsed.answer.trim(), parsed.confidence, evidence))
    }
}
