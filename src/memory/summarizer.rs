//! 对话摘要：工作窗口超出后由后台任务生成运行摘要并替换
//!
//! ExtractiveSummarizer（默认，确定性）与 LlmSummarizer（调用模型，失败即报错，由后台任务记录）。

use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::LlmClient;
use crate::memory::{Message, Role};

/// 摘要最大字符数
const MAX_SUMMARY_CHARS: usize = 1200;
/// 抽取式摘要中每条消息保留的字符数
const LINE_CHARS: usize = 160;

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// previous 为已有摘要；messages 为需要并入摘要的新消息
    async fn summarize(&self, previous: Option<&str>, messages: &[Message]) -> Result<String, String>;
}

/// 抽取式摘要：保留旧摘要，逐条追加用户诉求与回复要点，超长时从头部截断
#[derive(Debug, Default, Clone)]
pub struct ExtractiveSummarizer;

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, previous: Option<&str>, messages: &[Message]) -> Result<String, String> {
        let mut lines: Vec<String> = previous
            .filter(|p| !p.trim().is_empty())
            .map(|p| vec![p.trim().to_string()])
            .unwrap_or_default();
        for m in messages.iter().filter(|m| m.role != Role::System) {
            let label = match m.role {
                Role::User => "User asked",
                _ => "Agent replied",
            };
            let text: String = m.content.chars().take(LINE_CHARS).collect();
            lines.push(format!("{label}: {text}"));
        }
        let summary = lines.join("\n");
        let count = summary.chars().count();
        if count > MAX_SUMMARY_CHARS {
            Ok(summary.chars().skip(count - MAX_SUMMARY_CHARS).collect())
        } else {
            Ok(summary)
        }
    }
}

/// 基于 LLM 的摘要
pub struct LlmSummarizer {
    llm: Arc<dyn LlmClient>,
}

impl LlmSummarizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, previous: Option<&str>, messages: &[Message]) -> Result<String, String> {
        let conversation = messages
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Previous summary:\n{}\n\nSummarize the following conversation concisely, focusing on key topics, decisions, and important information:\n\n{}\n\nSummary:",
            previous.unwrap_or("(none)"),
            conversation
        );
        let summary = self.llm.complete(&[Message::user(prompt)]).await?;
        let summary = summary.trim();
        if summary.is_empty() {
            return Err("model returned an empty summary".to_string());
        }
        Ok(summary.to_string())
    }
}
