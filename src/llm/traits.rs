//! LLM 客户端抽象
//!
//! 编排引擎不关心提示词构造与模型选择，只通过 LlmClient::complete 拿到一段文本回复。

use async_trait::async_trait;

use crate::memory::Message;

/// LLM 客户端 trait：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;

    /// 模型名（用于日志）
    fn model_name(&self) -> &str {
        "unknown"
    }
}
