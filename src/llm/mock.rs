//! 脚本化 LLM 客户端（用于测试与本地演示，无需 API）
//!
//! 按顺序返回预设回复；脚本耗尽后重复返回 fallback。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::LlmClient;
use crate::memory::Message;

pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<Result<String, String>>>,
    fallback: Result<String, String>,
}

impl ScriptedLlmClient {
    pub fn new(replies: Vec<Result<String, String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: Err("script exhausted".to_string()),
        }
    }

    /// 脚本耗尽后的默认回复
    pub fn with_fallback(mut self, fallback: Result<String, String>) -> Self {
        self.fallback = fallback;
        self
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String, String> {
        let next = self
            .replies
            .lock()
            .map_err(|_| "scripted client poisoned".to_string())?
            .pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}
