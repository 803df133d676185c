//! 上下文存储适配器：按会话加载 / 追加消息、替换运行摘要
//!
//! 由外部服务保证单条记录读写的事务性，编排引擎不自行加锁；InMemoryContextStore 供本地运行与测试。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::memory::{Message, Role};

/// 加载结果：最近消息 + 运行摘要
#[derive(Clone, Debug, Default)]
pub struct ContextSeed {
    /// 最近的消息（最新在末尾，最多 limit 条）
    pub messages: Vec<Message>,
    pub summary: Option<String>,
    /// 距上次摘要以来新增的消息数（用于摘要触发）
    pub messages_since_summary: usize,
    /// 会话中已有的用户消息数
    pub user_turns: usize,
}

#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn load(&self, conversation_id: &str, limit: usize) -> Result<ContextSeed, String>;

    async fn append(&self, conversation_id: &str, message: Message) -> Result<(), String>;

    async fn replace_summary(&self, conversation_id: &str, summary: String) -> Result<(), String>;
}

#[derive(Default)]
struct Conversation {
    messages: Vec<Message>,
    summary: Option<String>,
    since_summary: usize,
}

/// 内存实现（进程内，多运行并发安全）
#[derive(Default)]
pub struct InMemoryContextStore {
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 会话中全部消息数（诊断 / 测试用）
    pub async fn message_count(&self, conversation_id: &str) -> usize {
        self.conversations
            .read()
            .await
            .get(conversation_id)
            .map(|c| c.messages.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn load(&self, conversation_id: &str, limit: usize) -> Result<ContextSeed, String> {
        let conversations = self.conversations.read().await;
        let Some(conv) = conversations.get(conversation_id) else {
            return Ok(ContextSeed::default());
        };
        let start = conv.messages.len().saturating_sub(limit);
        Ok(ContextSeed {
            messages: conv.messages[start..].to_vec(),
            summary: conv.summary.clone(),
            messages_since_summary: conv.since_summary,
            user_turns: conv.messages.iter().filter(|m| m.role == Role::User).count(),
        })
    }

    async fn append(&self, conversation_id: &str, message: Message) -> Result<(), String> {
        let mut conversations = self.conversations.write().await;
        let conv = conversations.entry(conversation_id.to_string()).or_default();
        conv.messages.push(message);
        conv.since_summary += 1;
        Ok(())
    }

    async fn replace_summary(&self, conversation_id: &str, summary: String) -> Result<(), String> {
        let mut conversations = self.conversations.write().await;
        let conv = conversations.entry(conversation_id.to_string()).or_default();
        conv.summary = Some(summary);
        conv.since_summary = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_unknown_conversation_is_empty() {
        let store = InMemoryContextStore::new();
        let seed = store.load("nope", 10).await.unwrap();
        assert!(seed.messages.is_empty());
        assert!(seed.summary.is_none());
    }

    #[tokio::test]
    async fn test_append_and_summary_reset() {
        let store = InMemoryContextStore::new();
        for i in 0..4 {
            store.append("c1", Message::user(format!("m{i}"))).await.unwrap();
        }
        let seed = store.load("c1", 2).await.unwrap();
        assert_eq!(seed.messages.len(), 2);
        assert_eq!(seed.messages[1].content, "m3");
        assert_eq!(seed.messages_since_summary, 4);
        assert_eq!(seed.user_turns, 4);

        store.replace_summary("c1", "talked about m0..m3".into()).await.unwrap();
        let seed = store.load("c1", 10).await.unwrap();
        assert_eq!(seed.summary.as_deref(), Some("talked about m0..m3"));
        assert_eq!(seed.messages_since_summary, 0);
        assert_eq!(store.message_count("c1").await, 4);
    }
}
