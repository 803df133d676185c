//! 长期记忆：分层（episodic / semantic / procedural）、按作用域（user / application）读写
//!
//! MemoryStore 为外部服务的窄接口；InMemoryMemoryStore 按关键词重叠检索（无真实向量，适合本地运行与测试），
//! 后续可接 Mem0 / 向量库等真实后端。

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// 记忆作用域
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum MemoryScope {
    User(String),
    Application,
}

/// 记忆层级
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    /// 行为历史（发生过什么）
    Episodic,
    /// 通用运营事实
    Semantic,
    /// 行之有效的处理方式
    Procedural,
}

impl MemoryTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTier::Episodic => "episodic",
            MemoryTier::Semantic => "semantic",
            MemoryTier::Procedural => "procedural",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub scope: MemoryScope,
    pub tier: MemoryTier,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl MemoryRecord {
    pub fn new(scope: MemoryScope, tier: MemoryTier, content: impl Into<String>) -> Self {
        Self {
            scope,
            tier,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// 长期记忆 trait：写入与按查询检索（多运行并发访问安全）
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// 按查询检索最相关的 k 条，空查询返回最新的 k 条
    async fn read(
        &self,
        scope: &MemoryScope,
        tier: MemoryTier,
        query: &str,
        k: usize,
    ) -> Result<Vec<MemoryRecord>, String>;

    async fn write(&self, record: MemoryRecord) -> Result<(), String>;
}

/// 空实现：未启用长期记忆时使用
#[derive(Clone, Default)]
pub struct NoopMemoryStore;

#[async_trait]
impl MemoryStore for NoopMemoryStore {
    async fn read(
        &self,
        _scope: &MemoryScope,
        _tier: MemoryTier,
        _query: &str,
        _k: usize,
    ) -> Result<Vec<MemoryRecord>, String> {
        Ok(Vec::new())
    }

    async fn write(&self, _record: MemoryRecord) -> Result<(), String> {
        Ok(())
    }
}

/// 将文本切分为小写词集合，用于简单相似度（词重叠数）
pub(crate) fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() > 1)
        .collect()
}

/// 简单内存实现：每个 (scope, tier) 一个桶，超过 max_entries 丢弃最旧
pub struct InMemoryMemoryStore {
    buckets: RwLock<HashMap<(MemoryScope, MemoryTier), Vec<(MemoryRecord, HashSet<String>)>>>,
    max_entries: usize,
}

impl InMemoryMemoryStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// 某作用域 + 层级下的记录数
    pub async fn len(&self, scope: &MemoryScope, tier: MemoryTier) -> usize {
        self.buckets
            .read()
            .await
            .get(&(scope.clone(), tier))
            .map(|b| b.len())
            .unwrap_or(0)
    }
}

impl Default for InMemoryMemoryStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn read(
        &self,
        scope: &MemoryScope,
        tier: MemoryTier,
        query: &str,
        k: usize,
    ) -> Result<Vec<MemoryRecord>, String> {
        let buckets = self.buckets.read().await;
        let Some(bucket) = buckets.get(&(scope.clone(), tier)) else {
            return Ok(Vec::new());
        };

        let query_tokens = tokenize_lower(query);
        if query_tokens.is_empty() {
            return Ok(bucket.iter().rev().take(k).map(|(r, _)| r.clone()).collect());
        }

        let mut scored: Vec<(usize, &MemoryRecord)> = bucket
            .iter()
            .map(|(record, tokens)| (query_tokens.intersection(tokens).count(), record))
            .filter(|(s, _)| *s > 0)
            .collect();
        // 同分时新的在前
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.timestamp.cmp(&a.1.timestamp)));
        Ok(scored.into_iter().take(k).map(|(_, r)| r.clone()).collect())
    }

    async fn write(&self, record: MemoryRecord) -> Result<(), String> {
        let content = record.content.trim();
        if content.is_empty() {
            return Err("memory content is empty".to_string());
        }
        let tokens = tokenize_lower(content);
        let mut buckets = self.buckets.write().await;
        let bucket = buckets
            .entry((record.scope.clone(), record.tier))
            .or_default();
        bucket.push((record, tokens));
        let n = bucket.len();
        if n > self.max_entries {
            bucket.drain(0..n - self.max_entries);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> MemoryScope {
        MemoryScope::User(id.to_string())
    }

    #[tokio::test]
    async fn test_scopes_and_tiers_are_isolated() {
        let store = InMemoryMemoryStore::new(10);
        store
            .write(MemoryRecord::new(user("a"), MemoryTier::Episodic, "refund for late order"))
            .await
            .unwrap();
        store
            .write(MemoryRecord::new(MemoryScope::Application, MemoryTier::Semantic, "late orders get vouchers"))
            .await
            .unwrap();

        let hits = store.read(&user("a"), MemoryTier::Episodic, "late order", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(store.read(&user("b"), MemoryTier::Episodic, "late order", 5).await.unwrap().is_empty());
        assert!(store.read(&user("a"), MemoryTier::Semantic, "late order", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ranked_by_overlap() {
        let store = InMemoryMemoryStore::new(10);
        for text in ["cold pizza complaint", "late delivery refund issued", "late delivery"] {
            store.write(MemoryRecord::new(user("a"), MemoryTier::Episodic, text)).await.unwrap();
        }
        let hits = store
            .read(&user("a"), MemoryTier::Episodic, "refund for late delivery", 2)
            .await
            .unwrap();
        assert_eq!(hits[0].content, "late delivery refund issued");
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_capacity_and_empty_content() {
        let store = InMemoryMemoryStore::new(2);
        for i in 0..3 {
            store
                .write(MemoryRecord::new(user("a"), MemoryTier::Procedural, format!("step {i}")))
                .await
                .unwrap();
        }
        assert_eq!(store.len(&user("a"), MemoryTier::Procedural).await, 2);
        assert!(store
            .write(MemoryRecord::new(user("a"), MemoryTier::Procedural, "  "))
            .await
            .is_err());
    }
}
