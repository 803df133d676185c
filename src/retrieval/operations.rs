//! 运营数据 Agent：按订单 / 区域 / 餐厅实体查询运营记录

use std::collections::HashMap;

use async_trait::async_trait;

use crate::config::RecordEntry;
use crate::core::RetrievalError;
use crate::retrieval::{AgentId, Budget, EvidenceItem, RetrievalAgent, RetrievalRequest, OPERATIONS};

/// 运营记录的实体类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Order,
    Zone,
    Restaurant,
}

impl RecordKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "order" => Some(RecordKind::Order),
            "zone" => Some(RecordKind::Zone),
            "restaurant" => Some(RecordKind::Restaurant),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Order => "order",
            RecordKind::Zone => "zone",
            RecordKind::Restaurant => "restaurant",
        }
    }
}

/// 内存中的运营记录表（只读，构造后不再修改）
#[derive(Default)]
pub struct OperationsAgent {
    records: HashMap<(RecordKind, String), String>,
}

impl OperationsAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(mut self, kind: RecordKind, id: impl Into<String>, summary: impl Into<String>) -> Self {
        self.records
            .insert((kind, id.into().to_lowercase()), summary.into());
        self
    }

    /// 从 [[retrieval.records]] 构建；未知 kind 跳过并告警
    pub fn from_entries(entries: &[RecordEntry]) -> Self {
        entries.iter().fold(Self::new(), |agent, e| match RecordKind::parse(&e.kind) {
            Some(kind) => agent.with_record(kind, e.id.clone(), e.summary.clone()),
            None => {
                tracing::warn!(kind = %e.kind, id = %e.id, "Unknown operations record kind, skipping");
                agent
            }
        })
    }

    fn lookup(&self, kind: RecordKind, id: &Option<String>) -> Option<EvidenceItem> {
        let id = id.as_ref()?;
        self.records.get(&(kind, id.to_lowercase())).map(|summary| {
            EvidenceItem::new(
                AgentId::new(OPERATIONS),
                format!("{}:{}", kind.as_str(), id),
                summary.clone(),
                // 订单是最直接的证据
                if kind == RecordKind::Order { 0.95 } else { 0.8 },
            )
        })
    }
}

#[async_trait]
impl RetrievalAgent for OperationsAgent {
    fn id(&self) -> &str {
        OPERATIONS
    }

    fn description(&self) -> &str {
        "Operational records (orders, zones, restaurants) looked up by case entity"
    }

    async fn retrieve(
        &self,
        request: &RetrievalRequest,
        budget: &Budget,
    ) -> Result<Vec<EvidenceItem>, RetrievalError> {
        let e = &request.entities;
        let items: Vec<EvidenceItem> = [
            self.lookup(RecordKind::Order, &e.order_id),
            self.lookup(RecordKind::Zone, &e.zone_id),
            self.lookup(RecordKind::Restaurant, &e.restaurant_id),
        ]
        .into_iter()
        .flatten()
        .take(budget.max_items)
        .collect();
        Ok(items)
    }
}
