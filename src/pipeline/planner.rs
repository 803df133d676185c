//! Planner / Router：根据意图与上下文选出本次要激活的检索 Agent
//!
//! 内置路由表 + [routing] 配置覆盖；结果只包含已启用目录中的 Agent，去重且保持顺序。
//! 相同意图、等价上下文总是得到相同的 Plan。

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::core::PipelineError;
use crate::pipeline::{Intent, IssueKind, RunContext};
use crate::retrieval::{AgentCatalog, AgentId, MEMORY, OPERATIONS, POLICY};

/// 寒暄判定：无实体、Other 类且不超过该词数
const SMALL_TALK_MAX_WORDS: usize = 3;

/// 本次运行的检索计划，创建后不可修改
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Plan {
    agents: Vec<AgentId>,
}

impl Plan {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn agents(&self) -> &[AgentId] {
        &self.agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.iter().any(|a| a.as_str() == id)
    }
}

pub struct Planner {
    enabled: BTreeSet<AgentId>,
    overrides: HashMap<IssueKind, Vec<AgentId>>,
}

impl Planner {
    pub fn new(catalog: &AgentCatalog) -> Self {
        Self {
            enabled: catalog.enabled_ids().into_iter().collect(),
            overrides: HashMap::new(),
        }
    }

    /// 加载 [routing] 覆盖；未知的问题类型跳过并告警
    pub fn with_routes(mut self, routes: &HashMap<String, Vec<String>>) -> Self {
        for (issue, agents) in routes {
            match IssueKind::parse(issue) {
                Some(kind) => {
                    self.overrides
                        .insert(kind, agents.iter().map(|a| AgentId::new(a.as_str())).collect());
                }
                None => tracing::warn!(issue = %issue, "Unknown issue kind in routing table, ignoring"),
            }
        }
        self
    }

    /// 生成 Plan；缺少摄取结果时视为规划失败
    pub fn plan(&self, intent: &Intent, ctx: &RunContext) -> Result<Plan, PipelineError> {
        let case = ctx
            .case
            .as_ref()
            .ok_or_else(|| PipelineError::Planning("no ingested case in run context".to_string()))?;
        let entities = &case.entities;

        let is_small_talk = intent.issue == IssueKind::Other
            && intent.safety_flags.is_empty()
            && !entities.has_operational_entity()
            && case.normalized.split_whitespace().count() <= SMALL_TALK_MAX_WORDS;
        if is_small_talk {
            return Ok(Plan::empty());
        }

        let candidates: Vec<AgentId> = match self.overrides.get(&intent.issue) {
            Some(list) => list.clone(),
            None => default_route(intent.issue, entities.has_operational_entity(), entities.order_id.is_some()),
        };

        let mut seen = BTreeSet::new();
        let mut agents = Vec::with_capacity(candidates.len());
        for id in candidates {
            if !self.enabled.contains(&id) {
                tracing::warn!(agent = %id, issue = intent.issue.as_str(), "Unknown or disabled agent dropped from plan");
                continue;
            }
            if seen.insert(id.clone()) {
                agents.push(id);
            }
        }
        Ok(Plan { agents })
    }
}

fn default_route(issue: IssueKind, has_entity: bool, has_order: bool) -> Vec<AgentId> {
    let ids: &[&str] = match issue {
        IssueKind::Refund | IssueKind::DeliveryDelay | IssueKind::Quality if has_entity => {
            &[OPERATIONS, POLICY, MEMORY]
        }
        IssueKind::Refund | IssueKind::DeliveryDelay | IssueKind::Quality => &[POLICY, MEMORY],
        IssueKind::Safety => &[OPERATIONS, POLICY, MEMORY],
        IssueKind::Account => &[MEMORY],
        IssueKind::Other if has_order => &[OPERATIONS, POLICY],
        IssueKind::Other => &[POLICY],
    };
    ids.iter().map(|id| AgentId::new(*id)).collect()
}
