//! 编排器构建器：从 AppConfig 组装各协作者
//!
//! 默认使用内存适配器与确定性阶段实现（关键词分类、证据推理、抽取式摘要）；
//! with_llm 切换到基于模型的分类 / 推理 / 摘要，其余 with_* 用于替换单个协作者（测试或接入外部服务）。

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{load_config, AppConfig, ConfigError};
use crate::core::{Orchestrator, OrchestratorParts, TaskSupervisor};
use crate::llm::LlmClient;
use crate::memory::{
    ContextStore, ExtractiveSummarizer, InMemoryContextStore, InMemoryMemoryStore, LlmSummarizer, MemoryStore,
    Summarizer,
};
use crate::pipeline::{
    EscalationSink, EvidenceReasoner, GatePolicy, InMemoryEscalationSink, IntentClassifier, KeywordClassifier,
    LlmIntentClassifier, LlmReasoner, PatternRuleset, Planner, Reasoner, Ruleset, SafetyGate,
};
use crate::retrieval::{AgentCatalog, AgentExecutor, MemoryAgent, OperationsAgent, PolicyAgent, RetrievalAgent};

pub struct OrchestratorBuilder {
    config: AppConfig,
    context_store: Option<Arc<dyn ContextStore>>,
    memory: Option<Arc<dyn MemoryStore>>,
    classifier: Option<Arc<dyn IntentClassifier>>,
    reasoner: Option<Arc<dyn Reasoner>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    ruleset: Option<Arc<dyn Ruleset>>,
    escalation: Option<Arc<dyn EscalationSink>>,
    extra_agents: Vec<Arc<dyn RetrievalAgent>>,
    builtin_agents: bool,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            context_store: None,
            memory: None,
            classifier: None,
            reasoner: None,
            summarizer: None,
            ruleset: None,
            escalation: None,
            extra_agents: Vec::new(),
            builtin_agents: true,
        }
    }

    /// 分类、推理、摘要都改用该模型（之前单独设置的不受影响）
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.classifier
            .get_or_insert_with(|| Arc::new(LlmIntentClassifier::new(llm.clone())));
        self.reasoner
            .get_or_insert_with(|| Arc::new(LlmReasoner::new(llm.clone())));
        self.summarizer
            .get_or_insert_with(|| Arc::new(LlmSummarizer::new(llm)));
        self
    }

    pub fn with_context_store(mut self, store: Arc<dyn ContextStore>) -> Self {
        self.context_store = Some(store);
        self
    }

    pub fn with_memory_store(mut self, store: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(store);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn IntentClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_reasoner(mut self, reasoner: Arc<dyn Reasoner>) -> Self {
        self.reasoner = Some(reasoner);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_ruleset(mut self, ruleset: Arc<dyn Ruleset>) -> Self {
        self.ruleset = Some(ruleset);
        self
    }

    pub fn with_escalation_sink(mut self, sink: Arc<dyn EscalationSink>) -> Self {
        self.escalation = Some(sink);
        self
    }

    /// 注册额外的检索 Agent（同名会覆盖内置 Agent）；是否启用仍由 [catalog] enabled 决定
    pub fn with_agent(mut self, agent: Arc<dyn RetrievalAgent>) -> Self {
        self.extra_agents.push(agent);
        self
    }

    /// 不注册内置的 operations / policy / memory
    pub fn without_builtin_agents(mut self) -> Self {
        self.builtin_agents = false;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn build(self) -> Result<Orchestrator, ConfigError> {
        self.config.validate()?;
        let cfg = self.config;
        let settings = cfg.orchestrator.clone();

        let memory: Arc<dyn MemoryStore> = self
            .memory
            .unwrap_or_else(|| Arc::new(InMemoryMemoryStore::new(cfg.memory.max_entries)));

        let mut catalog = AgentCatalog::new();
        if self.builtin_agents {
            catalog.register(OperationsAgent::from_entries(&cfg.retrieval.records));
            catalog.register(PolicyAgent::from_entries(&cfg.retrieval.policies));
            catalog.register(MemoryAgent::new(Arc::clone(&memory)));
        }
        for agent in self.extra_agents {
            catalog.register_arc(agent);
        }
        catalog.set_enabled(&cfg.catalog.enabled);
        let enabled: Vec<String> = catalog.enabled_ids().iter().map(|id| id.to_string()).collect();
        tracing::info!(agents = ?enabled, "Retrieval catalog ready");

        let planner = Planner::new(&catalog).with_routes(&cfg.routing);
        let executor = AgentExecutor::new(catalog, settings.max_items_per_agent, settings.agent_timeout());
        let ruleset: Arc<dyn Ruleset> = match self.ruleset {
            Some(ruleset) => ruleset,
            None => Arc::new(
                PatternRuleset::from_config(&cfg.safety)
                    .map_err(|e| ConfigError::Message(format!("safety patterns: {e}")))?,
            ),
        };
        let gate = SafetyGate::new(ruleset, GatePolicy::new(settings.confidence_threshold));

        Ok(Orchestrator::from_parts(OrchestratorParts {
            context_store: self
                .context_store
                .unwrap_or_else(|| Arc::new(InMemoryContextStore::new())),
            memory,
            classifier: self
                .classifier
                .unwrap_or_else(|| Arc::new(KeywordClassifier::new())),
            planner,
            executor,
            reasoner: self
                .reasoner
                .unwrap_or_else(|| Arc::new(EvidenceReasoner::new())),
            gate,
            escalation: self
                .escalation
                .unwrap_or_else(|| Arc::new(InMemoryEscalationSink::new())),
            summarizer: self
                .summarizer
                .unwrap_or_else(|| Arc::new(ExtractiveSummarizer)),
            supervisor: TaskSupervisor::new(settings.max_concurrent_detached),
            settings,
        }))
    }
}

/// 便捷函数：加载配置（失败时使用默认值并告警）并创建构建器
pub fn create_orchestrator_builder(config_path: Option<PathBuf>) -> OrchestratorBuilder {
    let config = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    OrchestratorBuilder::new(config)
}
