//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TRIAGE__*` 覆盖（双下划线表示嵌套，如 `TRIAGE__ORCHESTRATOR__CONFIDENCE_THRESHOLD=0.8`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

pub use config::ConfigError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub orchestrator: OrchestratorSection,
    pub catalog: CatalogSection,
    /// 意图 -> 检索 Agent 列表，覆盖内置路由表（键为 refund / delivery_delay / quality / safety / account / other）
    pub routing: HashMap<String, Vec<String>>,
    pub safety: SafetySection,
    pub memory: MemorySection,
    pub retrieval: RetrievalSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [orchestrator] 段：闸门阈值、超时、工作窗口与摘要触发间隔
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// 自动回复所需的最低置信度 T
    pub confidence_threshold: f32,
    /// 单个检索 Agent 的超时（毫秒），必须严格小于 run_timeout_ms
    pub agent_timeout_ms: u64,
    /// 同步路径（ingestion 至 gating）的整体超时（毫秒）
    pub run_timeout_ms: u64,
    /// 工作窗口大小 N（最近消息条数）
    pub window_size: usize,
    /// 距上次摘要累计多少条消息后触发摘要
    pub summarize_every: usize,
    /// 单个 Agent 最多返回的证据条数
    pub max_items_per_agent: usize,
    /// 后台任务并发上限
    pub max_concurrent_detached: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            agent_timeout_ms: 5_000,
            run_timeout_ms: 30_000,
            window_size: 10,
            summarize_every: 10,
            max_items_per_agent: 5,
            max_concurrent_detached: 8,
        }
    }
}

impl OrchestratorSection {
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }
}

/// [catalog] 段：启用的检索 Agent 标识
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CatalogSection {
    pub enabled: Vec<String>,
}

impl Default for CatalogSection {
    fn default() -> Self {
        Self {
            enabled: vec!["operations".into(), "policy".into(), "memory".into()],
        }
    }
}

/// [safety] 段：规则集开关与屏蔽词
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SafetySection {
    pub blocked_terms: Vec<String>,
    pub detect_pii: bool,
    pub detect_injection: bool,
    /// 关键 Agent（operations / policy）失败时是否强制升级
    pub escalate_on_critical_failure: bool,
}

impl Default for SafetySection {
    fn default() -> Self {
        Self {
            blocked_terms: Vec::new(),
            detect_pii: true,
            detect_injection: true,
            escalate_on_critical_failure: true,
        }
    }
}

/// [memory] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub max_entries: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self { max_entries: 1000 }
    }
}

/// [retrieval] 段：内置内存后端的种子数据
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RetrievalSection {
    pub policies: Vec<PolicyEntry>,
    pub records: Vec<RecordEntry>,
}

/// [[retrieval.policies]]：一篇政策文档
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyEntry {
    pub id: String,
    pub title: String,
    pub body: String,
}

/// [[retrieval.records]]：一条运营记录（按实体类型 + ID 检索）
#[derive(Debug, Clone, Deserialize)]
pub struct RecordEntry {
    /// order / zone / restaurant
    pub kind: String,
    pub id: String,
    pub summary: String,
}

impl AppConfig {
    /// 校验取值范围：阈值在 [0,1]，窗口非零，摘要间隔不超过窗口，单 Agent 超时严格小于整体超时
    pub fn validate(&self) -> Result<(), ConfigError> {
        let o = &self.orchestrator;
        if !(0.0..=1.0).contains(&o.confidence_threshold) {
            return Err(ConfigError::Message(format!(
                "orchestrator.confidence_threshold must be within [0, 1], got {}",
                o.confidence_threshold
            )));
        }
        if o.window_size == 0 {
            return Err(ConfigError::Message(
                "orchestrator.window_size must be greater than zero".into(),
            ));
        }
        if o.summarize_every == 0 || o.summarize_every > o.window_size {
            return Err(ConfigError::Message(format!(
                "orchestrator.summarize_every ({}) must be within 1..=window_size ({})",
                o.summarize_every, o.window_size
            )));
        }
        if o.agent_timeout_ms >= o.run_timeout_ms {
            return Err(ConfigError::Message(format!(
                "orchestrator.agent_timeout_ms ({}) must be smaller than run_timeout_ms ({})",
                o.agent_timeout_ms, o.run_timeout_ms
            )));
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 TRIAGE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TRIAGE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TRIAGE")
            .separator("__")
            .try_parsing(true),
    );

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}

/// 只读取指定文件（不叠加默认文件与环境变量），测试与嵌入场景使用
pub fn load_config_file(path: &std::path::Path) -> Result<AppConfig, ConfigError> {
    let cfg: AppConfig = config::Config::builder()
        .add_source(config::File::from(path.to_path_buf()))
        .build()?
        .try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}
