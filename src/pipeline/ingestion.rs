//! Ingestion：输入规范化与实体抽取
//!
//! 去除首尾空白、折叠连续空白，空输入视为致命错误；用正则抽取订单 / 区域 / 餐厅 / 客户 ID。

use std::sync::OnceLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::PipelineError;

/// 单条消息最大字符数，超出部分截断
const MAX_MESSAGE_CHARS: usize = 4000;

/// 实体 ID 至少含一位数字，避免把普通单词当作 ID
struct EntityPatterns {
    order: Regex,
    zone: Regex,
    restaurant: Regex,
    customer: Regex,
}

static ENTITY_PATTERNS: OnceLock<Result<EntityPatterns, regex::Error>> = OnceLock::new();

fn entity_patterns() -> Result<&'static EntityPatterns, PipelineError> {
    ENTITY_PATTERNS
        .get_or_init(|| {
            Ok(EntityPatterns {
                order: Regex::new(r"(?i)\border[_\s#-]*([a-z0-9_-]*\d[a-z0-9_-]*)")?,
                zone: Regex::new(r"(?i)\bzone[_\s#-]?([a-z0-9_-]*\d[a-z0-9_-]*)")?,
                restaurant: Regex::new(r"(?i)\b(?:restaurant|rest)[_\s#-]?([a-z0-9_-]*\d[a-z0-9_-]*)")?,
                customer: Regex::new(r"(?i)\bcustomer[_\s#-]?([a-z0-9_-]*\d[a-z0-9_-]*)")?,
            })
        })
        .as_ref()
        .map_err(|e| PipelineError::Ingestion(format!("entity pattern failed to compile: {e}")))
}

/// 提问者身份：客户本人或代客户操作的客服 / 运营人员
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum Persona {
    #[default]
    Customer,
    #[value(alias = "agent", alias = "support")]
    SupportAgent,
    #[value(alias = "ops", alias = "admin")]
    Operations,
}

/// 从消息中抽取的实体
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CaseEntities {
    pub order_id: Option<String>,
    pub zone_id: Option<String>,
    pub restaurant_id: Option<String>,
    /// Customer 身份时即 user_id；客服身份时取消息中提到的客户
    pub customer_id: Option<String>,
}

impl CaseEntities {
    /// 是否提到任何运营实体（订单 / 区域 / 餐厅）
    pub fn has_operational_entity(&self) -> bool {
        self.order_id.is_some() || self.zone_id.is_some() || self.restaurant_id.is_some()
    }
}

/// 规范化后的案件
#[derive(Clone, Debug, Serialize)]
pub struct CaseFile {
    pub raw_text: String,
    pub normalized: String,
    pub persona: Persona,
    pub channel: String,
    pub entities: CaseEntities,
}

/// 规范化输入并抽取实体
pub fn ingest(raw_text: &str, user_id: &str, persona: Persona) -> Result<CaseFile, PipelineError> {
    let normalized = normalize(raw_text);
    if normalized.is_empty() {
        return Err(PipelineError::Ingestion("message is empty".to_string()));
    }

    let patterns = entity_patterns()?;
    let mentioned_customer = capture(&patterns.customer, &normalized);
    let customer_id = match persona {
        Persona::Customer => Some(user_id.to_string()),
        Persona::SupportAgent | Persona::Operations => mentioned_customer,
    };

    let entities = CaseEntities {
        order_id: capture(&patterns.order, &normalized),
        zone_id: capture(&patterns.zone, &normalized),
        restaurant_id: capture(&patterns.restaurant, &normalized),
        customer_id,
    };

    Ok(CaseFile {
        raw_text: raw_text.to_string(),
        normalized,
        persona,
        channel: "web".to_string(),
        entities,
    })
}

/// 去除首尾空白、折叠连续空白、截断超长消息
pub fn normalize(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > MAX_MESSAGE_CHARS {
        collapsed.chars().take(MAX_MESSAGE_CHARS).collect()
    } else {
        collapsed
    }
}

fn capture(pattern: &Regex, text: &str) -> Option<String> {
    pattern
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|s| !s.is_empty())
}
