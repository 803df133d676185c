//! 单次运行的上下文：标识、工作窗口、运行摘要、各阶段的中间产物
//!
//! 每次查询新建、由一次运行独占，运行结束即销毁；不跨运行共享。

use crate::memory::{ContextSeed, Message, Scratchpad, WorkingWindow};
use crate::pipeline::{CaseFile, Intent, Persona, Plan};
use crate::retrieval::RetrievalRequest;

/// 查询标识
#[derive(Clone, Debug)]
pub struct RunIds {
    pub run_id: String,
    pub user_id: String,
    pub conversation_id: String,
    /// 本轮在会话中的序号（从 1 开始）
    pub turn: u64,
}

#[derive(Debug)]
pub struct RunContext {
    pub ids: RunIds,
    pub persona: Persona,
    /// 最近 N 条消息，最新在末尾
    pub window: WorkingWindow,
    pub summary: Option<String>,
    pub messages_since_summary: usize,
    pub case: Option<CaseFile>,
    pub intent: Option<Intent>,
    pub plan: Option<Plan>,
    pub scratchpad: Scratchpad,
}

impl RunContext {
    pub fn new(ids: RunIds, persona: Persona, window_size: usize) -> Self {
        Self {
            ids,
            persona,
            window: WorkingWindow::new(window_size),
            summary: None,
            messages_since_summary: 0,
            case: None,
            intent: None,
            plan: None,
            scratchpad: Scratchpad::new(),
        }
    }

    /// 用上下文存储的加载结果填充窗口与摘要
    pub fn hydrate(&mut self, seed: ContextSeed) {
        let capacity = self.window.capacity();
        self.window = WorkingWindow::from_messages(capacity, seed.messages);
        self.summary = seed.summary;
        self.messages_since_summary = seed.messages_since_summary;
        self.ids.turn = seed.user_turns as u64 + 1;
    }

    /// 记录本轮用户消息（窗口超出容量时丢弃最旧）
    pub fn push_user_message(&mut self, content: &str) {
        self.window.push(Message::user(content));
        self.messages_since_summary += 1;
    }

    /// 规范化后的查询文本；未完成摄取时为空
    pub fn query(&self) -> &str {
        self.case.as_ref().map(|c| c.normalized.as_str()).unwrap_or("")
    }

    /// 构造给检索 Agent 的只读快照
    pub fn retrieval_request(&self) -> Option<RetrievalRequest> {
        let case = self.case.as_ref()?;
        let intent = self.intent.clone()?;
        Some(RetrievalRequest {
            run_id: self.ids.run_id.clone(),
            user_id: self.ids.user_id.clone(),
            conversation_id: self.ids.conversation_id.clone(),
            query: case.normalized.clone(),
            entities: case.entities.clone(),
            intent,
            summary: self.summary.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ingest;

    fn ids() -> RunIds {
        RunIds {
            run_id: "r1".into(),
            user_id: "u1".into(),
            conversation_id: "c1".into(),
            turn: 1,
        }
    }

    #[test]
    fn test_window_is_bounded_after_hydrate() {
        let mut ctx = RunContext::new(ids(), Persona::Customer, 3);
        ctx.hydrate(ContextSeed {
            messages: (0..3).map(|i| Message::user(format!("m{i}"))).collect(),
            summary: Some("earlier".into()),
            messages_since_summary: 3,
            user_turns: 3,
        });
        ctx.push_user_message("new");
        assert_eq!(ctx.window.len(), 3);
        assert_eq!(ctx.window.messages()[2].content, "new");
        assert_eq!(ctx.window.messages()[0].content, "m1");
        assert_eq!(ctx.messages_since_summary, 4);
        assert_eq!(ctx.ids.turn, 4);
    }

    #[test]
    fn test_retrieval_request_requires_case_and_intent() {
        let mut ctx = RunContext::new(ids(), Persona::Customer, 10);
        assert!(ctx.retrieval_request().is_none());
        ctx.case = Some(ingest("refund order 42", "u1", Persona::Customer).unwrap());
        assert!(ctx.retrieval_request().is_none());
        ctx.intent = Some(Intent::fallback());
        let req = ctx.retrieval_request().unwrap();
        assert_eq!(req.entities.order_id.as_deref(), Some("42"));
        assert_eq!(ctx.query(), "refund order 42");
    }
}
