//! 运行内草稿：各阶段留下的推理轨迹与失败记录
//!
//! 只在单次运行内有效，随 RunContext 销毁；升级给人工时作为上下文快照的一部分。

use serde::Serialize;

use crate::core::RunState;

#[derive(Clone, Debug, Serialize)]
pub struct TraceNote {
    pub stage: RunState,
    pub note: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Scratchpad {
    pub trace: Vec<TraceNote>,
    pub failures: Vec<String>,
}

impl Scratchpad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note(&mut self, stage: RunState, note: impl Into<String>) {
        self.trace.push(TraceNote {
            stage,
            note: note.into(),
        });
    }

    pub fn add_failure(&mut self, failure: impl Into<String>) {
        self.failures.push(failure.into());
    }

    pub fn notes_for(&self, stage: RunState) -> impl Iterator<Item = &str> {
        self.trace
            .iter()
            .filter(move |n| n.stage == stage)
            .map(|n| n.note.as_str())
    }

    /// 拼成 prompt 片段（Trace / Failures）
    pub fn to_prompt_section(&self) -> String {
        let mut s = String::new();
        if !self.trace.is_empty() {
            s.push_str("## Trace\n");
            for n in &self.trace {
                s.push_str(&format!("- [{}] {}\n", n.stage, n.note));
            }
            s.push('\n');
        }
        if !self.failures.is_empty() {
            s.push_str("## Failures\n");
            for f in &self.failures {
                s.push_str(&format!("- {}\n", f));
            }
            s.push('\n');
        }
        s
    }
}
