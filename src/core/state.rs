//! 运行状态机
//!
//! INGESTING → INTENT_CLASSIFIED → PLANNED → RETRIEVING → REASONING → GATING → {AUTO_RESPONDING | ESCALATING} → DONE。
//! 任一非终止状态可经致命错误直接进入 DONE；同一次运行内任何状态都不会被重复进入。

use serde::Serialize;
use thiserror::Error;

/// 单次运行所处阶段（同时作为 stage_started / stage_finished 事件的阶段名）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Ingesting,
    IntentClassified,
    Planned,
    Retrieving,
    Reasoning,
    Gating,
    AutoResponding,
    Escalating,
    Done,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Ingesting => "ingesting",
            RunState::IntentClassified => "intent_classified",
            RunState::Planned => "planned",
            RunState::Retrieving => "retrieving",
            RunState::Reasoning => "reasoning",
            RunState::Gating => "gating",
            RunState::AutoResponding => "auto_responding",
            RunState::Escalating => "escalating",
            RunState::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done)
    }

    /// 顺序边：该状态允许的正常后继
    fn successors(&self) -> &'static [RunState] {
        match self {
            RunState::Ingesting => &[RunState::IntentClassified],
            RunState::IntentClassified => &[RunState::Planned],
            RunState::Planned => &[RunState::Retrieving],
            RunState::Retrieving => &[RunState::Reasoning],
            RunState::Reasoning => &[RunState::Gating],
            RunState::Gating => &[RunState::AutoResponding, RunState::Escalating],
            RunState::AutoResponding | RunState::Escalating => &[RunState::Done],
            RunState::Done => &[],
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub from: RunState,
    pub to: RunState,
}

/// 每次运行独占的状态机：记录经过的状态，拒绝非法跳转与重复进入
#[derive(Debug, Clone)]
pub struct RunStateMachine {
    current: RunState,
    visited: Vec<RunState>,
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self {
            current: RunState::Ingesting,
            visited: vec![RunState::Ingesting],
        }
    }

    pub fn current(&self) -> RunState {
        self.current
    }

    pub fn visited(&self) -> &[RunState] {
        &self.visited
    }

    /// 沿顺序边前进一步
    pub fn advance(&mut self, next: RunState) -> Result<(), TransitionError> {
        let err = TransitionError {
            from: self.current,
            to: next,
        };
        if !self.current.successors().contains(&next) || self.visited.contains(&next) {
            return Err(err);
        }
        self.current = next;
        self.visited.push(next);
        Ok(())
    }

    /// 致命路径：从任意非终止状态直接进入 DONE
    pub fn abort(&mut self) -> Result<(), TransitionError> {
        if self.current.is_terminal() {
            return Err(TransitionError {
                from: self.current,
                to: RunState::Done,
            });
        }
        self.current = RunState::Done;
        self.visited.push(RunState::Done);
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.current.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut sm = RunStateMachine::new();
        for s in [
            RunState::IntentClassified,
            RunState::Planned,
            RunState::Retrieving,
            RunState::Reasoning,
            RunState::Gating,
            RunState::Escalating,
            RunState::Done,
        ] {
            sm.advance(s).unwrap();
        }
        assert!(sm.is_done());
        assert_eq!(sm.visited().len(), 8);
    }

    #[test]
    fn test_skipping_a_stage_is_rejected() {
        let mut sm = RunStateMachine::new();
        let err = sm.advance(RunState::Planned).unwrap_err();
        assert_eq!(err.from, RunState::Ingesting);
        assert_eq!(sm.current(), RunState::Ingesting);
    }

    #[test]
    fn test_abort_goes_straight_to_done_once() {
        let mut sm = RunStateMachine::new();
        sm.advance(RunState::IntentClassified).unwrap();
        sm.abort().unwrap();
        assert!(sm.is_done());
        assert!(sm.abort().is_err());
        assert!(sm.advance(RunState::Planned).is_err());
    }
}
