//! 短期记忆：对话消息与工作窗口
//!
//! 工作窗口保留最近 N 条消息（最新在末尾），超出时丢弃最旧部分；被丢弃的内容由摘要承接。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub at: DateTime<Utc>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }
}

/// 有界工作窗口：最多保留 capacity 条消息
#[derive(Clone, Debug)]
pub struct WorkingWindow {
    messages: Vec<Message>,
    capacity: usize,
}

impl WorkingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    /// 用已有消息初始化（只保留最近 capacity 条）
    pub fn from_messages(capacity: usize, messages: Vec<Message>) -> Self {
        let mut window = Self::new(capacity);
        window.messages = messages;
        window.prune();
        window
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
        self.prune();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// "role: content" 逐行拼接，供摘要与提示词使用
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn prune(&mut self) {
        if self.messages.len() > self.capacity {
            let excess = self.messages.len() - self.capacity;
            self.messages.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_keeps_most_recent_last() {
        let mut window = WorkingWindow::new(3);
        for i in 0..5 {
            window.push(Message::user(format!("m{i}")));
        }
        let contents: Vec<&str> = window.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_from_messages_prunes() {
        let msgs = (0..12).map(|i| Message::assistant(i.to_string())).collect();
        let window = WorkingWindow::from_messages(10, msgs);
        assert_eq!(window.len(), 10);
        assert_eq!(window.messages()[0].content, "2");
    }

    #[test]
    fn test_transcript() {
        let mut window = WorkingWindow::new(4);
        window.push(Message::user("hi"));
        window.push(Message::assistant("hello"));
        assert_eq!(window.transcript(), "user: hi\nassistant: hello");
    }
}
