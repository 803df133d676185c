//! 记忆层：短期（工作窗口）、运行内草稿、上下文存储适配器、分层长期记忆、摘要

pub mod context_store;
pub mod conversation;
pub mod long_term;
pub mod summarizer;
pub mod working;

pub use context_store::{ContextSeed, ContextStore, InMemoryContextStore};
pub use conversation::{Message, Role, WorkingWindow};
pub(crate) use long_term::tokenize_lower;
pub use long_term::{InMemoryMemoryStore, MemoryRecord, MemoryScope, MemoryStore, MemoryTier, NoopMemoryStore};
pub use summarizer::{ExtractiveSummarizer, LlmSummarizer, Summarizer};
pub use working::{Scratchpad, TraceNote};
