//! LLM 层：推理 / 分类 / 摘要阶段消费的窄接口（具体模型调用由外部实现）

pub mod mock;
pub mod parse;
pub mod traits;

pub use mock::ScriptedLlmClient;
pub use parse::extract_json_block;
pub use traits::LlmClient;
