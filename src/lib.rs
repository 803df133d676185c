//! Triage - 多阶段客服智能体编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 运行状态机、编排器、错误与恢复、运行 / 后台任务监管
//! - **llm**: 分类 / 推理 / 摘要阶段消费的 LLM 窄接口
//! - **memory**: 工作窗口、上下文存储、分层长期记忆、摘要
//! - **observability**: tracing 初始化
//! - **pipeline**: 摄取、意图、规划、推理、安全闸门、升级、事件流
//! - **retrieval**: 检索 Agent 目录、执行器与内置 Agent
//! - **workflow**: 检索扇出与扇入屏障

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod pipeline;
pub mod retrieval;
pub mod workflow;

pub use crate::core::{Orchestrator, OrchestratorBuilder, PipelineError, QueryRequest, RunHandle};
pub use crate::pipeline::{Persona, StreamEvent, Verdict};
