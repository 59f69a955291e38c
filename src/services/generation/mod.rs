//! 图书生成模块
//!
//! 提供基于 LLM 的多章节图书生成编排
//!
//! # 功能
//!
//! - 路线图：把学习目标转成有序的章节计划
//! - 模块循环：逐章流式生成，带分类重试和退避
//! - 断点续传：每次状态变迁后保存断点，刷新/重启后精确恢复
//! - 暂停/恢复/取消：协作式中断，进度永不丢失
//! - 汇编：前言/总结/词汇表三路并发，拼接最终成书
//!
//! # 使用示例
//!
//! ```ignore
//! use std::sync::Arc;
//! use bookgen_rs::services::generation::{CheckpointStore, Orchestrator};
//!
//! let store = Arc::new(CheckpointStore::new("data/checkpoints"));
//! store.initialize().await?;
//!
//! let orchestrator = Orchestrator::new(provider, store, Default::default(),
//!                                      Default::default(), Default::default());
//!
//! let roadmap = orchestrator.generate_roadmap(&session, &project).await?;
//! orchestrator.generate_all_modules_with_recovery(&project, &session).await?;
//! let book = orchestrator.assemble_final_book(&project, &session).await?;
//! ```

mod assembly;
mod checkpoint;
mod emitter;
mod orchestrator;
pub mod prompts;
mod retry;
mod roadmap;
pub mod types;

pub use checkpoint::{default_checkpoint_root, CheckpointStore, GenerationCheckpoint};
pub use emitter::StatusEmitter;
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use retry::RetryPolicy;
pub use types::{
    GenerationConfig, GenerationStatus, Module, ModuleStatus, Project, ProjectStatus, Roadmap,
    RoadmapModule, Session, SharedProject, WsGenMessage,
};
