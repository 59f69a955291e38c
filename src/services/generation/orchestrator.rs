//! 生成编排器
//!
//! 驱动 路线图 → 模块循环 → 汇编 的状态机，持有暂停/恢复/取消语义。
//! 每个项目同一时间只有一个活动运行（调用方约定）；模块严格按路线图
//! 顺序串行生成，因为后面章节的 Prompt 会嵌入前面章节的内容摘录。

use dashmap::DashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::assembly::{self, AssemblyError};
use super::checkpoint::{CheckpointStore, GenerationCheckpoint};
use super::emitter::{StatusEmitter, Throttle};
use super::prompts;
use super::retry::{self, ErrorClass, RetryPolicy};
use super::roadmap::{self, RoadmapError};
use super::types::{
    count_words, GenerationConfig, GenerationStage, GenerationStatus, Module, ModuleStatus,
    ProjectStatus, Roadmap, RoadmapModule, Session, SharedProject, WsGenMessage,
    MODULE_PROGRESS_BAND, ROADMAP_PROGRESS,
};
use crate::llm::{ChatOptions, LlmError, TextGenerator};

/// 实时文本尾部保留的字符数
const TEXT_TAIL_CHARS: usize = 200;

/// 编排器错误
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("路线图阶段失败: {0}")]
    Roadmap(#[from] RoadmapError),

    #[error("汇编阶段失败: {0}")]
    Assembly(#[from] AssemblyError),

    #[error("状态不满足: {0}")]
    InvalidState(String),
}

/// 单模块一次尝试的失败
enum AttemptError {
    Llm(LlmError),
    TooShort { words: usize, min: usize },
}

impl AttemptError {
    fn classify(&self) -> ErrorClass {
        match self {
            AttemptError::Llm(e) => retry::classify(e),
            // 内容过短与传输层失败同等对待：可重试
            AttemptError::TooShort { .. } => ErrorClass::transient_only(),
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Llm(e) => write!(f, "{}", e),
            AttemptError::TooShort { words, min } => {
                write!(f, "生成内容过短: {} 词（最低 {} 词）", words, min)
            }
        }
    }
}

/// 单模块全部尝试后的结局
enum ModuleOutcome {
    /// 成功，附完成记录
    Completed(Module),
    /// 尝试耗尽或不可重试，附失败信息和总尝试次数
    Failed { message: String, attempts: u32 },
    /// 被暂停/取消打断，未到终态
    Interrupted,
}

/// 生成编排器
pub struct Orchestrator {
    /// 文本生成后端
    provider: Arc<dyn TextGenerator>,
    /// 断点存储
    checkpoints: Arc<CheckpointStore>,
    /// 重试策略
    policy: RetryPolicy,
    /// 生成参数
    config: GenerationConfig,
    /// LLM 调用参数
    chat_options: ChatOptions,
    /// 每个项目的进度广播通道
    channels: DashMap<String, broadcast::Sender<WsGenMessage>>,
    /// 活动运行的取消令牌（暂停/取消触发）
    active: DashMap<String, CancellationToken>,
}

impl Orchestrator {
    /// 创建新的编排器
    pub fn new(
        provider: Arc<dyn TextGenerator>,
        checkpoints: Arc<CheckpointStore>,
        policy: RetryPolicy,
        config: GenerationConfig,
        chat_options: ChatOptions,
    ) -> Self {
        Self {
            provider,
            checkpoints,
            policy,
            config,
            chat_options,
            channels: DashMap::new(),
            active: DashMap::new(),
        }
    }

    /// 订阅某个项目的进度消息
    pub fn subscribe(&self, project_id: &str) -> broadcast::Receiver<WsGenMessage> {
        self.sender(project_id).subscribe()
    }

    fn sender(&self, project_id: &str) -> broadcast::Sender<WsGenMessage> {
        self.channels
            .entry(project_id.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }

    fn emitter(&self, project_id: &str) -> StatusEmitter {
        StatusEmitter::new(project_id, self.sender(project_id))
    }

    /// 断点存储（测试和 API 层查询用）
    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    // ------------------------------------------------------------------
    // 路线图阶段
    // ------------------------------------------------------------------

    /// 生成路线图并挂到项目上
    pub async fn generate_roadmap(
        &self,
        session: &Session,
        project: &SharedProject,
    ) -> Result<Roadmap, OrchestratorError> {
        let project_id = project.read().await.id.clone();
        let emitter = self.emitter(&project_id);

        {
            let mut p = project.write().await;
            p.set_status(ProjectStatus::GeneratingRoadmap);
            emitter.project_update(&p);
        }
        emitter.emit(WsGenMessage::RoadmapStarted);

        let cancel = self.register_run(&project_id);
        let result =
            roadmap::generate(&*self.provider, session, &self.config, &self.chat_options, &cancel)
                .await;
        self.active.remove(&project_id);

        match result {
            Ok(roadmap) => {
                let mut p = project.write().await;
                p.roadmap = Some(roadmap.clone());
                p.progress = ROADMAP_PROGRESS;
                p.set_status(ProjectStatus::RoadmapCompleted);
                emitter.emit(WsGenMessage::RoadmapCompleted {
                    total_modules: roadmap.total_modules,
                });
                emitter.project_update(&p);
                Ok(roadmap)
            }
            Err(e) => {
                let mut p = project.write().await;
                p.set_error(e.to_string());
                emitter.emit(WsGenMessage::Error { message: e.to_string() });
                emitter.project_update(&p);
                Err(e.into())
            }
        }
    }

    // ------------------------------------------------------------------
    // 模块循环
    // ------------------------------------------------------------------

    /// 带断点恢复的全量模块生成
    ///
    /// 入口先合并磁盘断点与项目内存状态，只生成尚未完成的模块
    pub async fn generate_all_modules_with_recovery(
        &self,
        project: &SharedProject,
        session: &Session,
    ) -> Result<(), OrchestratorError> {
        self.run_module_loop(project, session, None).await
    }

    /// 仅重跑失败模块
    ///
    /// 已完成的模块原样保留；重跑后若不再有失败，项目重新变为可汇编
    pub async fn retry_failed_modules(
        &self,
        project: &SharedProject,
        session: &Session,
    ) -> Result<(), OrchestratorError> {
        let failed: HashSet<String> = {
            let p = project.read().await;
            p.modules
                .iter()
                .filter(|m| m.status == ModuleStatus::Error)
                .map(|m| m.roadmap_module_id.clone())
                .collect()
        };

        if failed.is_empty() {
            return Err(OrchestratorError::InvalidState(
                "没有失败的模块可以重试".to_string(),
            ));
        }

        self.run_module_loop(project, session, Some(failed)).await
    }

    /// 模块循环主体
    ///
    /// `only` 限定要处理的路线图条目（重试失败路径），None 表示全部未完成
    async fn run_module_loop(
        &self,
        project: &SharedProject,
        session: &Session,
        only: Option<HashSet<String>>,
    ) -> Result<(), OrchestratorError> {
        let (project_id, roadmap) = {
            let p = project.read().await;
            let roadmap = p.roadmap.clone().ok_or_else(|| {
                OrchestratorError::InvalidState("项目尚无路线图，先生成路线图".to_string())
            })?;
            (p.id.clone(), roadmap)
        };
        let emitter = self.emitter(&project_id);

        // 恢复：磁盘断点与项目内存状态可能在刷新后分叉，取并集
        self.checkpoints.hydrate_pause_flag(&project_id).await;
        let mut checkpoint = self
            .checkpoints
            .load(&project_id)
            .await
            .unwrap_or_else(|| GenerationCheckpoint::new(&project_id));
        self.reconcile_checkpoint(&mut checkpoint, project).await;

        let targets: HashSet<String> = roadmap
            .modules
            .iter()
            .filter(|m| match &only {
                Some(set) => set.contains(&m.id),
                None => !checkpoint.is_completed(&m.id),
            })
            .map(|m| m.id.clone())
            .collect();

        if targets.is_empty() {
            info!("Project {}: nothing to generate, ready for assembly", project_id);
            emitter.emit(WsGenMessage::ReadyForAssembly);
            return Ok(());
        }

        {
            let mut p = project.write().await;
            p.set_status(ProjectStatus::GeneratingContent);
            emitter.project_update(&p);
        }

        let cancel = self.register_run(&project_id);
        let result = self
            .module_loop_inner(project, session, &roadmap, &targets, &mut checkpoint, &cancel, &emitter)
            .await;
        self.active.remove(&project_id);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn module_loop_inner(
        &self,
        project: &SharedProject,
        session: &Session,
        roadmap: &Roadmap,
        targets: &HashSet<String>,
        checkpoint: &mut GenerationCheckpoint,
        cancel: &CancellationToken,
        emitter: &StatusEmitter,
    ) -> Result<(), OrchestratorError> {
        let project_id = emitter.project_id().to_string();
        let total = roadmap.total_modules;

        for (index, rm_module) in roadmap.modules.iter().enumerate() {
            if !targets.contains(&rm_module.id) || checkpoint.is_completed(&rm_module.id) {
                continue;
            }

            // 每个模块开始前的协作暂停点
            if self.checkpoints.is_paused(&project_id) {
                info!("Project {} paused before module {}", project_id, rm_module.id);
                self.checkpoints.save(checkpoint).await;
                emitter.emit(WsGenMessage::Paused {
                    completed_modules: checkpoint.completed_module_ids.len(),
                });
                return Ok(());
            }

            let context = self.build_context_excerpt(project, roadmap, index).await;

            let outcome = self
                .generate_module_with_retries(
                    session,
                    rm_module,
                    index,
                    total,
                    checkpoint.total_words,
                    &context,
                    cancel,
                    emitter,
                )
                .await;

            match outcome {
                ModuleOutcome::Completed(module) => {
                    let words = module.word_count;
                    info!(
                        "Module {} completed: {} words ({}/{})",
                        rm_module.id,
                        words,
                        checkpoint.completed_module_ids.len() + 1,
                        total
                    );
                    checkpoint.record_success(&rm_module.id, index, words);
                    self.checkpoints.save(checkpoint).await;

                    {
                        let mut p = project.write().await;
                        p.upsert_module(module);
                        p.progress = banded_progress(checkpoint.completed_module_ids.len(), total);
                        emitter.emit(WsGenMessage::ModuleCompleted {
                            module_id: rm_module.id.clone(),
                            word_count: words,
                        });
                        emitter.project_update(&p);
                    }
                }
                ModuleOutcome::Failed { message, attempts } => {
                    warn!(
                        "Module {} failed after {} attempt(s): {}",
                        rm_module.id, attempts, message
                    );
                    checkpoint.record_failure(&rm_module.id, attempts);
                    self.checkpoints.save(checkpoint).await;

                    {
                        let mut p = project.write().await;
                        p.upsert_module(Module::failed(&rm_module.id, &rm_module.title, message.clone()));
                        emitter.emit(WsGenMessage::ModuleFailed {
                            module_id: rm_module.id.clone(),
                            error: message,
                        });
                        emitter.project_update(&p);
                    }
                    // 单模块失败不中断整体，继续下一个
                }
                ModuleOutcome::Interrupted => {
                    info!("Project {} interrupted at module {}", project_id, rm_module.id);
                    self.checkpoints.save(checkpoint).await;
                    emitter.emit(WsGenMessage::Paused {
                        completed_modules: checkpoint.completed_module_ids.len(),
                    });
                    return Ok(());
                }
            }
        }

        // 所有目标模块到达终态
        let failed = project.read().await.failed_count();
        if failed == 0 {
            self.checkpoints.delete(&project_id).await;
            self.checkpoints.clear_pause_flag(&project_id).await;
            let mut p = project.write().await;
            p.progress = MODULE_PROGRESS_BAND.1;
            p.error = None;
            p.set_status(ProjectStatus::RoadmapCompleted);
            emitter.emit(WsGenMessage::ReadyForAssembly);
            emitter.project_update(&p);
        } else {
            let message = format!("{} failed module(s)", failed);
            let mut p = project.write().await;
            p.set_error(message.clone());
            emitter.emit(WsGenMessage::Error { message });
            emitter.project_update(&p);
        }

        Ok(())
    }

    /// 生成单个模块：有界重试循环（显式计数器，不递归）
    #[allow(clippy::too_many_arguments)]
    async fn generate_module_with_retries(
        &self,
        session: &Session,
        rm_module: &RoadmapModule,
        index: usize,
        total: usize,
        base_words: usize,
        context: &str,
        cancel: &CancellationToken,
        emitter: &StatusEmitter,
    ) -> ModuleOutcome {
        let prompt = prompts::format_module_prompt(
            session,
            rm_module,
            context,
            self.config.target_words_per_module,
        );
        let target_words = self.config.target_words_per_module;
        let project_id = emitter.project_id().to_string();

        let mut attempt: u32 = 1;
        loop {
            emitter.emit(WsGenMessage::ModuleStarted {
                module_id: rm_module.id.clone(),
                title: rm_module.title.clone(),
                index,
                attempt,
            });

            let result = {
                let mut buffer = String::new();
                let mut throttle = Throttle::new(self.config.status_throttle_ms);
                let mut on_chunk = |chunk: &str| {
                    buffer.push_str(chunk);
                    if !throttle.ready() {
                        return;
                    }
                    let words = count_words(&buffer);
                    let progress =
                        ((words as f32 / target_words as f32) * 100.0).min(95.0);
                    emitter.emit(WsGenMessage::ModuleProgress {
                        status: GenerationStatus {
                            project_id: project_id.clone(),
                            module_id: rm_module.id.clone(),
                            module_title: rm_module.title.clone(),
                            module_index: index,
                            total_modules: total,
                            attempt,
                            progress,
                            words_generated: words,
                            total_words: base_words + words,
                            stage: GenerationStage::from_progress(progress),
                            text_tail: text_tail(&buffer),
                            paused: false,
                        },
                    });
                };

                self.provider
                    .generate(&prompt, &self.chat_options, cancel, &mut on_chunk)
                    .await
            };

            let failure = match result {
                Ok(text) => {
                    let words = count_words(&text);
                    if words >= self.config.min_words_per_module {
                        return ModuleOutcome::Completed(Module::completed(
                            &rm_module.id,
                            &rm_module.title,
                            text,
                        ));
                    }
                    // 截断/退化输出按失败处理，走同一条重试路径
                    AttemptError::TooShort {
                        words,
                        min: self.config.min_words_per_module,
                    }
                }
                Err(LlmError::Aborted) => return ModuleOutcome::Interrupted,
                Err(e) => AttemptError::Llm(e),
            };

            let class = failure.classify();
            warn!(
                "Module {} attempt {}/{} failed: {}",
                rm_module.id, attempt, self.policy.max_module_attempts, failure
            );

            if !retry::should_retry(&class, attempt, self.policy.max_module_attempts) {
                return ModuleOutcome::Failed {
                    message: failure.to_string(),
                    attempts: attempt,
                };
            }

            let delay = retry::delay_for(&self.policy, attempt, class.rate_limited);
            info!("Retrying module {} in {:?}", rm_module.id, delay);

            // 退避等待也是挂起点，暂停/取消要能立即打断
            tokio::select! {
                _ = cancel.cancelled() => return ModuleOutcome::Interrupted,
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }

    /// 取最近几个已完成模块的标题和截断正文作为上下文摘录
    ///
    /// 第一个模块（前面没有任何完成内容）返回空串，Prompt 中完全省略
    async fn build_context_excerpt(
        &self,
        project: &SharedProject,
        roadmap: &Roadmap,
        current_index: usize,
    ) -> String {
        let p = project.read().await;

        let mut excerpts: Vec<String> = roadmap.modules[..current_index]
            .iter()
            .filter_map(|rm| p.module_for(&rm.id))
            .filter(|m| m.status == ModuleStatus::Completed)
            .map(|m| {
                let truncated: String = m
                    .content
                    .chars()
                    .take(self.config.context_excerpt_chars)
                    .collect();
                format!("### {}\n{}", m.title, truncated)
            })
            .collect();

        let keep = self.config.context_excerpt_modules;
        if excerpts.len() > keep {
            excerpts.drain(..excerpts.len() - keep);
        }

        excerpts.join("\n\n")
    }

    /// 把项目内存状态里的终态模块并入断点（双向取并集）
    async fn reconcile_checkpoint(&self, checkpoint: &mut GenerationCheckpoint, project: &SharedProject) {
        let p = project.read().await;
        for module in &p.modules {
            match module.status {
                ModuleStatus::Completed => {
                    checkpoint.failed_module_ids.remove(&module.roadmap_module_id);
                    checkpoint.retry_counts.remove(&module.roadmap_module_id);
                    checkpoint
                        .completed_module_ids
                        .insert(module.roadmap_module_id.clone());
                }
                ModuleStatus::Error => {
                    if !checkpoint.is_completed(&module.roadmap_module_id) {
                        checkpoint
                            .failed_module_ids
                            .insert(module.roadmap_module_id.clone());
                    }
                }
                _ => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // 汇编阶段
    // ------------------------------------------------------------------

    /// 汇编最终成书
    ///
    /// 前置条件：路线图所有条目处于终态（完成或失败），且至少有一个完成。
    /// 是否容忍失败模块是调用方的决策，这里不强制全部成功。
    pub async fn assemble_final_book(
        &self,
        project: &SharedProject,
        session: &Session,
    ) -> Result<String, OrchestratorError> {
        let project_id = project.read().await.id.clone();
        let emitter = self.emitter(&project_id);

        {
            let p = project.read().await;
            let roadmap = p.roadmap.as_ref().ok_or_else(|| {
                OrchestratorError::InvalidState("项目尚无路线图".to_string())
            })?;
            for rm in &roadmap.modules {
                match p.module_for(&rm.id).map(|m| m.status) {
                    Some(ModuleStatus::Completed) | Some(ModuleStatus::Error) => {}
                    _ => {
                        return Err(OrchestratorError::InvalidState(format!(
                            "模块 {} 尚未到达终态，不能汇编",
                            rm.id
                        )));
                    }
                }
            }
        }

        {
            let mut p = project.write().await;
            p.set_status(ProjectStatus::Assembling);
            emitter.emit(WsGenMessage::AssemblyStarted);
            emitter.project_update(&p);
        }

        let cancel = self.register_run(&project_id);
        let result = {
            let p = project.read().await;
            assembly::assemble(
                &*self.provider,
                &p,
                session,
                &self.config,
                &self.chat_options,
                &cancel,
            )
            .await
        };
        self.active.remove(&project_id);

        match result {
            Ok(book) => {
                // 整书完成：断点和暂停标志都不再需要
                self.checkpoints.delete(&project_id).await;
                self.checkpoints.clear_pause_flag(&project_id).await;

                let total_words = count_words(&book);
                let mut p = project.write().await;
                p.final_book = Some(book.clone());
                p.progress = 100.0;
                p.error = None;
                p.set_status(ProjectStatus::Completed);
                emitter.emit(WsGenMessage::Completed { total_words });
                emitter.project_update(&p);
                Ok(book)
            }
            Err(e) => {
                let mut p = project.write().await;
                p.set_error(e.to_string());
                emitter.emit(WsGenMessage::Error { message: e.to_string() });
                emitter.project_update(&p);
                Err(e.into())
            }
        }
    }

    // ------------------------------------------------------------------
    // 暂停 / 恢复 / 取消
    // ------------------------------------------------------------------

    /// 暂停：置暂停标志并立即中止在途调用
    ///
    /// 模块循环会在下一个检查点保存断点并安静退出
    pub async fn pause(&self, project_id: &str) {
        info!("Pause requested for project {}", project_id);
        self.checkpoints.set_pause_flag(project_id).await;
        if let Some(token) = self.active.get(project_id) {
            token.cancel();
        }
    }

    /// 恢复：仅清除暂停标志，调用方随后重新进入模块循环
    pub async fn resume(&self, project_id: &str) {
        info!("Resume requested for project {}", project_id);
        self.checkpoints.clear_pause_flag(project_id).await;
    }

    /// 取消在途运行
    ///
    /// 与暂停共用断点语义（没有破坏性取消）：已完成的进度全部保留。
    /// 不传项目 ID 时取消所有活动运行。
    pub fn cancel_active(&self, project_id: Option<&str>) {
        match project_id {
            Some(id) => {
                if let Some(token) = self.active.get(id) {
                    info!("Cancelling active run for project {}", id);
                    token.cancel();
                }
            }
            None => {
                for entry in self.active.iter() {
                    info!("Cancelling active run for project {}", entry.key());
                    entry.value().cancel();
                }
            }
        }
    }

    /// 某项目当前是否有活动运行
    pub fn has_active(&self, project_id: &str) -> bool {
        self.active.contains_key(project_id)
    }

    /// 注册一次活动运行，返回新的取消令牌
    fn register_run(&self, project_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.active.insert(project_id.to_string(), token.clone());
        token
    }
}

/// 模块完成比例映射到固定进度带
fn banded_progress(completed: usize, total: usize) -> f32 {
    let (low, high) = MODULE_PROGRESS_BAND;
    if total == 0 {
        return low;
    }
    low + (completed as f32 / total as f32) * (high - low)
}

/// 缓冲区尾部若干字符（保持 UTF-8 边界）
fn text_tail(buffer: &str) -> String {
    let count = buffer.chars().count();
    buffer
        .chars()
        .skip(count.saturating_sub(TEXT_TAIL_CHARS))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatOptions, ChunkHandler};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::RwLock;

    fn session() -> Session {
        Session {
            goal: "Learn SQL".to_string(),
            target_audience: String::new(),
            complexity_level: crate::services::generation::types::ComplexityLevel::Beginner,
            preferences: Default::default(),
        }
    }

    fn make_roadmap(n: usize) -> Roadmap {
        let modules = (1..=n)
            .map(|i| RoadmapModule {
                id: format!("module_{}", i),
                title: format!("第{}章", i),
                objectives: vec!["目标".to_string()],
                estimated_time: "1小时".to_string(),
                order: i as u32,
            })
            .collect();
        Roadmap {
            modules,
            total_modules: n,
            estimated_total_time: format!("{}小时", n),
            difficulty: "beginner".to_string(),
        }
    }

    fn project_with_roadmap(n: usize) -> SharedProject {
        let mut project = crate::services::generation::types::Project::new("测试书", "Learn SQL");
        project.roadmap = Some(make_roadmap(n));
        project.status = ProjectStatus::RoadmapCompleted;
        Arc::new(RwLock::new(project))
    }

    fn words(n: usize) -> String {
        "word ".repeat(n)
    }

    /// 把所有退避延迟压到毫秒级，让测试跑得动
    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_module_attempts: 5,
            base_retry_delay_ms: 1,
            max_retry_delay_ms: 2,
            base_rate_limit_delay_ms: 1,
        }
    }

    fn make_orchestrator(provider: Arc<dyn TextGenerator>, dir: &TempDir) -> Arc<Orchestrator> {
        let store = Arc::new(CheckpointStore::new(dir.path()));
        Arc::new(Orchestrator::new(
            provider,
            store,
            fast_policy(),
            GenerationConfig::default(),
            ChatOptions::default(),
        ))
    }

    /// 固定文本后端：分片交付，记录调用次数
    struct StaticProvider {
        text: String,
        calls: AtomicUsize,
    }

    impl StaticProvider {
        fn new(text: impl Into<String>) -> Self {
            Self {
                text: text.into(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TextGenerator for StaticProvider {
        async fn generate(
            &self,
            _prompt: &str,
            _options: &ChatOptions,
            cancel: &CancellationToken,
            on_chunk: ChunkHandler<'_>,
        ) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if cancel.is_cancelled() {
                return Err(LlmError::Aborted);
            }
            let chars: Vec<char> = self.text.chars().collect();
            for piece in chars.chunks((chars.len() / 3).max(1)) {
                on_chunk(&piece.iter().collect::<String>());
            }
            Ok(self.text.clone())
        }
    }

    /// 总是返回同一个错误
    struct FailingProvider {
        status: u16,
        message: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TextGenerator for FailingProvider {
        async fn generate(
            &self,
            _prompt: &str,
            _options: &ChatOptions,
            _cancel: &CancellationToken,
            _on_chunk: ChunkHandler<'_>,
        ) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(LlmError::ApiError {
                status: self.status,
                message: self.message.clone(),
            })
        }
    }

    /// 第 N 次调用开始时置暂停标志，之后照常出文
    struct PauseOnCallProvider {
        text: String,
        calls: AtomicUsize,
        pause_on: usize,
        store: Arc<CheckpointStore>,
        project_id: String,
    }

    #[async_trait]
    impl TextGenerator for PauseOnCallProvider {
        async fn generate(
            &self,
            _prompt: &str,
            _options: &ChatOptions,
            _cancel: &CancellationToken,
            on_chunk: ChunkHandler<'_>,
        ) -> Result<String, LlmError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.pause_on {
                self.store.set_pause_flag(&self.project_id).await;
            }
            on_chunk(&self.text);
            Ok(self.text.clone())
        }
    }

    /// 慢速流：响应取消
    struct SlowProvider;

    #[async_trait]
    impl TextGenerator for SlowProvider {
        async fn generate(
            &self,
            _prompt: &str,
            _options: &ChatOptions,
            cancel: &CancellationToken,
            on_chunk: ChunkHandler<'_>,
        ) -> Result<String, LlmError> {
            let mut text = String::new();
            for _ in 0..200 {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(LlmError::Aborted),
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {
                        on_chunk("word ");
                        text.push_str("word ");
                    }
                }
            }
            Ok(text)
        }
    }

    /// 词汇表 Prompt 失败，其余照常（验证汇编原子性）
    struct GlossaryFailProvider {
        text: String,
    }

    #[async_trait]
    impl TextGenerator for GlossaryFailProvider {
        async fn generate(
            &self,
            prompt: &str,
            _options: &ChatOptions,
            _cancel: &CancellationToken,
            on_chunk: ChunkHandler<'_>,
        ) -> Result<String, LlmError> {
            if prompt.contains("词汇表") {
                return Err(LlmError::ApiError {
                    status: 500,
                    message: "internal error".to_string(),
                });
            }
            on_chunk(&self.text);
            Ok(self.text.clone())
        }
    }

    fn roadmap_json(n: usize) -> String {
        let modules = (1..=n)
            .map(|i| {
                format!(
                    r#"{{"title": "第{}章", "objectives": ["a", "b", "c"], "estimated_time": "2小时"}}"#,
                    i
                )
            })
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "```json\n{{\"modules\": [{}], \"difficulty\": \"beginner\"}}\n```",
            modules
        )
    }

    #[tokio::test]
    async fn test_generate_roadmap_scenario() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(StaticProvider::new(roadmap_json(8)));
        let orchestrator = make_orchestrator(provider, &dir);

        let project = Arc::new(RwLock::new(
            crate::services::generation::types::Project::new("测试书", "Learn SQL"),
        ));
        let roadmap = orchestrator
            .generate_roadmap(&session(), &project)
            .await
            .unwrap();

        assert!(roadmap.total_modules >= 8);
        assert!(roadmap.modules.iter().all(|m| !m.objectives.is_empty()));

        let p = project.read().await;
        assert_eq!(p.status, ProjectStatus::RoadmapCompleted);
        assert!((p.progress - ROADMAP_PROGRESS).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_degenerate_short_output_marks_all_modules_failed() {
        let dir = TempDir::new().unwrap();
        // 低于 300 词下限：每次尝试都按内容过短失败
        let provider = Arc::new(StaticProvider::new(words(200)));
        let calls = &provider.calls;
        let orchestrator = make_orchestrator(provider.clone(), &dir);
        let project = project_with_roadmap(3);

        orchestrator
            .generate_all_modules_with_recovery(&project, &session())
            .await
            .unwrap();

        // 每个模块恰好 5 次尝试
        assert_eq!(calls.load(Ordering::SeqCst), 3 * 5);

        let p = project.read().await;
        assert_eq!(p.status, ProjectStatus::Error);
        assert!(p.error.as_ref().unwrap().contains("failed module(s)"));
        assert_eq!(p.failed_count(), 3);
        assert_eq!(p.completed_count(), 0);
    }

    #[tokio::test]
    async fn test_retry_bound_exactly_max_attempts() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(FailingProvider {
            status: 500,
            message: "internal error".to_string(),
            calls: AtomicUsize::new(0),
        });
        let orchestrator = make_orchestrator(provider.clone(), &dir);
        let project = project_with_roadmap(1);

        orchestrator
            .generate_all_modules_with_recovery(&project, &session())
            .await
            .unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 5);
        let p = project.read().await;
        assert_eq!(p.failed_count(), 1);

        // 断点里记录了重试次数
        let checkpoint = orchestrator.checkpoints().load(&p.id).await.unwrap();
        assert_eq!(checkpoint.retry_counts.get("module_1"), Some(&5));
        assert!(checkpoint.completed_module_ids.is_empty());
    }

    #[tokio::test]
    async fn test_full_run_completes_and_clears_checkpoint() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(StaticProvider::new(words(3500)));
        let orchestrator = make_orchestrator(provider.clone(), &dir);
        let project = project_with_roadmap(10);

        orchestrator
            .generate_all_modules_with_recovery(&project, &session())
            .await
            .unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 10);

        let p = project.read().await;
        assert_eq!(p.completed_count(), 10);
        assert_eq!(p.status, ProjectStatus::RoadmapCompleted);
        assert!(p.progress >= 85.0);
        // 零失败跑完后断点清除
        assert!(orchestrator.checkpoints().load(&p.id).await.is_none());
    }

    #[tokio::test]
    async fn test_pause_after_third_module_and_resume() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CheckpointStore::new(dir.path()));
        let project = project_with_roadmap(10);
        let project_id = project.read().await.id.clone();

        let provider = Arc::new(PauseOnCallProvider {
            text: words(3500),
            calls: AtomicUsize::new(0),
            pause_on: 3,
            store: store.clone(),
            project_id: project_id.clone(),
        });
        let orchestrator = Arc::new(Orchestrator::new(
            provider.clone(),
            store.clone(),
            fast_policy(),
            GenerationConfig::default(),
            ChatOptions::default(),
        ));

        // 第 3 个模块生成期间置标志：模块 3 仍然完成，循环在模块 4 之前停
        orchestrator
            .generate_all_modules_with_recovery(&project, &session())
            .await
            .unwrap();

        {
            let p = project.read().await;
            assert_eq!(p.completed_count(), 3);
            assert_eq!(p.status, ProjectStatus::GeneratingContent);
        }
        let checkpoint = store.load(&project_id).await.unwrap();
        assert_eq!(checkpoint.completed_module_ids.len(), 3);
        assert_eq!(checkpoint.last_successful_index, 2);
        assert!(checkpoint.failed_module_ids.is_empty());

        // 恢复后续跑：从模块 4 继续，任何模块都不会重新生成
        orchestrator.resume(&project_id).await;
        orchestrator
            .generate_all_modules_with_recovery(&project, &session())
            .await
            .unwrap();

        let p = project.read().await;
        assert_eq!(p.completed_count(), 10);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 10);
        assert!(store.load(&project_id).await.is_none());
    }

    #[tokio::test]
    async fn test_mid_stream_pause_aborts_in_flight_call() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(SlowProvider);
        let orchestrator = make_orchestrator(provider, &dir);
        let project = project_with_roadmap(2);
        let project_id = project.read().await.id.clone();

        let orch = orchestrator.clone();
        let proj = project.clone();
        let handle =
            tokio::spawn(async move { orch.generate_all_modules_with_recovery(&proj, &session()).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        orchestrator.pause(&project_id).await;
        handle.await.unwrap().unwrap();

        // 模块 1 被打断：不在完成集也不在失败集
        let p = project.read().await;
        assert_eq!(p.status, ProjectStatus::GeneratingContent);
        assert_eq!(p.completed_count(), 0);
        assert_eq!(p.failed_count(), 0);

        let checkpoint = orchestrator.checkpoints().load(&project_id).await.unwrap();
        assert!(checkpoint.completed_module_ids.is_empty());
        assert!(checkpoint.failed_module_ids.is_empty());
    }

    #[tokio::test]
    async fn test_resume_skips_completed_modules() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(StaticProvider::new(words(3500)));
        let orchestrator = make_orchestrator(provider.clone(), &dir);
        let project = project_with_roadmap(2);
        let project_id = project.read().await.id.clone();

        // 模拟上次运行留下的断点：模块 1 已完成
        let mut checkpoint = GenerationCheckpoint::new(&project_id);
        checkpoint.record_success("module_1", 0, 3500);
        orchestrator.checkpoints().save(&checkpoint).await;

        orchestrator
            .generate_all_modules_with_recovery(&project, &session())
            .await
            .unwrap();

        // 只生成了模块 2
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        let p = project.read().await;
        assert!(p.module_for("module_2").is_some());
        assert!(p.module_for("module_1").is_none());
    }

    #[tokio::test]
    async fn test_retry_failed_only_preserves_completed() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(StaticProvider::new(words(3500)));
        let orchestrator = make_orchestrator(provider.clone(), &dir);
        let project = project_with_roadmap(3);

        {
            let mut p = project.write().await;
            p.upsert_module(Module::completed("module_1", "第1章", "original content here".to_string()));
            p.upsert_module(Module::failed("module_2", "第2章", "boom".to_string()));
            p.upsert_module(Module::failed("module_3", "第3章", "boom".to_string()));
            p.status = ProjectStatus::Error;
        }

        orchestrator
            .retry_failed_modules(&project, &session())
            .await
            .unwrap();

        // 只重跑了两个失败模块，已完成的原样保留
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        let p = project.read().await;
        assert_eq!(p.completed_count(), 3);
        assert_eq!(p.failed_count(), 0);
        assert_eq!(p.module_for("module_1").unwrap().content, "original content here");
        assert_eq!(p.status, ProjectStatus::RoadmapCompleted);
    }

    #[tokio::test]
    async fn test_assembly_atomicity_on_partial_failure() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(GlossaryFailProvider { text: words(900) });
        let orchestrator = make_orchestrator(provider, &dir);
        let project = project_with_roadmap(2);

        {
            let mut p = project.write().await;
            p.upsert_module(Module::completed("module_1", "第1章", words(3500)));
            p.upsert_module(Module::completed("module_2", "第2章", words(3500)));
        }

        let result = orchestrator.assemble_final_book(&project, &session()).await;
        assert!(result.is_err());

        let p = project.read().await;
        assert!(p.final_book.is_none());
        assert_eq!(p.status, ProjectStatus::Error);
    }

    #[tokio::test]
    async fn test_assembly_success_produces_final_book() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(StaticProvider::new(words(900)));
        let orchestrator = make_orchestrator(provider, &dir);
        let project = project_with_roadmap(2);
        let project_id = project.read().await.id.clone();

        {
            let mut p = project.write().await;
            p.upsert_module(Module::completed("module_1", "第1章", words(3000)));
            p.upsert_module(Module::completed("module_2", "第2章", words(3000)));
        }
        // 留一个旧断点，验证汇编成功后被清掉
        let checkpoint = GenerationCheckpoint::new(&project_id);
        orchestrator.checkpoints().save(&checkpoint).await;

        let book = orchestrator
            .assemble_final_book(&project, &session())
            .await
            .unwrap();
        assert!(book.contains("## 目录"));
        assert!(book.contains("## 词汇表"));

        let p = project.read().await;
        assert_eq!(p.status, ProjectStatus::Completed);
        assert!((p.progress - 100.0).abs() < f32::EPSILON);
        assert!(p.final_book.is_some());
        assert!(orchestrator.checkpoints().load(&project_id).await.is_none());
    }

    #[tokio::test]
    async fn test_assembly_rejects_non_terminal_modules() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(StaticProvider::new(words(900)));
        let orchestrator = make_orchestrator(provider, &dir);
        let project = project_with_roadmap(2);

        {
            let mut p = project.write().await;
            p.upsert_module(Module::completed("module_1", "第1章", words(3000)));
            // module_2 还没有任何记录
        }

        let result = orchestrator.assemble_final_book(&project, &session()).await;
        assert!(matches!(result, Err(OrchestratorError::InvalidState(_))));
    }
}
