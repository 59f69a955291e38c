//! 图书生成核心类型定义
//!
//! 定义会话、项目、路线图、模块等核心类型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// 内容复杂度等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLevel {
    /// 入门
    Beginner,
    /// 进阶
    Intermediate,
    /// 高级
    Advanced,
}

impl Default for ComplexityLevel {
    fn default() -> Self {
        Self::Intermediate
    }
}

impl ComplexityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Beginner => "beginner",
            Self::Intermediate => "intermediate",
            Self::Advanced => "advanced",
        }
    }
}

/// 内容偏好开关
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContentPreferences {
    /// 是否包含示例
    #[serde(default = "default_true")]
    pub include_examples: bool,
    /// 是否包含练习
    #[serde(default = "default_true")]
    pub include_exercises: bool,
    /// 是否包含测验
    #[serde(default)]
    pub include_quizzes: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ContentPreferences {
    fn default() -> Self {
        Self {
            include_examples: true,
            include_exercises: true,
            include_quizzes: false,
        }
    }
}

/// 生成会话：调用方在生成开始前创建，之后不再变更
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// 学习目标
    pub goal: String,
    /// 目标读者
    #[serde(default)]
    pub target_audience: String,
    /// 复杂度等级
    #[serde(default)]
    pub complexity_level: ComplexityLevel,
    /// 内容偏好
    #[serde(default)]
    pub preferences: ContentPreferences,
}

/// 项目生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    /// 初始规划
    Planning,
    /// 路线图生成中
    GeneratingRoadmap,
    /// 路线图已完成
    RoadmapCompleted,
    /// 章节内容生成中
    GeneratingContent,
    /// 汇编中
    Assembling,
    /// 全部完成
    Completed,
    /// 出错（可通过重试/恢复继续）
    Error,
}

impl Default for ProjectStatus {
    fn default() -> Self {
        Self::Planning
    }
}

/// 单个模块（章节）状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    /// 待生成
    Pending,
    /// 生成中
    Generating,
    /// 已完成
    Completed,
    /// 生成失败
    Error,
}

/// 路线图条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoadmapModule {
    /// 稳定 ID，格式 `module_<1-based-index>`
    pub id: String,
    /// 章节标题
    pub title: String,
    /// 学习目标（3-5 条）
    pub objectives: Vec<String>,
    /// 预计学习时长
    pub estimated_time: String,
    /// 顺序（1-based）
    pub order: u32,
}

/// 路线图：第一阶段 LLM 产出的整书计划
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Roadmap {
    /// 有序模块列表
    pub modules: Vec<RoadmapModule>,
    /// 模块总数
    pub total_modules: usize,
    /// 预计总时长
    pub estimated_total_time: String,
    /// 难度标签
    pub difficulty: String,
}

/// 已生成的模块（章节）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    /// 记录 ID
    pub id: String,
    /// 对应的路线图条目 ID
    pub roadmap_module_id: String,
    /// 章节标题
    pub title: String,
    /// 生成的正文
    pub content: String,
    /// 字数
    pub word_count: usize,
    /// 状态
    pub status: ModuleStatus,
    /// 失败信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 生成时间
    pub generated_at: DateTime<Utc>,
}

impl Module {
    /// 创建一条完成记录
    pub fn completed(roadmap_module_id: &str, title: &str, content: String) -> Self {
        let word_count = count_words(&content);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            roadmap_module_id: roadmap_module_id.to_string(),
            title: title.to_string(),
            content,
            word_count,
            status: ModuleStatus::Completed,
            error: None,
            generated_at: Utc::now(),
        }
    }

    /// 创建一条失败记录
    pub fn failed(roadmap_module_id: &str, title: &str, error: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            roadmap_module_id: roadmap_module_id.to_string(),
            title: title.to_string(),
            content: String::new(),
            word_count: 0,
            status: ModuleStatus::Error,
            error: Some(error),
            generated_at: Utc::now(),
        }
    }
}

/// 书籍项目：一本书的可变聚合
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// 项目 ID
    pub id: String,
    /// 书名
    pub title: String,
    /// 学习目标
    pub goal: String,
    /// 生命周期状态
    pub status: ProjectStatus,
    /// 整体进度 (0-100)
    pub progress: f32,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 更新时间
    pub updated_at: DateTime<Utc>,
    /// 路线图
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roadmap: Option<Roadmap>,
    /// 已生成的模块集合
    #[serde(default)]
    pub modules: Vec<Module>,
    /// 最终汇编文本
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_book: Option<String>,
    /// 错误信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Project {
    /// 创建新项目
    pub fn new(title: impl Into<String>, goal: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            goal: goal.into(),
            status: ProjectStatus::Planning,
            progress: 0.0,
            created_at: now,
            updated_at: now,
            roadmap: None,
            modules: Vec::new(),
            final_book: None,
            error: None,
        }
    }

    /// 更新状态并刷新时间戳
    pub fn set_status(&mut self, status: ProjectStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// 标记错误
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.status = ProjectStatus::Error;
        self.error = Some(message.into());
        self.updated_at = Utc::now();
    }

    /// 按路线图条目 ID 查找模块记录
    pub fn module_for(&self, roadmap_module_id: &str) -> Option<&Module> {
        self.modules
            .iter()
            .find(|m| m.roadmap_module_id == roadmap_module_id)
    }

    /// 用新记录替换同一路线图条目的旧记录（重试语义）
    pub fn upsert_module(&mut self, module: Module) {
        self.modules
            .retain(|m| m.roadmap_module_id != module.roadmap_module_id);
        self.modules.push(module);
        self.updated_at = Utc::now();
    }

    /// 已完成模块数
    pub fn completed_count(&self) -> usize {
        self.modules
            .iter()
            .filter(|m| m.status == ModuleStatus::Completed)
            .count()
    }

    /// 失败模块数
    pub fn failed_count(&self) -> usize {
        self.modules
            .iter()
            .filter(|m| m.status == ModuleStatus::Error)
            .count()
    }
}

/// 粗粒度生成阶段标签（按字数进度划分，供 UI 展示）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStage {
    /// 分析需求
    Analyzing,
    /// 撰写正文
    Writing,
    /// 补充示例
    Examples,
    /// 收尾润色
    Polishing,
}

impl GenerationStage {
    /// 根据模块进度百分比推导阶段
    pub fn from_progress(progress: f32) -> Self {
        if progress < 15.0 {
            Self::Analyzing
        } else if progress < 60.0 {
            Self::Writing
        } else if progress < 90.0 {
            Self::Examples
        } else {
            Self::Polishing
        }
    }
}

/// 细粒度生成状态快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationStatus {
    /// 项目 ID
    pub project_id: String,
    /// 当前路线图条目 ID
    pub module_id: String,
    /// 当前章节标题
    pub module_title: String,
    /// 当前章节序号（0-based）
    pub module_index: usize,
    /// 模块总数
    pub total_modules: usize,
    /// 当前尝试次数（1-based）
    pub attempt: u32,
    /// 模块级进度 (0-100)
    pub progress: f32,
    /// 本模块已生成字数
    pub words_generated: usize,
    /// 全书累计字数
    pub total_words: usize,
    /// 阶段标签
    pub stage: GenerationStage,
    /// 实时文本尾部（最近的片段）
    pub text_tail: String,
    /// 是否处于暂停
    pub paused: bool,
}

/// WebSocket 进度消息类型
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsGenMessage {
    /// 项目级变更（状态/进度/错误）
    ProjectUpdate {
        status: ProjectStatus,
        progress: f32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// 路线图生成开始
    RoadmapStarted,
    /// 路线图生成完成
    RoadmapCompleted { total_modules: usize },
    /// 模块开始生成
    ModuleStarted {
        module_id: String,
        title: String,
        index: usize,
        attempt: u32,
    },
    /// 模块生成进度快照
    ModuleProgress { status: GenerationStatus },
    /// 模块完成
    ModuleCompleted { module_id: String, word_count: usize },
    /// 模块失败（不中断整体流程）
    ModuleFailed { module_id: String, error: String },
    /// 已暂停，断点已保存
    Paused { completed_modules: usize },
    /// 所有模块终态，可以进入汇编
    ReadyForAssembly,
    /// 汇编开始
    AssemblyStarted,
    /// 全书完成
    Completed { total_words: usize },
    /// 生成失败
    Error { message: String },
}

/// 生成参数配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// 单模块目标字数（用于进度估算）
    #[serde(default = "default_target_words")]
    pub target_words_per_module: usize,

    /// 单模块最低字数，低于视为失败
    #[serde(default = "default_min_words")]
    pub min_words_per_module: usize,

    /// 上下文摘录取最近几个已完成模块
    #[serde(default = "default_context_modules")]
    pub context_excerpt_modules: usize,

    /// 上下文摘录中每个模块正文截断长度（字符）
    #[serde(default = "default_context_chars")]
    pub context_excerpt_chars: usize,

    /// 词汇表提取的正文拼接上限（字符）
    #[serde(default = "default_glossary_budget")]
    pub glossary_source_char_budget: usize,

    /// 路线图最少模块数
    #[serde(default = "default_roadmap_min_modules")]
    pub roadmap_min_modules: usize,

    /// 路线图整体重试次数
    #[serde(default = "default_roadmap_attempts")]
    pub roadmap_attempts: u32,

    /// 路线图重试间隔（毫秒）
    #[serde(default = "default_roadmap_retry_delay_ms")]
    pub roadmap_retry_delay_ms: u64,

    /// 状态快照节流间隔（毫秒）
    #[serde(default = "default_status_throttle_ms")]
    pub status_throttle_ms: u64,
}

fn default_target_words() -> usize {
    3000
}

fn default_min_words() -> usize {
    300
}

fn default_context_modules() -> usize {
    2
}

fn default_context_chars() -> usize {
    1500
}

fn default_glossary_budget() -> usize {
    24_000
}

fn default_roadmap_min_modules() -> usize {
    8
}

fn default_roadmap_attempts() -> u32 {
    2
}

fn default_roadmap_retry_delay_ms() -> u64 {
    2000
}

fn default_status_throttle_ms() -> u64 {
    500
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            target_words_per_module: default_target_words(),
            min_words_per_module: default_min_words(),
            context_excerpt_modules: default_context_modules(),
            context_excerpt_chars: default_context_chars(),
            glossary_source_char_budget: default_glossary_budget(),
            roadmap_min_modules: default_roadmap_min_modules(),
            roadmap_attempts: default_roadmap_attempts(),
            roadmap_retry_delay_ms: default_roadmap_retry_delay_ms(),
            status_throttle_ms: default_status_throttle_ms(),
        }
    }
}

/// 模块生成的项目进度带：完成比例映射到 15%-85%
pub const MODULE_PROGRESS_BAND: (f32, f32) = (15.0, 85.0);

/// 路线图完成后的固定进度值
pub const ROADMAP_PROGRESS: f32 = 10.0;

/// 统计字数（按空白切分）
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// 共享的项目状态（用于任务间通信）
pub type SharedProject = Arc<RwLock<Project>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_thresholds() {
        assert_eq!(GenerationStage::from_progress(0.0), GenerationStage::Analyzing);
        assert_eq!(GenerationStage::from_progress(14.9), GenerationStage::Analyzing);
        assert_eq!(GenerationStage::from_progress(15.0), GenerationStage::Writing);
        assert_eq!(GenerationStage::from_progress(59.9), GenerationStage::Writing);
        assert_eq!(GenerationStage::from_progress(60.0), GenerationStage::Examples);
        assert_eq!(GenerationStage::from_progress(90.0), GenerationStage::Polishing);
        assert_eq!(GenerationStage::from_progress(100.0), GenerationStage::Polishing);
    }

    #[test]
    fn test_upsert_module_replaces_failed_record() {
        let mut project = Project::new("Test", "Learn SQL");
        project.upsert_module(Module::failed("module_1", "Intro", "boom".to_string()));
        assert_eq!(project.failed_count(), 1);

        project.upsert_module(Module::completed("module_1", "Intro", "hello world".to_string()));
        assert_eq!(project.modules.len(), 1);
        assert_eq!(project.failed_count(), 0);
        assert_eq!(project.completed_count(), 1);
        assert_eq!(project.modules[0].word_count, 2);
    }

    #[test]
    fn test_count_words() {
        assert_eq!(count_words(""), 0);
        assert_eq!(count_words("one two  three\nfour"), 4);
    }
}
