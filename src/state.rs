//! 应用状态管理
//!
//! 定义在请求处理器之间共享的状态。

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::services::generation::{
    CheckpointStore, GenerationStatus, Orchestrator, Session, SharedProject, WsGenMessage,
};

/// 一次图书生成任务的状态：项目快照、进度通道和重放信息
pub struct BookTaskState {
    /// 共享项目记录
    pub project: SharedProject,
    /// 生成会话（重试/恢复时复用）
    pub session: Session,
    /// 驱动本任务的编排器（暂停/取消要打到同一个实例）
    pub orchestrator: Arc<Orchestrator>,
    /// WebSocket 广播通道
    pub tx: broadcast::Sender<WsGenMessage>,
    /// 最近一次细粒度状态快照，WebSocket 连接时重放
    last_status: RwLock<Option<GenerationStatus>>,
}

impl BookTaskState {
    pub fn new(
        project: SharedProject,
        session: Session,
        orchestrator: Arc<Orchestrator>,
        tx: broadcast::Sender<WsGenMessage>,
    ) -> Self {
        Self {
            project,
            session,
            orchestrator,
            tx,
            last_status: RwLock::new(None),
        }
    }

    /// 记录最近一次状态快照
    pub fn set_last_status(&self, status: GenerationStatus) {
        *self.last_status.write() = Some(status);
    }

    /// 读取最近一次状态快照
    pub fn last_status(&self) -> Option<GenerationStatus> {
        self.last_status.read().clone()
    }
}

/// 图书生成任务注册表（按项目 ID）
pub type BookTaskRegistry = DashMap<String, Arc<BookTaskState>>;

/// 应用共享状态
///
/// 使用 Arc 包裹以便在多个处理器之间安全共享
#[derive(Clone)]
pub struct AppState {
    /// 图书生成任务注册表
    pub tasks: Arc<BookTaskRegistry>,
    /// 断点存储（跨任务共享，按项目 ID 分键）
    pub checkpoints: Arc<CheckpointStore>,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(checkpoints: Arc<CheckpointStore>) -> Self {
        Self {
            tasks: Arc::new(DashMap::new()),
            checkpoints,
        }
    }
}

/// 创建可共享的应用状态
pub fn create_shared_state(checkpoints: Arc<CheckpointStore>) -> Arc<AppState> {
    Arc::new(AppState::new(checkpoints))
}
