//! 断点存储
//!
//! 按项目 ID 持久化生成进度，支持页面刷新/进程重启后继续。
//! 内存 DashMap 作为快速路径，JSON 文件作为持久层；持久层写失败只降级
//! 不中断（牺牲可恢复性换可用性）。

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// 断点数据：一个项目的生成进度记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationCheckpoint {
    /// 项目 ID
    pub project_id: String,
    /// 已完成的路线图条目 ID 集合
    pub completed_module_ids: HashSet<String>,
    /// 当前处于失败态的路线图条目 ID 集合
    pub failed_module_ids: HashSet<String>,
    /// 各条目的已重试次数
    pub retry_counts: HashMap<String, u32>,
    /// 最后一个成功处理的模块下标（-1 表示尚无）
    pub last_successful_index: i32,
    /// 最近一次更新时间
    pub timestamp: DateTime<Utc>,
    /// 全书累计字数
    pub total_words: usize,
}

impl GenerationCheckpoint {
    /// 创建空断点
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            completed_module_ids: HashSet::new(),
            failed_module_ids: HashSet::new(),
            retry_counts: HashMap::new(),
            last_successful_index: -1,
            timestamp: Utc::now(),
            total_words: 0,
        }
    }

    /// 记录一个模块成功
    ///
    /// 不变量：completed 与 failed 集合互斥，成功会清掉失败痕迹和重试计数
    pub fn record_success(&mut self, module_id: &str, index: usize, words: usize) {
        self.failed_module_ids.remove(module_id);
        self.retry_counts.remove(module_id);
        self.completed_module_ids.insert(module_id.to_string());
        self.last_successful_index = index as i32;
        self.total_words += words;
        self.timestamp = Utc::now();
    }

    /// 记录一个模块最终失败
    pub fn record_failure(&mut self, module_id: &str, attempts: u32) {
        self.completed_module_ids.remove(module_id);
        self.failed_module_ids.insert(module_id.to_string());
        self.retry_counts.insert(module_id.to_string(), attempts);
        self.timestamp = Utc::now();
    }

    /// 某条目是否已完成
    pub fn is_completed(&self, module_id: &str) -> bool {
        self.completed_module_ids.contains(module_id)
    }
}

/// 断点存储服务
pub struct CheckpointStore {
    /// 持久化根目录
    root: PathBuf,
    /// 内存快速路径
    memory: DashMap<String, GenerationCheckpoint>,
    /// 暂停标志（独立于断点，轮询必须无阻塞）
    paused: DashMap<String, bool>,
}

impl CheckpointStore {
    /// 创建新的断点存储
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            memory: DashMap::new(),
            paused: DashMap::new(),
        }
    }

    /// 初始化：确保持久化目录存在
    pub async fn initialize(&self) -> Result<(), CheckpointError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| CheckpointError::IoError(self.root.clone(), e))?;
        Ok(())
    }

    fn checkpoint_path(&self, project_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize_id(project_id)))
    }

    fn pause_path(&self, project_id: &str) -> PathBuf {
        self.root.join(format!("{}.pause", sanitize_id(project_id)))
    }

    /// 保存断点：整条记录替换，先内存后磁盘
    ///
    /// 磁盘写失败记 warn 并继续，生成流程不因此中断
    pub async fn save(&self, checkpoint: &GenerationCheckpoint) {
        self.memory
            .insert(checkpoint.project_id.clone(), checkpoint.clone());

        let path = self.checkpoint_path(&checkpoint.project_id);
        match serde_json::to_string_pretty(checkpoint) {
            Ok(content) => {
                if let Err(e) = fs::write(&path, content).await {
                    warn!("Failed to persist checkpoint {}: {}", path.display(), e);
                } else {
                    debug!(
                        "Checkpoint saved: {} ({} completed, {} failed)",
                        checkpoint.project_id,
                        checkpoint.completed_module_ids.len(),
                        checkpoint.failed_module_ids.len()
                    );
                }
            }
            Err(e) => {
                warn!("Failed to serialize checkpoint {}: {}", checkpoint.project_id, e);
            }
        }
    }

    /// 加载断点：内存优先，未命中再读磁盘并回填内存
    pub async fn load(&self, project_id: &str) -> Option<GenerationCheckpoint> {
        if let Some(entry) = self.memory.get(project_id) {
            return Some(entry.clone());
        }

        let path = self.checkpoint_path(project_id);
        if !path.exists() {
            return None;
        }

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read checkpoint {}: {}", path.display(), e);
                return None;
            }
        };

        match serde_json::from_str::<GenerationCheckpoint>(&content) {
            Ok(checkpoint) => {
                info!(
                    "Checkpoint loaded: {} ({} completed, {} failed)",
                    project_id,
                    checkpoint.completed_module_ids.len(),
                    checkpoint.failed_module_ids.len()
                );
                self.memory.insert(project_id.to_string(), checkpoint.clone());
                Some(checkpoint)
            }
            Err(e) => {
                warn!("Failed to parse checkpoint {}: {}", path.display(), e);
                None
            }
        }
    }

    /// 删除断点（整书完成或显式丢弃时）
    pub async fn delete(&self, project_id: &str) {
        self.memory.remove(project_id);

        let path = self.checkpoint_path(project_id);
        if path.exists() {
            if let Err(e) = fs::remove_file(&path).await {
                warn!("Failed to delete checkpoint {}: {}", path.display(), e);
            } else {
                info!("Checkpoint cleared: {}", project_id);
            }
        }
    }

    /// 设置暂停标志（内存立即可见，磁盘标记文件持久化）
    pub async fn set_pause_flag(&self, project_id: &str) {
        self.paused.insert(project_id.to_string(), true);

        let path = self.pause_path(project_id);
        if let Err(e) = fs::write(&path, b"1").await {
            warn!("Failed to persist pause flag {}: {}", path.display(), e);
        }
    }

    /// 清除暂停标志
    pub async fn clear_pause_flag(&self, project_id: &str) {
        self.paused.remove(project_id);

        let path = self.pause_path(project_id);
        if path.exists() {
            if let Err(e) = fs::remove_file(&path).await {
                warn!("Failed to remove pause flag {}: {}", path.display(), e);
            }
        }
    }

    /// 暂停标志查询：仅读内存，可在挂起点之间高频轮询
    pub fn is_paused(&self, project_id: &str) -> bool {
        self.paused
            .get(project_id)
            .map(|entry| *entry.value())
            .unwrap_or(false)
    }

    /// 从磁盘恢复暂停标志（运行恢复入口调用一次）
    pub async fn hydrate_pause_flag(&self, project_id: &str) {
        if self.paused.contains_key(project_id) {
            return;
        }
        if self.pause_path(project_id).exists() {
            self.paused.insert(project_id.to_string(), true);
        }
    }
}

/// 项目 ID 用作文件名前清理路径分隔符
fn sanitize_id(project_id: &str) -> String {
    project_id
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// 断点存储错误类型
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("IO错误 ({0}): {1}")]
    IoError(PathBuf, #[source] std::io::Error),
}

/// 保留给调用方判断根目录默认位置
pub fn default_checkpoint_root(data_dir: &Path) -> PathBuf {
    data_dir.join("checkpoints")
}
