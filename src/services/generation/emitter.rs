//! 状态发射器
//!
//! 把编排器内部的状态变迁转成带类型的消息流，按项目广播给订阅方
//! （WebSocket 层）。无订阅者时发送失败是正常情况，不视为错误。

use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use super::types::{Project, WsGenMessage};

/// 单个项目的进度消息发射器
#[derive(Clone)]
pub struct StatusEmitter {
    project_id: String,
    tx: broadcast::Sender<WsGenMessage>,
}

impl StatusEmitter {
    pub fn new(project_id: impl Into<String>, tx: broadcast::Sender<WsGenMessage>) -> Self {
        Self {
            project_id: project_id.into(),
            tx,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// 发送一条消息
    pub fn emit(&self, message: WsGenMessage) {
        let _ = self.tx.send(message);
    }

    /// 从项目快照发送一条项目级变更
    pub fn project_update(&self, project: &Project) {
        self.emit(WsGenMessage::ProjectUpdate {
            status: project.status,
            progress: project.progress,
            error: project.error.clone(),
        });
    }
}

/// 发送节流：细粒度快照最多每个间隔发一条
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            last: None,
        }
    }

    /// 是否到了可以再发的时间（首次调用总是放行）
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
