//! LLM 类型定义

use serde::{Deserialize, Serialize};

/// 聊天消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// 角色：system, user, assistant
    pub role: String,
    /// 消息内容
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// 流式响应块
#[derive(Debug, Clone, Default)]
pub struct ChatChunk {
    /// 文本增量
    pub content: Option<String>,
    /// 完成原因
    pub finish_reason: Option<String>,
}

/// 聊天选项
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// 温度参数
    pub temperature: Option<f64>,
    /// top_p 参数
    pub top_p: Option<f64>,
    /// 最大输出 token 数
    pub max_tokens: Option<u32>,
    /// 响应格式（如 "json_object"）
    pub response_format: Option<String>,
}

/// LLM 错误类型
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// 传输层错误（连接失败、超时等）
    #[error("HTTP 请求失败: {0}")]
    HttpError(#[from] reqwest::Error),

    /// API 返回非 2xx 状态码
    #[error("API 错误 ({status}): {message}")]
    ApiError { status: u16, message: String },

    /// 流正常结束但没有产生任何文本
    #[error("响应为空")]
    EmptyResponse,

    /// 调用方主动中止
    #[error("请求已中止")]
    Aborted,

    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),
}
