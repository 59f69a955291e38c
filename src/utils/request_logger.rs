//! LLM 请求日志记录器
//!
//! 记录所有出站 LLM 请求到 JSONL 文件，便于调试和用量分析。

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use uuid::Uuid;

/// 请求日志条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// 请求 ID
    pub request_id: String,
    /// 时间戳
    pub timestamp: DateTime<Utc>,
    /// API 格式
    pub api_format: String,
    /// 模型名称
    pub model: String,
    /// API 密钥（脱敏）
    pub api_key_masked: String,
    /// Prompt 字符数
    pub prompt_chars: usize,
    /// 状态: ok / error / aborted
    pub status: String,
    /// 持续时间（毫秒）
    pub duration_ms: u64,
    /// 响应字符数
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_chars: Option<usize>,
    /// 错误信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LogEntry {
    /// 创建一条新记录（ID 和时间戳自动填充）
    pub fn new(api_format: impl Into<String>, model: impl Into<String>, api_key: &str) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            api_format: api_format.into(),
            model: model.into(),
            api_key_masked: mask_api_key(api_key),
            prompt_chars: 0,
            status: "pending".to_string(),
            duration_ms: 0,
            response_chars: None,
            error: None,
        }
    }
}

/// API 密钥脱敏：保留前 4 位
pub fn mask_api_key(api_key: &str) -> String {
    if api_key.chars().count() <= 4 {
        "****".to_string()
    } else {
        let prefix: String = api_key.chars().take(4).collect();
        format!("{}****", prefix)
    }
}

/// 请求日志记录器
pub struct RequestLogger {
    log_path: PathBuf,
    max_entries: usize,
    lock: Mutex<()>,
}

impl RequestLogger {
    /// 创建新的日志记录器
    pub fn new(log_path: impl Into<PathBuf>, max_entries: usize) -> Self {
        Self {
            log_path: log_path.into(),
            max_entries,
            lock: Mutex::new(()),
        }
    }

    /// 追加一条日志
    ///
    /// 日志失败只静默忽略，不影响生成流程
    pub fn log(&self, entry: &LogEntry) {
        let _guard = self.lock.lock();

        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(_) => return,
        };

        if let Some(parent) = self.log_path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&self.log_path) {
            let _ = writeln!(file, "{}", line);
        }

        self.trim_if_needed();
    }

    /// 超出上限时只保留最近一半条目
    fn trim_if_needed(&self) {
        let Ok(content) = fs::read_to_string(&self.log_path) else {
            return;
        };
        let lines: Vec<&str> = content.lines().collect();
        if lines.len() <= self.max_entries {
            return;
        }

        let keep = &lines[lines.len() - self.max_entries / 2..];
        let _ = fs::write(&self.log_path, format!("{}\n", keep.join("\n")));
    }

    /// 读取最近 N 条日志
    pub fn recent(&self, count: usize) -> Vec<LogEntry> {
        let _guard = self.lock.lock();

        let Ok(content) = fs::read_to_string(&self.log_path) else {
            return Vec::new();
        };

        let lines: Vec<&str> = content.lines().collect();
        lines
            .iter()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mask_api_key() {
        assert_eq!(mask_api_key("sk-1234567890"), "sk-1****");
        assert_eq!(mask_api_key("ab"), "****");
        assert_eq!(mask_api_key(""), "****");
    }

    #[test]
    fn test_log_and_recent() {
        let dir = TempDir::new().unwrap();
        let logger = RequestLogger::new(dir.path().join("llm.jsonl"), 100);

        let mut entry = LogEntry::new("openai", "gpt-4o", "sk-abcdef");
        entry.status = "ok".to_string();
        entry.duration_ms = 1200;
        logger.log(&entry);

        let recent = logger.recent(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].model, "gpt-4o");
        assert_eq!(recent[0].api_key_masked, "sk-a****");
    }

    #[test]
    fn test_trim_keeps_recent_half() {
        let dir = TempDir::new().unwrap();
        let logger = RequestLogger::new(dir.path().join("llm.jsonl"), 10);

        for i in 0..25 {
            let mut entry = LogEntry::new("openai", format!("model-{}", i), "sk-abcdef");
            entry.status = "ok".to_string();
            logger.log(&entry);
        }

        let recent = logger.recent(100);
        assert!(recent.len() <= 10);
    }
}
