//! 错误分类与退避策略
//!
//! 无状态的纯函数集合，模块循环和路线图阶段共用

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::llm::LlmError;

/// 重试参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 单模块最大尝试次数
    #[serde(default = "default_max_attempts")]
    pub max_module_attempts: u32,

    /// 普通重试基础延迟（毫秒）
    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,

    /// 重试延迟上限（毫秒）
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    /// 限流重试基础延迟（毫秒）
    #[serde(default = "default_base_rate_limit_delay_ms")]
    pub base_rate_limit_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_retry_delay_ms() -> u64 {
    3000
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

fn default_base_rate_limit_delay_ms() -> u64 {
    5000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_module_attempts: default_max_attempts(),
            base_retry_delay_ms: default_base_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            base_rate_limit_delay_ms: default_base_rate_limit_delay_ms(),
        }
    }
}

/// 错误分类结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorClass {
    /// 限流/配额（HTTP 429/503 或限流词汇）
    pub rate_limited: bool,
    /// 连接层故障
    pub network: bool,
    /// 瞬时可重试故障（超时、过载、网关错误等）
    pub transient: bool,
}

impl ErrorClass {
    /// 是否值得重试
    pub fn retryable(&self) -> bool {
        self.rate_limited || self.network || self.transient
    }

    /// 构造一个纯瞬时分类（内容过短等非传输层的可重试失败）
    pub fn transient_only() -> Self {
        Self {
            transient: true,
            ..Default::default()
        }
    }
}

/// 限流/配额词汇
static RATE_LIMIT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)rate.?limit|too many requests|quota|resource.?exhausted").unwrap()
});

/// 连接层故障词汇
static NETWORK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)network|connection|connect|dns|socket|broken pipe|reset by peer").unwrap()
});

/// 瞬时故障词汇
static TRANSIENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)timeout|timed out|overloaded|unavailable|internal (server )?error|bad gateway")
        .unwrap()
});

/// 对一次 LLM 调用失败做分类
pub fn classify(error: &LlmError) -> ErrorClass {
    let mut class = ErrorClass::default();

    match error {
        LlmError::ApiError { status, message } => {
            if *status == 429 || *status == 503 {
                class.rate_limited = true;
            } else if RATE_LIMIT_RE.is_match(message) {
                class.rate_limited = true;
            }
            if TRANSIENT_RE.is_match(message) || (500..600).contains(status) {
                class.transient = true;
            }
        }
        LlmError::HttpError(e) => {
            if e.is_timeout() {
                class.transient = true;
                class.network = true;
            } else if e.is_connect() || e.is_request() {
                class.network = true;
            } else {
                let text = e.to_string();
                class.network = NETWORK_RE.is_match(&text);
                class.transient = TRANSIENT_RE.is_match(&text);
            }
        }
        // 空响应视为瞬时退化，重试通常能恢复
        LlmError::EmptyResponse => {
            class.transient = true;
        }
        // 中止和配置错误都不应进入重试
        LlmError::Aborted | LlmError::ConfigError(_) => {}
    }

    class
}

/// 给定分类与已尝试次数，判断是否继续重试
pub fn should_retry(class: &ErrorClass, attempt: u32, max_attempts: u32) -> bool {
    if attempt >= max_attempts {
        return false;
    }
    class.retryable()
}

/// 计算第 `attempt` 次失败后的退避延迟（attempt 从 1 开始）
pub fn delay_for(policy: &RetryPolicy, attempt: u32, rate_limited: bool) -> Duration {
    let millis = if rate_limited {
        // 限流用更平缓的 1.5 倍增长
        (policy.base_rate_limit_delay_ms as f64 * 1.5f64.powi(attempt as i32)) as u64
    } else {
        let base = policy.base_retry_delay_ms * 2u64.pow(attempt.saturating_sub(1));
        let jitter = rand::thread_rng().gen_range(0..1000);
        base + jitter
    };

    Duration::from_millis(millis.min(policy.max_retry_delay_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit_status() {
        let err = LlmError::ApiError {
            status: 429,
            message: "Too Many Requests".to_string(),
        };
        let class = classify(&err);
        assert!(class.rate_limited);
        assert!(class.retryable());

        let err = LlmError::ApiError {
            status: 503,
            message: String::new(),
        };
        assert!(classify(&err).rate_limited);
    }

    #[test]
    fn test_classify_rate_limit_vocabulary() {
        let err = LlmError::ApiError {
            status: 400,
            message: "You have exceeded your quota".to_string(),
        };
        assert!(classify(&err).rate_limited);
    }

    #[test]
    fn test_classify_transient() {
        let err = LlmError::ApiError {
            status: 502,
            message: "bad gateway".to_string(),
        };
        let class = classify(&err);
        assert!(class.transient);
        assert!(!class.rate_limited);
    }

    #[test]
    fn test_classify_fatal() {
        let err = LlmError::ApiError {
            status: 401,
            message: "invalid api key".to_string(),
        };
        let class = classify(&err);
        assert!(!class.retryable());

        assert!(!classify(&LlmError::Aborted).retryable());
        assert!(!classify(&LlmError::ConfigError("no key".to_string())).retryable());
    }

    #[test]
    fn test_classify_empty_response() {
        assert!(classify(&LlmError::EmptyResponse).transient);
    }

    #[test]
    fn test_should_retry_bound() {
        let class = ErrorClass::transient_only();
        assert!(should_retry(&class, 1, 5));
        assert!(should_retry(&class, 4, 5));
        assert!(!should_retry(&class, 5, 5));
        assert!(!should_retry(&class, 6, 5));
    }

    #[test]
    fn test_delay_growth_and_clamp() {
        let policy = RetryPolicy::default();

        let d1 = delay_for(&policy, 1, false);
        assert!(d1 >= Duration::from_millis(3000));
        assert!(d1 < Duration::from_millis(4100));

        let d2 = delay_for(&policy, 2, false);
        assert!(d2 >= Duration::from_millis(6000));

        // 足够多次之后命中上限
        let d_many = delay_for(&policy, 10, false);
        assert_eq!(d_many, Duration::from_millis(30_000));

        // 限流路径：5000 * 1.5^2 = 11250
        let d_rl = delay_for(&policy, 2, true);
        assert_eq!(d_rl, Duration::from_millis(11_250));
    }
}
