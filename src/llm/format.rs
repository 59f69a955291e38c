//! API 格式检测和端点构建工具

use serde::{Deserialize, Serialize};

/// API 格式枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiFormat {
    /// OpenAI Chat Completions API
    OpenAi,
    /// Anthropic Messages API
    Anthropic,
}

impl ApiFormat {
    /// 根据模型名称检测 API 格式
    ///
    /// 规则：模型名包含 "claude" 则使用 Anthropic 格式，否则使用 OpenAI 格式
    pub fn from_model(model: &str) -> Self {
        if model.to_lowercase().contains("claude") {
            ApiFormat::Anthropic
        } else {
            ApiFormat::OpenAi
        }
    }

    /// 构建完整的请求端点
    ///
    /// base_url 可以带或不带 `/v1` 后缀，也可以直接是完整端点
    pub fn endpoint(&self, base_url: &str) -> String {
        let url = fix_base_url(base_url);
        let suffix = match self {
            ApiFormat::OpenAi => "/chat/completions",
            ApiFormat::Anthropic => "/messages",
        };

        if url.ends_with(suffix) {
            url
        } else if url.ends_with("/v1") {
            format!("{}{}", url, suffix)
        } else {
            format!("{}/v1{}", url, suffix)
        }
    }
}

/// 修复 base_url：移除末尾斜杠，修复双斜杠（保留协议部分）
fn fix_base_url(base_url: &str) -> String {
    let mut url = base_url.trim_end_matches('/').to_string();

    if let Some(pos) = url.find("://") {
        let (protocol, rest) = url.split_at(pos + 3);
        let fixed_rest = rest.replace("//", "/");
        url = format!("{}{}", protocol, fixed_rest);
    }

    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_model() {
        assert_eq!(ApiFormat::from_model("gpt-4o"), ApiFormat::OpenAi);
        assert_eq!(ApiFormat::from_model("deepseek-chat"), ApiFormat::OpenAi);
        assert_eq!(ApiFormat::from_model("claude-3-opus"), ApiFormat::Anthropic);
        assert_eq!(ApiFormat::from_model("Claude-Sonnet-4"), ApiFormat::Anthropic);
    }

    #[test]
    fn test_fix_base_url() {
        assert_eq!(fix_base_url("https://api.openai.com/"), "https://api.openai.com");
        assert_eq!(fix_base_url("https://api.openai.com//v1"), "https://api.openai.com/v1");
    }

    #[test]
    fn test_openai_endpoint() {
        assert_eq!(
            ApiFormat::OpenAi.endpoint("https://api.openai.com"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            ApiFormat::OpenAi.endpoint("https://api.openai.com/v1"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            ApiFormat::OpenAi.endpoint("https://api.openai.com/v1/chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_anthropic_endpoint() {
        assert_eq!(
            ApiFormat::Anthropic.endpoint("https://api.anthropic.com"),
            "https://api.anthropic.com/v1/messages"
        );
        assert_eq!(
            ApiFormat::Anthropic.endpoint("https://api.anthropic.com/v1"),
            "https://api.anthropic.com/v1/messages"
        );
    }
}
