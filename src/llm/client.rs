//! 统一 LLM 客户端
//!
//! 支持 OpenAI 和 Anthropic API 格式，根据模型名称自动选择。
//! 对外提供 `TextGenerator` 接口：一次完整的流式生成，支持外部取消和
//! 增量文本回调。

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use rand::Rng;
use reqwest::Client;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::anthropic::stream_anthropic;
use super::format::ApiFormat;
use super::openai::stream_openai;
use super::types::{ChatChunk, ChatMessage, ChatOptions, LlmError};
use crate::utils::request_logger::{LogEntry, RequestLogger};

/// 适配器内部对 429/503 的重试次数（与上层逐模块重试无关）
const TRANSIENT_HTTP_ATTEMPTS: u32 = 3;
/// 内部重试基础延迟（毫秒）
const TRANSIENT_HTTP_BASE_DELAY_MS: u64 = 1000;

/// 增量文本回调
pub type ChunkHandler<'a> = &'a mut (dyn FnMut(&str) + Send);

/// 文本生成接口
///
/// 约定：返回的完整文本等于按到达顺序拼接所有已通过 `on_chunk` 交付的
/// 增量；返回（无论成功失败）之后不再交付任何增量；`cancel` 触发后必须
/// 立即停止消费字节流并以 `Aborted` 返回。
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        options: &ChatOptions,
        cancel: &CancellationToken,
        on_chunk: ChunkHandler<'_>,
    ) -> Result<String, LlmError>;
}

/// 统一 LLM 客户端
pub struct LlmClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    logger: Option<Arc<RequestLogger>>,
}

impl LlmClient {
    /// 创建新的 LLM 客户端
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, LlmError> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(LlmError::ConfigError("API Key is required".to_string()));
        }

        // 流式响应可能持续数分钟，请求超时要放宽到整个流的生命周期
        let client = Client::builder()
            .timeout(Duration::from_secs(240))
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(5)
            .build()
            .map_err(LlmError::HttpError)?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.into(),
            model: model.into(),
            logger: None,
        })
    }

    /// 挂上请求日志记录器
    pub fn with_logger(mut self, logger: Arc<RequestLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// 当前模型名称
    pub fn model(&self) -> &str {
        &self.model
    }

    /// 流式聊天（自动检测 API 格式）
    pub fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        options: ChatOptions,
    ) -> Pin<Box<dyn Stream<Item = Result<ChatChunk, LlmError>> + Send>> {
        let api_format = ApiFormat::from_model(&self.model);
        info!("LLM request: model={}, api_format={:?}", self.model, api_format);

        match api_format {
            ApiFormat::OpenAi => stream_openai(
                &self.client,
                &self.api_key,
                &self.base_url,
                messages,
                &self.model,
                &options,
            ),
            ApiFormat::Anthropic => stream_anthropic(
                &self.client,
                &self.api_key,
                &self.base_url,
                messages,
                &self.model,
                &options,
            ),
        }
    }

    /// 流式请求并收集完整响应（无取消、无回调的便捷入口）
    pub async fn stream_and_collect(
        &self,
        messages: Vec<ChatMessage>,
        options: ChatOptions,
    ) -> Result<String, LlmError> {
        let mut stream = self.stream_chat(messages, options);
        let mut content = String::new();

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result?;
            if let Some(text) = chunk.content {
                content.push_str(&text);
            }
        }

        Ok(content)
    }

    /// 单次流式生成：消费整个流，逐增量回调，支持取消
    ///
    /// `delivered` 记录已回调的增量数，供外层判断是否还能安全重试
    async fn generate_once(
        &self,
        messages: Vec<ChatMessage>,
        options: ChatOptions,
        cancel: &CancellationToken,
        on_chunk: &mut (dyn FnMut(&str) + Send),
        delivered: &mut usize,
    ) -> Result<String, LlmError> {
        let mut stream = self.stream_chat(messages, options);
        let mut content = String::new();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    // 丢弃流即停止消费字节
                    debug!("LLM stream aborted by caller");
                    return Err(LlmError::Aborted);
                }

                next = stream.next() => {
                    match next {
                        Some(Ok(chunk)) => {
                            if let Some(text) = chunk.content {
                                if !text.is_empty() {
                                    on_chunk(&text);
                                    *delivered += 1;
                                    content.push_str(&text);
                                }
                            }
                        }
                        Some(Err(e)) => return Err(e),
                        None => break,
                    }
                }
            }
        }

        if content.is_empty() {
            return Err(LlmError::EmptyResponse);
        }

        Ok(content)
    }
}

#[async_trait]
impl TextGenerator for LlmClient {
    async fn generate(
        &self,
        prompt: &str,
        options: &ChatOptions,
        cancel: &CancellationToken,
        on_chunk: ChunkHandler<'_>,
    ) -> Result<String, LlmError> {
        let messages = vec![ChatMessage::user(prompt)];
        let started = Instant::now();
        let mut delivered = 0usize;

        let mut attempt = 0u32;
        let result = loop {
            let result = self
                .generate_once(messages.clone(), options.clone(), cancel, on_chunk, &mut delivered)
                .await;

            match result {
                Err(LlmError::ApiError { status, ref message })
                    if (status == 429 || status == 503)
                        && attempt + 1 < TRANSIENT_HTTP_ATTEMPTS
                        // 已向调用方交付过增量时不可重试，否则会重复交付
                        && delivered == 0 =>
                {
                    let base = TRANSIENT_HTTP_BASE_DELAY_MS * 2u64.pow(attempt);
                    let jitter = rand::thread_rng().gen_range(0..500);
                    let delay = Duration::from_millis(base + jitter);
                    warn!(
                        "LLM returned {} ({}), retrying in {:?} (attempt {}/{})",
                        status,
                        message.chars().take(120).collect::<String>(),
                        delay,
                        attempt + 1,
                        TRANSIENT_HTTP_ATTEMPTS
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => break other,
            }
        };

        if let Some(logger) = &self.logger {
            let api_format = ApiFormat::from_model(&self.model);
            let mut entry = LogEntry::new(format!("{:?}", api_format), &self.model, &self.api_key);
            entry.prompt_chars = prompt.chars().count();
            entry.duration_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(text) => {
                    entry.status = "ok".to_string();
                    entry.response_chars = Some(text.chars().count());
                }
                Err(LlmError::Aborted) => {
                    entry.status = "aborted".to_string();
                }
                Err(e) => {
                    entry.status = "error".to_string();
                    entry.error = Some(e.to_string());
                }
            }
            logger.log(&entry);
        }

        result
    }
}
