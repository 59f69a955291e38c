//! Anthropic Messages API 流式实现

use async_stream::try_stream;
use futures::Stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tracing::{debug, error};

use super::format::ApiFormat;
use super::types::{ChatChunk, ChatMessage, ChatOptions, LlmError};

/// Anthropic 请求载荷
#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

/// Anthropic SSE 事件
#[derive(Deserialize, Debug)]
struct AnthropicEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    delta: Option<AnthropicDelta>,
    #[serde(default)]
    error: Option<AnthropicError>,
}

#[derive(Deserialize, Debug)]
struct AnthropicDelta {
    #[serde(rename = "type")]
    delta_type: Option<String>,
    text: Option<String>,
    stop_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct AnthropicError {
    message: Option<String>,
}

/// 流式调用 Anthropic API
pub fn stream_anthropic(
    client: &Client,
    api_key: &str,
    base_url: &str,
    messages: Vec<ChatMessage>,
    model: &str,
    options: &ChatOptions,
) -> Pin<Box<dyn Stream<Item = Result<ChatChunk, LlmError>> + Send>> {
    let endpoint = ApiFormat::Anthropic.endpoint(base_url);
    let api_key = api_key.to_string();
    let model = model.to_string();
    let options = options.clone();
    let client = client.clone();

    Box::pin(try_stream! {
        // Messages API 的 system 提示是独立字段，从消息列表中分离
        let mut system_content: Option<String> = None;
        let mut anthropic_messages: Vec<AnthropicMessage> = Vec::new();

        for msg in messages {
            if msg.role == "system" {
                system_content = Some(msg.content);
            } else {
                anthropic_messages.push(AnthropicMessage {
                    role: msg.role,
                    content: msg.content,
                });
            }
        }

        let payload = AnthropicRequest {
            model: model.clone(),
            messages: anthropic_messages,
            system: system_content,
            stream: true,
            max_tokens: options.max_tokens.unwrap_or(4096),
            temperature: options.temperature,
        };

        debug!("Anthropic API request: endpoint={}, model={}", endpoint, model);

        let response = client
            .post(&endpoint)
            .header("Content-Type", "application/json")
            .header("x-api-key", &api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&payload)
            .send()
            .await?;

        // 流开始前的非 2xx 状态即请求级错误
        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let error_text = response.text().await.unwrap_or_default();
            error!("Anthropic API error: status={}, body={}", status_code, error_text.chars().take(500).collect::<String>());
            Err(LlmError::ApiError {
                status: status_code,
                message: error_text,
            })?;
            unreachable!();
        }

        // 处理 SSE 流，按行切分
        let mut buffer = String::new();
        let mut stream = response.bytes_stream();

        use futures::StreamExt;
        while let Some(chunk_result) = stream.next().await {
            let bytes = chunk_result?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline_pos) = buffer.find('\n') {
                let line = buffer[..newline_pos].trim().to_string();
                buffer = buffer[newline_pos + 1..].to_string();

                // `event:` 行和空行不携带数据
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };

                let event = match serde_json::from_str::<AnthropicEvent>(data) {
                    Ok(event) => event,
                    Err(e) => {
                        debug!("Failed to parse Anthropic event: {}, data: {}", e, data);
                        continue;
                    }
                };

                match event.event_type.as_str() {
                    "content_block_delta" => {
                        if let Some(delta) = &event.delta {
                            if delta.delta_type.as_deref() == Some("text_delta") {
                                if let Some(text) = &delta.text {
                                    yield ChatChunk {
                                        content: Some(text.clone()),
                                        finish_reason: None,
                                    };
                                }
                            }
                        }
                    }
                    "message_delta" => {
                        if let Some(stop_reason) = event.delta.as_ref().and_then(|d| d.stop_reason.clone()) {
                            yield ChatChunk {
                                content: None,
                                finish_reason: Some(stop_reason),
                            };
                        }
                    }
                    "message_stop" => {
                        yield ChatChunk {
                            content: None,
                            finish_reason: Some("stop".to_string()),
                        };
                        return;
                    }
                    "error" => {
                        let message = event
                            .error
                            .and_then(|e| e.message)
                            .unwrap_or_else(|| "unknown stream error".to_string());
                        Err(LlmError::ApiError { status: 500, message })?;
                    }
                    // ping 等其他事件忽略
                    _ => {}
                }
            }
        }
    })
}
