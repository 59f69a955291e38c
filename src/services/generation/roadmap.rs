//! 路线图阶段
//!
//! 单次结构化 Prompt 请求整书章节计划，解析并规范化 LLM 返回的 JSON。
//! 解析失败按整体粒度重试固定次数，仍失败则对本次生成致命。

use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::prompts;
use super::types::{GenerationConfig, Roadmap, RoadmapModule, Session};
use crate::llm::{ChatOptions, LlmError, TextGenerator};

/// 路线图阶段错误
#[derive(Debug, thiserror::Error)]
pub enum RoadmapError {
    #[error("LLM 调用失败: {0}")]
    Llm(#[from] LlmError),

    #[error("路线图解析失败: {0}")]
    Parse(String),
}

/// LLM 返回的宽松结构（字段均可缺省，解析后统一规范化）
#[derive(Debug, Deserialize)]
struct RawRoadmap {
    modules: Vec<RawModule>,
    #[serde(default)]
    estimated_total_time: Option<String>,
    #[serde(default)]
    difficulty: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawModule {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    objectives: Option<Vec<String>>,
    #[serde(default)]
    estimated_time: Option<String>,
}

/// 生成路线图（整体重试由此函数负责）
pub async fn generate(
    provider: &dyn TextGenerator,
    session: &Session,
    config: &GenerationConfig,
    options: &ChatOptions,
    cancel: &CancellationToken,
) -> Result<Roadmap, RoadmapError> {
    let prompt = prompts::format_roadmap_prompt(session, config.roadmap_min_modules);

    let mut last_error: Option<RoadmapError> = None;
    for attempt in 1..=config.roadmap_attempts {
        // 路线图不需要增量回调，整段文本一次拿全
        let mut sink = |_: &str| {};
        let result = provider.generate(&prompt, options, cancel, &mut sink).await;

        match result {
            Ok(text) => match parse_roadmap(&text, session) {
                Ok(roadmap) => {
                    info!(
                        "Roadmap generated: {} modules, difficulty={}",
                        roadmap.total_modules, roadmap.difficulty
                    );
                    return Ok(roadmap);
                }
                Err(e) => {
                    warn!("Roadmap parse failed (attempt {}/{}): {}", attempt, config.roadmap_attempts, e);
                    last_error = Some(e);
                }
            },
            Err(LlmError::Aborted) => return Err(RoadmapError::Llm(LlmError::Aborted)),
            Err(e) => {
                warn!("Roadmap call failed (attempt {}/{}): {}", attempt, config.roadmap_attempts, e);
                last_error = Some(RoadmapError::Llm(e));
            }
        }

        if attempt < config.roadmap_attempts {
            tokio::time::sleep(Duration::from_millis(config.roadmap_retry_delay_ms)).await;
        }
    }

    Err(last_error.unwrap_or_else(|| RoadmapError::Parse("no attempts made".to_string())))
}

/// 解析并规范化路线图响应
pub fn parse_roadmap(text: &str, session: &Session) -> Result<Roadmap, RoadmapError> {
    let stripped = strip_code_fences(text);
    let json = extract_first_json_object(&stripped)
        .ok_or_else(|| RoadmapError::Parse("响应中未找到 JSON 对象".to_string()))?;

    let raw: RawRoadmap =
        serde_json::from_str(&json).map_err(|e| RoadmapError::Parse(e.to_string()))?;

    if raw.modules.is_empty() {
        return Err(RoadmapError::Parse("modules 数组为空".to_string()));
    }

    let modules: Vec<RoadmapModule> = raw
        .modules
        .into_iter()
        .enumerate()
        .map(|(index, m)| RoadmapModule {
            id: format!("module_{}", index + 1),
            title: m
                .title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| format!("第{}章", index + 1)),
            objectives: m
                .objectives
                .filter(|o| !o.is_empty())
                .unwrap_or_else(|| vec!["掌握本章核心内容".to_string()]),
            estimated_time: m.estimated_time.unwrap_or_else(|| "2小时".to_string()),
            order: (index + 1) as u32,
        })
        .collect();

    let total_modules = modules.len();

    Ok(Roadmap {
        modules,
        total_modules,
        estimated_total_time: raw
            .estimated_total_time
            .unwrap_or_else(|| format!("{}小时", total_modules * 2)),
        difficulty: raw
            .difficulty
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| session.complexity_level.as_str().to_string()),
    })
}

/// 去掉 Markdown 代码围栏行
fn strip_code_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// 提取第一个配平的 `{...}` 块（感知字符串字面量和转义）
fn extract_first_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + c.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::generation::types::ComplexityLevel;

    fn session() -> Session {
        Session {
            goal: "Learn SQL".to_string(),
            target_audience: String::new(),
            complexity_level: ComplexityLevel::Beginner,
            preferences: Default::default(),
        }
    }

    #[test]
    fn test_parse_fenced_json() {
        let text = r#"好的，以下是路线图：
```json
{"modules": [{"title": "A", "objectives": ["x"], "estimated_time": "1小时"},
             {"title": "B"}],
 "difficulty": "beginner"}
```
希望对你有帮助！"#;

        let roadmap = parse_roadmap(text, &session()).unwrap();
        assert_eq!(roadmap.total_modules, 2);
        assert_eq!(roadmap.modules[0].id, "module_1");
        assert_eq!(roadmap.modules[0].order, 1);
        assert_eq!(roadmap.modules[1].id, "module_2");
        // 缺省字段规范化
        assert_eq!(roadmap.modules[1].title, "B");
        assert!(!roadmap.modules[1].objectives.is_empty());
        assert_eq!(roadmap.modules[1].estimated_time, "2小时");
        assert_eq!(roadmap.difficulty, "beginner");
    }

    #[test]
    fn test_parse_falls_back_to_session_difficulty() {
        let text = r#"{"modules": [{"title": "A"}]}"#;
        let roadmap = parse_roadmap(text, &session()).unwrap();
        assert_eq!(roadmap.difficulty, "beginner");
        assert!(!roadmap.estimated_total_time.is_empty());
    }

    #[test]
    fn test_parse_rejects_missing_modules() {
        let text = r#"{"difficulty": "easy"}"#;
        assert!(parse_roadmap(text, &session()).is_err());

        let text = r#"{"modules": []}"#;
        assert!(parse_roadmap(text, &session()).is_err());
    }

    #[test]
    fn test_extract_balanced_object() {
        let text = r#"前缀 {"a": {"b": "嵌套 } 字符串"}} 后缀 {"c": 1}"#;
        let json = extract_first_json_object(text).unwrap();
        assert_eq!(json, r#"{"a": {"b": "嵌套 } 字符串"}}"#);
    }

    #[test]
    fn test_extract_handles_escapes() {
        let text = r#"{"a": "引号 \" 和反斜杠 \\"}"#;
        let json = extract_first_json_object(text).unwrap();
        assert!(serde_json::from_str::<serde_json::Value>(&json).is_ok());
    }

    #[test]
    fn test_extract_none_without_object() {
        assert!(extract_first_json_object("没有对象").is_none());
        assert!(extract_first_json_object("{未闭合").is_none());
    }
}
