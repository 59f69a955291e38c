//! LLM Prompt 模板
//!
//! 定义路线图、章节内容、前言/总结/词汇表等 Prompt 模板

use super::types::{RoadmapModule, Session};

/// 路线图生成 Prompt
pub const ROADMAP_PROMPT: &str = r#"你是一位资深的课程设计专家。请为以下学习目标设计一本书的完整章节路线图。

学习目标: {goal}
目标读者: {audience}
难度等级: {complexity}

要求：
1. 至少 {min_modules} 个章节，按学习顺序排列
2. 每个章节提供标题、3-5 条学习目标、预计学习时长
3. 章节之间循序渐进，后面的章节可以依赖前面的内容

请严格按以下 JSON 格式输出，不要输出任何其他内容：

{{
  "modules": [
    {{
      "title": "章节标题",
      "objectives": ["目标1", "目标2", "目标3"],
      "estimated_time": "2小时"
    }}
  ],
  "estimated_total_time": "20小时",
  "difficulty": "{complexity}"
}}
"#;

/// 章节内容生成 Prompt
pub const MODULE_CONTENT_PROMPT: &str = r#"你是一位经验丰富的技术书籍作者。请撰写下面这一章的完整内容。

本书学习目标: {goal}
目标读者: {audience}
难度等级: {complexity}

章节标题: {title}
本章学习目标:
{objectives}
{context_section}
写作要求：
1. 目标篇幅约 {target_words} 词，内容完整、自成一体
2. 由浅入深，概念先行，循序展开
3. 使用 Markdown 格式，合理使用小标题和列表
{preference_fragments}
直接输出章节正文，不要重复章节标题之外的元信息。
"#;

/// 上下文摘录片段（嵌入章节 Prompt）
pub const CONTEXT_SECTION_TEMPLATE: &str = r#"
已完成章节的内容摘录（保持衔接和术语一致，不要重复讲解）：
{excerpts}
"#;

/// 前言生成 Prompt
pub const INTRODUCTION_PROMPT: &str = r#"请为一本书撰写前言。

书名: {title}
学习目标: {goal}
目标读者: {audience}
章节列表:
{module_titles}

要求：800-1200 词，介绍这本书解决什么问题、适合谁读、如何使用，
语气亲切专业。使用 Markdown 格式，直接输出正文。
"#;

/// 全书总结 Prompt
pub const SUMMARY_PROMPT: &str = r#"请为一本书撰写全书总结。

书名: {title}
章节列表:
{module_titles}

要求：600-900 词，回顾全书脉络，给出进一步学习的建议。
使用 Markdown 格式，直接输出正文。
"#;

/// 词汇表提取 Prompt
pub const GLOSSARY_PROMPT: &str = r#"请从以下书籍内容中提取核心术语，生成词汇表。

书籍内容（节选）:
{content}

要求：
1. 提取 20-30 个最重要的术语
2. 每个术语给出一句简明定义
3. 按字母/拼音顺序排列
4. 输出 Markdown 列表，格式：`- **术语**：定义`

直接输出词汇表，不要其他内容。
"#;

/// 构建路线图 Prompt
pub fn format_roadmap_prompt(session: &Session, min_modules: usize) -> String {
    ROADMAP_PROMPT
        .replace("{goal}", &session.goal)
        .replace("{audience}", audience_or_default(session))
        .replace("{complexity}", session.complexity_level.as_str())
        .replace("{min_modules}", &min_modules.to_string())
}

/// 构建章节内容 Prompt
///
/// `context_excerpt` 为空时（第一章）完全省略上下文段落
pub fn format_module_prompt(
    session: &Session,
    module: &RoadmapModule,
    context_excerpt: &str,
    target_words: usize,
) -> String {
    let objectives = module
        .objectives
        .iter()
        .map(|o| format!("- {}", o))
        .collect::<Vec<_>>()
        .join("\n");

    let context_section = if context_excerpt.is_empty() {
        String::new()
    } else {
        CONTEXT_SECTION_TEMPLATE.replace("{excerpts}", context_excerpt)
    };

    let mut fragments = Vec::new();
    if session.preferences.include_examples {
        fragments.push("4. 为关键概念提供可运行的代码示例或具体实例".to_string());
    }
    if session.preferences.include_exercises {
        fragments.push(format!(
            "{}. 章节末尾附 2-3 道动手练习",
            4 + usize::from(session.preferences.include_examples)
        ));
    }
    if session.preferences.include_quizzes {
        let n = 4
            + usize::from(session.preferences.include_examples)
            + usize::from(session.preferences.include_exercises);
        fragments.push(format!("{}. 章节末尾附 3-5 道自测题（含答案）", n));
    }
    let preference_fragments = if fragments.is_empty() {
        String::new()
    } else {
        format!("{}\n", fragments.join("\n"))
    };

    MODULE_CONTENT_PROMPT
        .replace("{goal}", &session.goal)
        .replace("{audience}", audience_or_default(session))
        .replace("{complexity}", session.complexity_level.as_str())
        .replace("{title}", &module.title)
        .replace("{objectives}", &objectives)
        .replace("{context_section}", &context_section)
        .replace("{target_words}", &target_words.to_string())
        .replace("{preference_fragments}", &preference_fragments)
}

/// 构建前言 Prompt
pub fn format_introduction_prompt(
    book_title: &str,
    goal: &str,
    session: &Session,
    module_titles: &str,
) -> String {
    INTRODUCTION_PROMPT
        .replace("{title}", book_title)
        .replace("{goal}", goal)
        .replace("{audience}", audience_or_default(session))
        .replace("{module_titles}", module_titles)
}

/// 构建总结 Prompt
pub fn format_summary_prompt(book_title: &str, module_titles: &str) -> String {
    SUMMARY_PROMPT
        .replace("{title}", book_title)
        .replace("{module_titles}", module_titles)
}

/// 构建词汇表 Prompt
pub fn format_glossary_prompt(truncated_content: &str) -> String {
    GLOSSARY_PROMPT.replace("{content}", truncated_content)
}

fn audience_or_default(session: &Session) -> &str {
    if session.target_audience.is_empty() {
        "通用读者"
    } else {
        &session.target_audience
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::generation::types::{ComplexityLevel, ContentPreferences};

    fn test_session() -> Session {
        Session {
            goal: "Learn SQL".to_string(),
            target_audience: String::new(),
            complexity_level: ComplexityLevel::Beginner,
            preferences: ContentPreferences::default(),
        }
    }

    fn test_module() -> RoadmapModule {
        RoadmapModule {
            id: "module_1".to_string(),
            title: "SQL 基础".to_string(),
            objectives: vec!["了解表结构".to_string(), "掌握 SELECT".to_string()],
            estimated_time: "2小时".to_string(),
            order: 1,
        }
    }

    #[test]
    fn test_roadmap_prompt_substitution() {
        let prompt = format_roadmap_prompt(&test_session(), 8);
        assert!(prompt.contains("Learn SQL"));
        assert!(prompt.contains("beginner"));
        assert!(prompt.contains("至少 8 个章节"));
        assert!(!prompt.contains("{goal}"));
    }

    #[test]
    fn test_module_prompt_omits_context_for_first_module() {
        let prompt = format_module_prompt(&test_session(), &test_module(), "", 3000);
        assert!(!prompt.contains("已完成章节的内容摘录"));
        assert!(prompt.contains("SQL 基础"));
        assert!(prompt.contains("- 了解表结构"));
    }

    #[test]
    fn test_module_prompt_includes_context_and_preferences() {
        let prompt = format_module_prompt(&test_session(), &test_module(), "### 第一章\n...", 3000);
        assert!(prompt.contains("已完成章节的内容摘录"));
        // 默认偏好：示例 + 练习，无测验
        assert!(prompt.contains("代码示例"));
        assert!(prompt.contains("动手练习"));
        assert!(!prompt.contains("自测题"));
    }
}
