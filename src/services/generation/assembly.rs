//! 汇编阶段
//!
//! 前言、总结、词汇表三路并发生成，全部成功后与各章节正文拼接为
//! 最终成书文本。任何一路失败即整体失败，不产出部分结果。

use chrono::Local;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::prompts;
use super::types::{GenerationConfig, Module, ModuleStatus, Project, Roadmap, Session};
use crate::llm::{ChatOptions, LlmError, TextGenerator};

/// 汇编阶段错误
#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error("LLM 调用失败: {0}")]
    Llm(#[from] LlmError),

    #[error("汇编前置条件不满足: {0}")]
    NotReady(String),
}

/// 执行汇编，返回最终成书文本
pub async fn assemble(
    provider: &dyn TextGenerator,
    project: &Project,
    session: &Session,
    config: &GenerationConfig,
    options: &ChatOptions,
    cancel: &CancellationToken,
) -> Result<String, AssemblyError> {
    let roadmap = project
        .roadmap
        .as_ref()
        .ok_or_else(|| AssemblyError::NotReady("项目尚无路线图".to_string()))?;

    let completed: Vec<&Module> = ordered_completed_modules(project, roadmap);
    if completed.is_empty() {
        return Err(AssemblyError::NotReady("没有任何已完成的章节".to_string()));
    }

    let module_titles = roadmap
        .modules
        .iter()
        .map(|m| format!("{}. {}", m.order, m.title))
        .collect::<Vec<_>>()
        .join("\n");

    // 词汇表的上下文受字符预算约束，防止 Prompt 失控
    let glossary_source = truncate_chars(
        &completed
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"),
        config.glossary_source_char_budget,
    );

    info!(
        "Assembling book {}: {} completed modules, glossary source {} chars",
        project.id,
        completed.len(),
        glossary_source.chars().count()
    );

    let intro_prompt =
        prompts::format_introduction_prompt(&project.title, &project.goal, session, &module_titles);
    let summary_prompt = prompts::format_summary_prompt(&project.title, &module_titles);
    let glossary_prompt = prompts::format_glossary_prompt(&glossary_source);

    // 三路调用互不依赖，并发执行；任何一路失败即整体失败
    let mut intro_sink = |_: &str| {};
    let mut summary_sink = |_: &str| {};
    let mut glossary_sink = |_: &str| {};

    let (introduction, summary, glossary) = tokio::try_join!(
        provider.generate(&intro_prompt, options, cancel, &mut intro_sink),
        provider.generate(&summary_prompt, options, cancel, &mut summary_sink),
        provider.generate(&glossary_prompt, options, cancel, &mut glossary_sink),
    )?;

    Ok(build_final_book(project, roadmap, &completed, &introduction, &summary, &glossary))
}

/// 按路线图顺序收集已完成的模块
fn ordered_completed_modules<'a>(project: &'a Project, roadmap: &Roadmap) -> Vec<&'a Module> {
    roadmap
        .modules
        .iter()
        .filter_map(|rm| project.module_for(&rm.id))
        .filter(|m| m.status == ModuleStatus::Completed)
        .collect()
}

/// 拼接最终文本：元信息头、目录、前言、各章、总结、词汇表
fn build_final_book(
    project: &Project,
    roadmap: &Roadmap,
    completed: &[&Module],
    introduction: &str,
    summary: &str,
    glossary: &str,
) -> String {
    let mut book = String::new();

    book.push_str(&format!("# {}\n\n", project.title));
    book.push_str(&format!("> 学习目标：{}\n>\n", project.goal));
    book.push_str(&format!("> 难度：{} · 预计学习时长：{}\n>\n", roadmap.difficulty, roadmap.estimated_total_time));
    book.push_str(&format!("> 生成时间：{}\n\n", Local::now().format("%Y-%m-%d %H:%M")));

    book.push_str("## 目录\n\n");
    for module in completed {
        book.push_str(&format!("- [{}](#{})\n", module.title, slugify(&module.title)));
    }
    book.push('\n');

    book.push_str("## 前言\n\n");
    book.push_str(introduction.trim());
    book.push_str("\n\n");

    for module in completed {
        book.push_str(&format!("## {}\n\n", module.title));
        book.push_str(module.content.trim());
        book.push_str("\n\n");
    }

    book.push_str("## 全书总结\n\n");
    book.push_str(summary.trim());
    book.push_str("\n\n");

    book.push_str("## 词汇表\n\n");
    book.push_str(glossary.trim());
    book.push('\n');

    book
}

/// 标题转锚点：小写、非字母数字折叠为连字符
fn slugify(title: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;

    for c in title.to_lowercase().chars() {
        if c.is_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }

    slug.trim_end_matches('-').to_string()
}

/// 按字符数截断（保持 UTF-8 边界）
fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("SQL Basics"), "sql-basics");
        assert_eq!(slugify("What is a JOIN?"), "what-is-a-join");
        assert_eq!(slugify("  多个   空格  "), "多个-空格");
        assert_eq!(slugify("Rust & WebAssembly!"), "rust-webassembly");
    }

    #[test]
    fn test_truncate_chars_respects_utf8() {
        let text = "一二三四五";
        assert_eq!(truncate_chars(text, 3), "一二三");
        assert_eq!(truncate_chars(text, 10), text);
    }

    #[test]
    fn test_build_final_book_ordering() {
        let mut project = Project::new("SQL 入门", "Learn SQL");
        let roadmap = Roadmap {
            modules: vec![
                crate::services::generation::types::RoadmapModule {
                    id: "module_1".to_string(),
                    title: "基础".to_string(),
                    objectives: vec![],
                    estimated_time: "1小时".to_string(),
                    order: 1,
                },
                crate::services::generation::types::RoadmapModule {
                    id: "module_2".to_string(),
                    title: "进阶".to_string(),
                    objectives: vec![],
                    estimated_time: "1小时".to_string(),
                    order: 2,
                },
            ],
            total_modules: 2,
            estimated_total_time: "2小时".to_string(),
            difficulty: "beginner".to_string(),
        };

        // 故意乱序插入，拼接必须按路线图顺序输出
        project.upsert_module(Module::completed("module_2", "进阶", "beta-content".to_string()));
        project.upsert_module(Module::completed("module_1", "基础", "alpha-content".to_string()));
        project.roadmap = Some(roadmap.clone());

        let completed = ordered_completed_modules(&project, &roadmap);
        let book = build_final_book(&project, &roadmap, &completed, "前言正文", "总结正文", "- 术语");

        let pos_first = book.find("alpha-content").unwrap();
        let pos_second = book.find("beta-content").unwrap();
        assert!(pos_first < pos_second);
        assert!(book.find("## 前言").unwrap() < pos_first);
        assert!(book.find("## 全书总结").unwrap() > pos_second);
        assert!(book.contains("## 目录"));
        assert!(book.contains("## 词汇表"));
    }
}
