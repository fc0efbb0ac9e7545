use std::collections::HashSet;
use std::env;
use std::fmt::Write as _;

use anyhow::{Context, Result, anyhow};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{ChatCompletionRequestUserMessage, CreateChatCompletionRequestArgs},
};
use log::{debug, error, info, warn};
use tokio::time::Duration;

use crate::config::{CategorySpec, LlmSettings};
use crate::models::{Article, Category};
use crate::repair::parse_categories;

/// Hard token-budget guard: at most this many articles go into one prompt.
const MAX_PROMPT_ARTICLES: usize = 120;
const LLM_TIMEOUT: Duration = Duration::from_secs(120);

/// Closed set of prompt strategies, selected once at configuration load.
#[derive(Debug, Clone, PartialEq)]
pub enum TopicMode {
    /// One prompt over everything, categories reordered to the configured
    /// taxonomy.
    Broad,
    /// Two sequential prompts: the named feed group first with a guaranteed
    /// item budget, then everything else; merged with URL dedup.
    Focused { group: String },
    /// Operator-supplied prompt text; categories kept in model order.
    Custom { prompt: String },
}

impl TopicMode {
    pub fn resolve(
        name: &str,
        custom_prompt: Option<&str>,
        focus_group: Option<&str>,
    ) -> TopicMode {
        match name {
            "focused" => TopicMode::Focused {
                group: focus_group.unwrap_or("hardware").to_string(),
            },
            "custom" => match custom_prompt {
                Some(p) if !p.trim().is_empty() => TopicMode::Custom {
                    prompt: p.to_string(),
                },
                _ => {
                    warn!("topic_mode=custom but no custom_prompt set, using broad");
                    TopicMode::Broad
                }
            },
            "broad" => TopicMode::Broad,
            other => {
                warn!("Unknown topic_mode '{other}', using broad");
                TopicMode::Broad
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TopicMode::Broad => "broad",
            TopicMode::Focused { .. } => "focused",
            TopicMode::Custom { .. } => "custom",
        }
    }
}

struct Backend {
    client: Client<OpenAIConfig>,
    model: String,
    label: &'static str,
}

/// Primary completion backend plus an optional secondary tried when the
/// primary fails or returns nothing usable. No retries beyond that.
pub struct LlmBackends {
    primary: Backend,
    fallback: Option<Backend>,
}

impl LlmBackends {
    /// API keys come from `LLM_API_KEY` / `LLM_FALLBACK_API_KEY`; a missing
    /// primary key is fatal at the CLI boundary.
    pub fn from_env(llm: &LlmSettings) -> Result<Self> {
        let api_key =
            env::var("LLM_API_KEY").context("LLM_API_KEY environment variable not set")?;
        let mut config = OpenAIConfig::default().with_api_key(api_key);
        if let Some(base) = &llm.api_base {
            config = config.with_api_base(base);
        }
        let primary = Backend {
            client: Client::with_config(config),
            model: llm.model.clone(),
            label: "primary",
        };

        let fallback = match (env::var("LLM_FALLBACK_API_KEY").ok(), &llm.fallback_model) {
            (Some(key), Some(model)) => {
                let mut config = OpenAIConfig::default().with_api_key(key);
                if let Some(base) = &llm.fallback_api_base {
                    config = config.with_api_base(base);
                }
                Some(Backend {
                    client: Client::with_config(config),
                    model: model.clone(),
                    label: "fallback",
                })
            }
            _ => None,
        };

        Ok(LlmBackends { primary, fallback })
    }

    pub async fn complete(&self, prompt: &str) -> Result<String> {
        match complete_one(&self.primary, prompt).await {
            Ok(text) => Ok(text),
            Err(e) => {
                let Some(fallback) = &self.fallback else {
                    return Err(e);
                };
                warn!("Primary backend failed ({e:#}), trying fallback");
                complete_one(fallback, prompt).await
            }
        }
    }
}

async fn complete_one(backend: &Backend, prompt: &str) -> Result<String> {
    let request = CreateChatCompletionRequestArgs::default()
        .model(&backend.model)
        .messages([ChatCompletionRequestUserMessage::from(prompt).into()])
        .max_tokens(4096u32)
        .build()
        .context("Failed to build completion request")?;

    debug!("Calling {} backend ({})", backend.label, backend.model);
    let response = tokio::time::timeout(LLM_TIMEOUT, backend.client.chat().create(request))
        .await
        .map_err(|_| anyhow!("{} backend timed out", backend.label))?
        .with_context(|| format!("{} backend call failed", backend.label))?;

    for choice in response.choices {
        if let Some(content) = choice.message.content {
            if !content.trim().is_empty() {
                return Ok(content);
            }
        }
    }
    anyhow::bail!("{} backend returned no usable text", backend.label)
}

pub struct SummarizeRequest<'a> {
    pub articles: &'a [Article],
    pub max_items: usize,
    pub mode: &'a TopicMode,
    pub taxonomy: &'a [CategorySpec],
    pub time_window: &'a str,
    /// Source names belonging to the focused-mode group; empty outside
    /// focused mode.
    pub focus_sources: HashSet<String>,
    /// Balanced truncation trims the longest category first; sequential
    /// truncation walks categories in order.
    pub balanced: bool,
}

/// Select, translate, summarize, and categorize. Never fails: every backend
/// or parse problem degrades to an empty category list.
pub async fn summarize(backends: &LlmBackends, req: &SummarizeRequest<'_>) -> Vec<Category> {
    let articles = &req.articles[..req.articles.len().min(MAX_PROMPT_ARTICLES)];
    if articles.is_empty() {
        info!("No articles to summarize");
        return Vec::new();
    }

    let mut categories = match req.mode {
        TopicMode::Broad => {
            let prompt = build_prompt(articles, req.max_items, req.taxonomy, req.time_window);
            let cats = run_prompt(backends, &prompt).await;
            reorder_to_taxonomy(cats, req.taxonomy)
        }
        TopicMode::Focused { .. } => summarize_focused(backends, req).await,
        TopicMode::Custom { prompt } => {
            let full = build_custom_prompt(prompt, articles, req.max_items, req.time_window);
            run_prompt(backends, &full).await
        }
    };

    categories = truncate_categories(categories, req.max_items, req.balanced);
    categories.retain(|c| !c.news.is_empty());
    categories
}

/// Two sequential prompts over disjoint subsets. A single prompt could not
/// reliably respect a minimum allocation for the narrow subset when mixed
/// with the much larger general pool, so the subsets get their own calls
/// and their own budgets.
async fn summarize_focused(backends: &LlmBackends, req: &SummarizeRequest<'_>) -> Vec<Category> {
    let (focus, rest): (Vec<Article>, Vec<Article>) = req
        .articles
        .iter()
        .cloned()
        .partition(|a| req.focus_sources.contains(&a.source));

    let focus_budget = (req.max_items / 3).max(3).min(req.max_items);
    let rest_budget = req.max_items.saturating_sub(focus_budget).max(1);

    let mut merged = Vec::new();
    if !focus.is_empty() {
        let subset = &focus[..focus.len().min(MAX_PROMPT_ARTICLES)];
        let prompt = build_prompt(subset, focus_budget, req.taxonomy, req.time_window);
        merged = run_prompt(backends, &prompt).await;
    }
    if !rest.is_empty() {
        let subset = &rest[..rest.len().min(MAX_PROMPT_ARTICLES)];
        let prompt = build_prompt(subset, rest_budget, req.taxonomy, req.time_window);
        let second = run_prompt(backends, &prompt).await;
        merged = merge_categories(merged, second);
    }
    merged
}

async fn run_prompt(backends: &LlmBackends, prompt: &str) -> Vec<Category> {
    let raw = match backends.complete(prompt).await {
        Ok(raw) => raw,
        Err(e) => {
            error!("All LLM backends failed: {e:#}");
            return Vec::new();
        }
    };
    match parse_categories(&raw) {
        Ok(cats) => cats,
        Err(e) => {
            error!("Could not parse LLM response after all repair passes: {e:#}");
            Vec::new()
        }
    }
}

fn build_prompt(
    articles: &[Article],
    max_items: usize,
    taxonomy: &[CategorySpec],
    time_window: &str,
) -> String {
    let mut p = String::new();
    let _ = writeln!(p, "你是一名科技新闻编辑。以下是时间窗口 {time_window} 内抓取的候选文章。");
    let _ = writeln!(p);
    let _ = writeln!(p, "要求：");
    let _ = writeln!(p, "1. 精选最有新闻价值的条目，最多 {max_items} 条");
    let _ = writeln!(p, "2. 去重合并：同一事件的多篇报道合并为一条，保留最权威的来源");
    let _ = writeln!(p, "3. 标题翻译为中文，并为每条写 1-2 句中文摘要");
    let _ = writeln!(p, "4. 可选地为条目附加一个引发思考的问题，放在 comment 字段");
    let _ = writeln!(p, "5. 按以下分类分组（name 和 icon 必须原样使用）：");
    for spec in taxonomy {
        let _ = writeln!(p, "   - {} {}", spec.icon, spec.name);
    }
    let _ = writeln!(p);
    let _ = writeln!(p, "请以 JSON 格式返回，结构如下：");
    let _ = writeln!(
        p,
        r#"{{"categories":[{{"name":"分类名","icon":"图标","news":[{{"title":"标题","summary":"摘要","comment":"思考问题","source":"来源","url":"链接"}}]}}]}}"#
    );
    let _ = writeln!(p, "只返回 JSON，不要其他文字。");
    let _ = writeln!(p);
    let _ = writeln!(p, "候选文章：");
    push_articles(&mut p, articles);
    p
}

fn build_custom_prompt(
    custom: &str,
    articles: &[Article],
    max_items: usize,
    time_window: &str,
) -> String {
    let mut p = String::new();
    let _ = writeln!(p, "{}", custom.trim());
    let _ = writeln!(p);
    let _ = writeln!(p, "时间窗口：{time_window}，最多 {max_items} 条。");
    let _ = writeln!(
        p,
        r#"请以 JSON 格式返回：{{"categories":[{{"name":"...","icon":"...","news":[{{"title":"...","summary":"...","source":"...","url":"..."}}]}}]}}，只返回 JSON。"#
    );
    let _ = writeln!(p);
    let _ = writeln!(p, "候选文章：");
    push_articles(&mut p, articles);
    p
}

fn push_articles(out: &mut String, articles: &[Article]) {
    for (i, a) in articles.iter().enumerate() {
        let _ = writeln!(out, "{}. [{}] {}", i + 1, a.source, a.title);
        if !a.description.is_empty() {
            let _ = writeln!(out, "   {}", a.description);
        }
        if !a.published.is_empty() {
            let _ = writeln!(out, "   发布时间: {}", a.published);
        }
        let _ = writeln!(out, "   链接: {}", a.url);
    }
}

/// Merge a second call's categories into the first call's, dropping any item
/// whose non-empty URL already appeared.
pub fn merge_categories(mut base: Vec<Category>, extra: Vec<Category>) -> Vec<Category> {
    let mut seen: HashSet<String> = base
        .iter()
        .flat_map(|c| c.news.iter())
        .filter(|n| !n.url.is_empty())
        .map(|n| n.url.clone())
        .collect();

    for cat in extra {
        let fresh: Vec<_> = cat
            .news
            .into_iter()
            .filter(|n| n.url.is_empty() || seen.insert(n.url.clone()))
            .collect();
        if fresh.is_empty() {
            continue;
        }
        match base.iter_mut().find(|c| c.name == cat.name) {
            Some(existing) => existing.news.extend(fresh),
            None => base.push(Category {
                name: cat.name,
                icon: cat.icon,
                news: fresh,
            }),
        }
    }
    base
}

/// Reorder model output to the configured taxonomy; categories the taxonomy
/// does not know keep their model order at the end. Missing icons are filled
/// from the taxonomy.
pub fn reorder_to_taxonomy(cats: Vec<Category>, taxonomy: &[CategorySpec]) -> Vec<Category> {
    if taxonomy.is_empty() {
        return cats;
    }
    let mut known: Vec<Option<Category>> = vec![None; taxonomy.len()];
    let mut unknown = Vec::new();
    for mut cat in cats {
        match taxonomy.iter().position(|s| s.name == cat.name) {
            Some(idx) => {
                if cat.icon.is_empty() {
                    cat.icon = taxonomy[idx].icon.clone();
                }
                match &mut known[idx] {
                    Some(existing) => existing.news.append(&mut cat.news),
                    slot => *slot = Some(cat),
                }
            }
            None => unknown.push(cat),
        }
    }
    let mut out: Vec<Category> = known.into_iter().flatten().collect();
    out.extend(unknown);
    out
}

/// Cap the total item count across all categories.
///
/// Balanced trims one item off the end of the currently longest category
/// until the budget fits, so no category is starved. Sequential keeps
/// categories in order until the budget is spent and empties the rest.
pub fn truncate_categories(
    mut cats: Vec<Category>,
    max_items: usize,
    balanced: bool,
) -> Vec<Category> {
    let total: usize = cats.iter().map(|c| c.news.len()).sum();
    if total <= max_items {
        return cats;
    }
    debug!("Truncating {total} items to {max_items} (balanced={balanced})");

    if balanced {
        let mut excess = total - max_items;
        while excess > 0 {
            let Some(longest) = cats
                .iter_mut()
                .filter(|c| !c.news.is_empty())
                .max_by_key(|c| c.news.len())
            else {
                break;
            };
            longest.news.pop();
            excess -= 1;
        }
    } else {
        let mut budget = max_items;
        for cat in &mut cats {
            let keep = cat.news.len().min(budget);
            cat.news.truncate(keep);
            budget -= keep;
        }
    }
    cats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewsItem;

    fn item(url: &str) -> NewsItem {
        NewsItem {
            title: url.to_string(),
            summary: "s".to_string(),
            comment: None,
            source: "x".to_string(),
            url: url.to_string(),
        }
    }

    fn cat(name: &str, urls: &[&str]) -> Category {
        Category {
            name: name.to_string(),
            icon: String::new(),
            news: urls.iter().map(|u| item(u)).collect(),
        }
    }

    #[test]
    fn merge_drops_duplicate_urls() {
        let first = vec![cat("A", &["u1", "u2"])];
        let second = vec![cat("A", &["u2", "u3"]), cat("B", &["u1"])];
        let merged = merge_categories(first, second);
        assert_eq!(merged.len(), 1);
        let urls: Vec<&str> = merged[0].news.iter().map(|n| n.url.as_str()).collect();
        assert_eq!(urls, vec!["u1", "u2", "u3"]);
    }

    #[test]
    fn merge_keeps_items_with_empty_urls() {
        let first = vec![cat("A", &["u1"])];
        let mut second_cat = cat("A", &[]);
        second_cat.news.push(item(""));
        second_cat.news.push(item(""));
        let merged = merge_categories(first, vec![second_cat]);
        assert_eq!(merged[0].news.len(), 3);
    }

    #[test]
    fn merged_result_has_no_duplicate_nonempty_urls() {
        let first = vec![cat("A", &["u1"]), cat("B", &["u2"])];
        let second = vec![cat("C", &["u1", "u2", "u3"])];
        let merged = merge_categories(first, second);
        let mut seen = HashSet::new();
        for n in merged.iter().flat_map(|c| c.news.iter()) {
            if !n.url.is_empty() {
                assert!(seen.insert(n.url.clone()), "duplicate url {}", n.url);
            }
        }
    }

    #[test]
    fn balanced_truncation_trims_longest_first() {
        let cats = vec![cat("A", &["a1", "a2", "a3", "a4"]), cat("B", &["b1"])];
        let out = truncate_categories(cats, 3, true);
        assert_eq!(out.iter().map(|c| c.news.len()).sum::<usize>(), 3);
        assert_eq!(out[0].news.len(), 2);
        assert_eq!(out[1].news.len(), 1);
    }

    #[test]
    fn sequential_truncation_walks_in_order() {
        let cats = vec![cat("A", &["a1", "a2", "a3"]), cat("B", &["b1", "b2"])];
        let out = truncate_categories(cats, 3, false);
        assert_eq!(out[0].news.len(), 3);
        assert_eq!(out[1].news.len(), 0);
    }

    #[test]
    fn truncation_is_a_noop_under_budget() {
        let cats = vec![cat("A", &["a1"]), cat("B", &["b1"])];
        let out = truncate_categories(cats, 10, true);
        assert_eq!(out.iter().map(|c| c.news.len()).sum::<usize>(), 2);
    }

    #[test]
    fn reorder_follows_taxonomy_and_fills_icons() {
        let taxonomy = vec![
            CategorySpec {
                name: "模型".to_string(),
                icon: "🧠".to_string(),
            },
            CategorySpec {
                name: "产品".to_string(),
                icon: "🚀".to_string(),
            },
        ];
        let cats = vec![
            cat("产品", &["p1"]),
            cat("别的", &["x1"]),
            cat("模型", &["m1"]),
        ];
        let out = reorder_to_taxonomy(cats, &taxonomy);
        let names: Vec<&str> = out.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["模型", "产品", "别的"]);
        assert_eq!(out[0].icon, "🧠");
    }

    #[test]
    fn resolve_topic_modes() {
        assert_eq!(TopicMode::resolve("broad", None, None), TopicMode::Broad);
        assert_eq!(
            TopicMode::resolve("focused", None, Some("hw")),
            TopicMode::Focused {
                group: "hw".to_string()
            }
        );
        assert_eq!(
            TopicMode::resolve("custom", Some("do things"), None),
            TopicMode::Custom {
                prompt: "do things".to_string()
            }
        );
        // Custom without a prompt falls back to broad.
        assert_eq!(TopicMode::resolve("custom", None, None), TopicMode::Broad);
        assert_eq!(TopicMode::resolve("??", None, None), TopicMode::Broad);
    }

    #[test]
    fn prompt_embeds_articles_and_budget() {
        let articles = vec![Article::new(
            "Big launch".to_string(),
            "Details".to_string(),
            "The Verge".to_string(),
            "f".to_string(),
            "https://example.com/a".to_string(),
            "2025-06-01T00:00:00+00:00".to_string(),
        )];
        let taxonomy = vec![CategorySpec {
            name: "产品".to_string(),
            icon: "🚀".to_string(),
        }];
        let p = build_prompt(&articles, 7, &taxonomy, "2025-05-31 18:00 ~ 2025-06-01 17:59");
        assert!(p.contains("最多 7 条"));
        assert!(p.contains("[The Verge] Big launch"));
        assert!(p.contains("https://example.com/a"));
        assert!(p.contains("🚀 产品"));
    }
}
