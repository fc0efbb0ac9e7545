use log::debug;

use crate::config::FilterRules;
use crate::models::Article;

/// Apply blacklist (drop) and whitelist (promote to front) rules.
///
/// Keyword rules match case-insensitively against `title + " " + description`;
/// source rules against the source name. The whitelist never drops anything,
/// it only moves matching survivors ahead of the rest, keeping relative order
/// within each partition.
pub fn apply_filters(articles: Vec<Article>, rules: &FilterRules) -> Vec<Article> {
    if rules.is_empty() {
        return articles;
    }

    let before = articles.len();
    let survivors: Vec<Article> = articles
        .into_iter()
        .filter(|a| !is_blacklisted(a, rules))
        .collect();
    debug!("Blacklist dropped {} articles", before - survivors.len());

    if rules.whitelist_keywords.is_empty() && rules.whitelist_sources.is_empty() {
        return survivors;
    }

    let (mut promoted, rest): (Vec<Article>, Vec<Article>) =
        survivors.into_iter().partition(|a| is_whitelisted(a, rules));
    debug!("Whitelist promoted {} articles", promoted.len());
    promoted.extend(rest);
    promoted
}

fn is_blacklisted(article: &Article, rules: &FilterRules) -> bool {
    let text = haystack(article);
    let source = article.source.to_lowercase();
    rules
        .blacklist_keywords
        .iter()
        .any(|k| text.contains(&k.to_lowercase()))
        || rules
            .blacklist_sources
            .iter()
            .any(|s| source.contains(&s.to_lowercase()))
}

fn is_whitelisted(article: &Article, rules: &FilterRules) -> bool {
    let text = haystack(article);
    let source = article.source.to_lowercase();
    rules
        .whitelist_keywords
        .iter()
        .any(|k| text.contains(&k.to_lowercase()))
        || rules
            .whitelist_sources
            .iter()
            .any(|s| source.contains(&s.to_lowercase()))
}

fn haystack(article: &Article) -> String {
    format!("{} {}", article.title, article.description).to_lowercase()
}
