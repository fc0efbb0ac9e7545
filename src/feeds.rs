use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{StreamExt, stream};
use log::{debug, warn};
use reqwest::Client;

use crate::config::FeedConfig;
use crate::models::{Article, cmp_published_desc};

/// How many feed fetches may be in flight at once.
const FETCH_POOL_SIZE: usize = 10;
/// Per-request timeout for one feed.
const FETCH_TIMEOUT: Duration = Duration::from_secs(12);
/// At most this many entries are taken from any single feed.
const MAX_ENTRIES_PER_FEED: usize = 20;

const USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 13.5; rv:116.0) Gecko/20100101 Firefox/116.0";

pub fn build_client() -> Result<Client> {
    Client::builder()
        .redirect(reqwest::redirect::Policy::limited(10))
        .user_agent(USER_AGENT)
        .timeout(FETCH_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")
}

/// Fetch and parse one feed, keeping entries published at or after `cutoff`
/// (an RFC-3339 string; entries without a date are kept with `published=""`).
///
/// Feed failures are independent and must not abort the batch, so every
/// network or parse error is logged and mapped to an empty list.
pub async fn fetch_feed(client: &Client, feed: &FeedConfig, cutoff: &str) -> Vec<Article> {
    match fetch_feed_inner(client, feed, cutoff).await {
        Ok(articles) => {
            debug!("{}: {} fresh entries", feed.name, articles.len());
            articles
        }
        Err(e) => {
            warn!("Feed {} ({}) failed: {e:#}", feed.name, feed.url);
            Vec::new()
        }
    }
}

async fn fetch_feed_inner(
    client: &Client,
    feed: &FeedConfig,
    cutoff: &str,
) -> Result<Vec<Article>> {
    let response = client
        .get(&feed.url)
        .send()
        .await
        .context("request failed")?;
    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("feed returned status {status}");
    }
    let bytes = response.bytes().await.context("failed to read body")?;
    let parsed = feed_rs::parser::parse(bytes.as_ref()).context("failed to parse feed")?;

    let mut articles = Vec::new();
    for entry in parsed.entries.into_iter().take(MAX_ENTRIES_PER_FEED) {
        let published = entry
            .published
            .or(entry.updated)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();

        // Entries with a real date older than the window are stale; undated
        // entries are kept and sort last.
        if !published.is_empty() && published.as_str() < cutoff {
            continue;
        }

        let title = entry
            .title
            .map(|t| t.content.trim().to_string())
            .unwrap_or_default();
        if title.is_empty() {
            continue;
        }

        let description = if feed.paywalled {
            String::new()
        } else {
            entry
                .summary
                .map(|s| s.content)
                .unwrap_or_default()
        };

        let url = entry
            .links
            .first()
            .map(|l| l.href.clone())
            .unwrap_or_default();

        articles.push(Article::new(
            title,
            description,
            feed.name.clone(),
            feed.url.clone(),
            url,
            published,
        ));
    }

    Ok(articles)
}

/// Fan out over all enabled feeds with bounded parallelism, cap each source
/// group, and return one list sorted newest-first.
///
/// The cap keeps high-volume sources from drowning out low-volume ones before
/// the model ever sees the list; sources in `unlimited_group` keep everything.
pub async fn aggregate(
    client: &Client,
    feeds: &[FeedConfig],
    cutoff: &str,
    per_source_cap: usize,
    unlimited_group: Option<&str>,
) -> Vec<Article> {
    let enabled: Vec<&FeedConfig> = feeds.iter().filter(|f| f.enabled).collect();
    debug!("Aggregating {} feeds (cutoff {cutoff})", enabled.len());

    // Results arrive in completion order; the final sort makes downstream
    // ordering reproducible regardless of network races.
    let results: Vec<Vec<Article>> = stream::iter(enabled.iter())
        .map(|feed| fetch_feed(client, feed, cutoff))
        .buffer_unordered(FETCH_POOL_SIZE)
        .collect()
        .await;

    let unlimited_sources: Vec<&str> = match unlimited_group {
        Some(group) => enabled
            .iter()
            .filter(|f| f.group.as_deref() == Some(group))
            .map(|f| f.name.as_str())
            .collect(),
        None => Vec::new(),
    };

    let mut by_source: HashMap<String, Vec<Article>> = HashMap::new();
    for article in results.into_iter().flatten() {
        by_source
            .entry(article.source.clone())
            .or_default()
            .push(article);
    }

    let mut merged = Vec::new();
    for (source, mut group) in by_source {
        group.sort_by(|a, b| cmp_published_desc(&a.published, &b.published));
        if !unlimited_sources.contains(&source.as_str()) {
            group.truncate(per_source_cap);
        }
        merged.extend(group);
    }

    merged.sort_by(|a, b| cmp_published_desc(&a.published, &b.published));
    merged
}
