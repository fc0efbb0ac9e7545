use std::{env, time::Duration};

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::config::Settings;
use crate::models::{Category, Channel, Draft};

/// Hard per-message byte budget. The provider rejects larger payloads; this
/// stays under its limit with JSON-envelope headroom.
pub const WEBHOOK_BYTE_BUDGET: usize = 3800;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct WebhookResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

/// Resolve the webhook key for a channel.
///
/// `WEBHOOK_KEYS` is a JSON map keyed by channel id; a single-entry map acts
/// as a wildcard. `WEBHOOK_KEY` is the legacy single-key fallback.
pub fn resolve_webhook_key(channel_id: Option<&str>) -> Option<String> {
    resolve_key(
        env::var("WEBHOOK_KEYS").ok().as_deref(),
        env::var("WEBHOOK_KEY").ok().as_deref(),
        channel_id,
    )
}

fn resolve_key(
    keys_json: Option<&str>,
    legacy: Option<&str>,
    channel_id: Option<&str>,
) -> Option<String> {
    if let Some(raw) = keys_json {
        match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(raw) {
            Ok(map) => {
                if let Some(id) = channel_id {
                    if let Some(key) = map.get(id).and_then(|v| v.as_str()) {
                        return Some(key.to_string());
                    }
                }
                if map.len() == 1 {
                    if let Some(key) = map.values().next().and_then(|v| v.as_str()) {
                        return Some(key.to_string());
                    }
                }
            }
            Err(_) => {
                warn!("WEBHOOK_KEYS is not valid JSON, falling back to WEBHOOK_KEY");
            }
        }
    }
    legacy.map(str::to_string)
}

/// Deliver a draft to a channel webhook, chunking when over budget.
///
/// Failure classes differ: an API-level rejection (non-zero errcode) is
/// retryable — trim the lowest-priority item and resend. A transport failure
/// is not — the message may already have landed, and resending risks a
/// duplicate, so abort immediately.
pub async fn send_webhook(
    client: &Client,
    draft: &Draft,
    channel: Option<&Channel>,
    settings: &Settings,
) -> Result<()> {
    let channel_id = channel.map(|c| c.id.as_str());
    let key = resolve_webhook_key(channel_id).ok_or_else(|| {
        anyhow!(
            "No webhook key found for channel '{}'",
            channel_id.unwrap_or("default")
        )
    })?;
    let base = channel
        .and_then(|c| c.webhook_url_base.as_deref())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| settings.webhook_url_base());
    let url = Url::parse_with_params(base, &[("key", key.as_str())])
        .with_context(|| format!("Invalid webhook URL base '{base}'"))?;
    deliver(client, url.as_str(), draft).await
}

/// Chunked delivery loop, separated from key/URL resolution.
async fn deliver(client: &Client, url: &str, draft: &Draft) -> Result<()> {
    let chunks = split_chunks(&draft.categories, WEBHOOK_BYTE_BUDGET, draft);
    let n = chunks.len();
    // Packing may already have shed items from an oversized category; the
    // footer counts what actually goes out, not what the draft holds.
    let mut remaining_total: usize = chunks.iter().flatten().map(|c| c.news.len()).sum();
    let original_total = remaining_total;

    for (i, mut cats) in chunks.into_iter().enumerate() {
        let part = (n > 1 && i > 0).then_some((i + 1, n));
        let is_last = i + 1 == n;

        loop {
            let footer_total = is_last.then_some(remaining_total);
            let content = render_chunk(draft, &cats, part, footer_total);
            match post(client, url, &content).await? {
                0 => break,
                code => {
                    // API rejection, e.g. payload too large: drop the least
                    // important item and try again.
                    if !trim_last_item(&mut cats) {
                        anyhow::bail!("Webhook rejected chunk {} (errcode {code}) and no items left to trim", i + 1);
                    }
                    remaining_total -= 1;
                    warn!("Webhook errcode {code}, trimmed one item and retrying");
                }
            }
        }
    }

    if remaining_total < original_total {
        warn!(
            "Delivered with {} item(s) trimmed to satisfy the webhook",
            original_total - remaining_total
        );
    }
    info!("Webhook delivery complete ({n} message(s))");
    Ok(())
}

/// POST one markdown message; Ok(errcode) for any well-formed API response,
/// Err for transport-level failures (which must not be retried).
async fn post(client: &Client, url: &str, content: &str) -> Result<i64> {
    let payload = json!({
        "msgtype": "markdown",
        "markdown": {
            "content": content,
            "mentioned_list": ["@all"],
        },
    });

    let response = client
        .post(url)
        .timeout(WEBHOOK_TIMEOUT)
        .json(&payload)
        .send()
        .await
        .context("webhook request failed")?;
    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("webhook returned HTTP {status}");
    }
    let body: WebhookResponse = response
        .json()
        .await
        .context("webhook response was not JSON")?;
    if body.errcode != 0 {
        debug!("Webhook API error: {} - {}", body.errcode, body.errmsg);
    }
    Ok(body.errcode)
}

fn trim_last_item(cats: &mut Vec<Category>) -> bool {
    for cat in cats.iter_mut().rev() {
        if cat.news.pop().is_some() {
            cats.retain(|c| !c.news.is_empty());
            return true;
        }
    }
    false
}

fn header_line(draft: &Draft, part: Option<(usize, usize)>) -> String {
    match part {
        Some((i, n)) => format!("# 科技日报 {}（续 {}/{}）", draft.date, i, n),
        None => format!("# 科技日报 {}", draft.date),
    }
}

fn footer_line(total: usize) -> String {
    format!("---\n共 {total} 条")
}

fn category_block(cat: &Category) -> String {
    let mut lines = Vec::new();
    lines.push("───────────────".to_string());
    lines.push(format!("## {} {}", cat.icon, cat.name));
    for item in &cat.news {
        lines.push(format!("**{}**", item.title));
        if !item.summary.is_empty() {
            lines.push(format!("> {}", item.summary));
        }
        if let Some(comment) = &item.comment {
            lines.push(format!("> <font color=\"info\">{comment}</font>"));
        }
        lines.push(format!("[阅读原文]({})", item.url));
        lines.push(String::new());
    }
    lines.join("\n")
}

pub fn render_chunk(
    draft: &Draft,
    cats: &[Category],
    part: Option<(usize, usize)>,
    footer_total: Option<usize>,
) -> String {
    let mut lines = vec![header_line(draft, part)];
    for cat in cats {
        if cat.news.is_empty() {
            continue;
        }
        lines.push(category_block(cat));
    }
    if let Some(total) = footer_total {
        lines.push(footer_line(total));
    }
    lines.join("\n")
}

/// Pack categories into byte-bounded chunks. A category's items stay together
/// when they fit in one chunk; a category that alone exceeds the budget is
/// trimmed item by item until it fits.
pub fn split_chunks(categories: &[Category], budget: usize, draft: &Draft) -> Vec<Vec<Category>> {
    // Reserve room for the worst-case continuation header and the footer so
    // every chunk stays under budget no matter where it lands.
    let reserve = header_line(draft, Some((99, 99))).len()
        + footer_line(draft.total_items()).len()
        + 2;
    let block_budget = budget.saturating_sub(reserve);

    let mut chunks: Vec<Vec<Category>> = Vec::new();
    let mut current: Vec<Category> = Vec::new();
    let mut current_size = 0usize;

    for cat in categories {
        if cat.news.is_empty() {
            continue;
        }
        let mut cat = cat.clone();
        let mut block = category_block(&cat);

        // Oversized on its own: shed items from the end until it fits.
        while block.len() + 1 > block_budget && !cat.news.is_empty() {
            cat.news.pop();
            block = category_block(&cat);
        }
        if cat.news.is_empty() {
            warn!("Category '{}' too large for one message even alone, dropped", cat.name);
            continue;
        }

        let cost = block.len() + 1;
        if current_size + cost > block_budget && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += cost;
        current.push(cat);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    if chunks.is_empty() {
        chunks.push(Vec::new());
    }
    chunks
}
