use std::cmp::Ordering;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Longest description we keep from a feed entry before it goes into a prompt.
pub const MAX_DESCRIPTION_CHARS: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub title: String,
    pub description: String,
    pub source: String,
    pub feed_url: String,
    pub url: String,
    /// RFC-3339 timestamp, or "" when the feed entry carried no usable date.
    pub published: String,
}

impl Article {
    pub fn new(
        title: String,
        description: String,
        source: String,
        feed_url: String,
        url: String,
        published: String,
    ) -> Self {
        Article {
            title,
            description: truncate_chars(&description, MAX_DESCRIPTION_CHARS),
            source,
            feed_url,
            url,
            published,
        }
    }
}

/// Newest-first ordering over RFC-3339 strings. ISO-8601 is lexicographically
/// monotonic, so the strings are compared opaquely; "" sorts after every
/// real timestamp.
pub fn cmp_published_desc(a: &str, b: &str) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.cmp(a),
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsItem {
    pub title: String,
    pub summary: String,
    /// Optional reflective question attached by the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub news: Vec<NewsItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    PendingReview,
    Approved,
    Sent,
    Rejected,
}

impl DraftStatus {
    /// Terminal statuses protect a stored draft from being overwritten.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DraftStatus::Sent | DraftStatus::Rejected | DraftStatus::Approved
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftSource {
    Manual,
    Scheduled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub date: NaiveDate,
    pub time_window: String,
    pub categories: Vec<Category>,
    pub status: DraftStatus,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_mode: Option<String>,
    pub source: DraftSource,
}

impl Draft {
    pub fn total_items(&self) -> usize {
        self.categories.iter().map(|c| c.news.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Email,
    Webhook,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub email: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub send_hour: u32,
    #[serde(default)]
    pub send_minute: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_news_items: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<Recipient>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url_base: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn published_ordering_is_newest_first_with_empty_last() {
        let mut stamps = vec![
            "".to_string(),
            "2025-06-01T08:00:00Z".to_string(),
            "2025-06-02T08:00:00Z".to_string(),
            "".to_string(),
            "2025-05-31T23:59:59Z".to_string(),
        ];
        stamps.sort_by(|a, b| cmp_published_desc(a, b));
        assert_eq!(
            stamps,
            vec![
                "2025-06-02T08:00:00Z",
                "2025-06-01T08:00:00Z",
                "2025-05-31T23:59:59Z",
                "",
                "",
            ]
        );
    }

    #[test]
    fn description_truncated_on_construction() {
        let long = "x".repeat(700);
        let a = Article::new(
            "t".into(),
            long,
            "s".into(),
            "f".into(),
            "u".into(),
            String::new(),
        );
        assert_eq!(a.description.chars().count(), MAX_DESCRIPTION_CHARS);
    }

    #[test]
    fn truncate_respects_multibyte_boundaries() {
        let s = "新".repeat(600);
        let a = Article::new("t".into(), s, "s".into(), "f".into(), "u".into(), String::new());
        assert_eq!(a.description.chars().count(), MAX_DESCRIPTION_CHARS);
    }

    #[test]
    fn terminal_statuses() {
        assert!(DraftStatus::Sent.is_terminal());
        assert!(DraftStatus::Rejected.is_terminal());
        assert!(DraftStatus::Approved.is_terminal());
        assert!(!DraftStatus::PendingReview.is_terminal());
    }
}
