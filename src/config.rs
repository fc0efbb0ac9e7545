use std::{
    env,
    fs::{self, File},
    io::Write,
    path::PathBuf,
};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{Channel, ChannelType};

pub const DEFAULT_WEBHOOK_URL_BASE: &str =
    "https://redcity-open.xiaohongshu.com/api/robot/webhook/send";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
    /// Feed group, e.g. "hardware" for the focused-mode subset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Paywalled feeds contribute title-only articles.
    #[serde(default)]
    pub paywalled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategorySpec {
    pub name: String,
    #[serde(default)]
    pub icon: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterRules {
    #[serde(default)]
    pub blacklist_keywords: Vec<String>,
    #[serde(default)]
    pub blacklist_sources: Vec<String>,
    #[serde(default)]
    pub whitelist_keywords: Vec<String>,
    #[serde(default)]
    pub whitelist_sources: Vec<String>,
}

impl FilterRules {
    pub fn is_empty(&self) -> bool {
        self.blacklist_keywords.is_empty()
            && self.blacklist_sources.is_empty()
            && self.whitelist_keywords.is_empty()
            && self.whitelist_sources.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_api_base: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        LlmSettings {
            model: default_model(),
            api_base: None,
            fallback_model: None,
            fallback_api_base: None,
        }
    }
}

/// Immutable settings value, loaded once at startup and passed down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
    /// Fixed category taxonomy; broad mode reorders model output to match.
    #[serde(default)]
    pub categories: Vec<CategorySpec>,
    #[serde(flatten)]
    pub filters: FilterRules,
    /// Informational; scheduling uses the host clock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default = "default_topic_mode")]
    pub topic_mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_prompt: Option<String>,
    #[serde(default = "default_per_source_cap")]
    pub per_source_cap: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlimited_group: Option<String>,
    #[serde(default = "default_max_news_items")]
    pub max_news_items: usize,
    /// Balanced truncation trims the longest category first instead of
    /// walking categories in order.
    #[serde(default = "default_true")]
    pub balanced_truncation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drafts_dir: Option<PathBuf>,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url_base: Option<String>,
    #[serde(default)]
    pub llm: LlmSettings,
}

fn default_true() -> bool {
    true
}
fn default_model() -> String {
    "gpt-4o-2024-08-06".to_string()
}
fn default_topic_mode() -> String {
    "broad".to_string()
}
fn default_per_source_cap() -> usize {
    3
}
fn default_max_news_items() -> usize {
    10
}
fn default_retention_days() -> i64 {
    30
}

pub struct EnsureOutcome {
    pub path: PathBuf,
    pub created: bool,
}

impl Settings {
    /// Settings file path: `SETTINGS_PATH` env override, else the XDG config
    /// location.
    pub fn find_path() -> Option<PathBuf> {
        if let Ok(p) = env::var("SETTINGS_PATH") {
            return Some(PathBuf::from(p));
        }
        xdg::BaseDirectories::with_prefix("newsdigest").find_config_file("settings.json")
    }

    pub fn ensure_user_config() -> Result<EnsureOutcome> {
        if let Some(path) = Self::find_path() {
            if path.exists() {
                return Ok(EnsureOutcome {
                    path,
                    created: false,
                });
            }
        }

        let xdg_dirs = xdg::BaseDirectories::with_prefix("newsdigest");
        let config_path = xdg_dirs
            .place_config_file("settings.json")
            .context("cannot create configuration directory")?;
        let mut config_file = File::create(&config_path)?;
        config_file.write_all(default_settings_template().as_bytes())?;

        Ok(EnsureOutcome {
            path: config_path,
            created: true,
        })
    }

    pub fn load() -> Result<Settings> {
        let path = Self::find_path()
            .ok_or_else(|| anyhow!("Could not locate settings.json (set SETTINGS_PATH?)"))?;
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json(&raw)
            .with_context(|| format!("Invalid settings in {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Settings> {
        let mut value: Value =
            serde_json::from_str(raw).context("settings file is not valid JSON")?;
        migrate_legacy(&mut value);
        let deserialized = serde_path_to_error::deserialize(value)
            .map_err(|e| anyhow!("invalid settings at `{}`: {}", e.path(), e.inner()))?;
        Ok(deserialized)
    }

    pub fn webhook_url_base(&self) -> &str {
        self.webhook_url_base
            .as_deref()
            .unwrap_or(DEFAULT_WEBHOOK_URL_BASE)
    }

    pub fn enabled_channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter().filter(|c| c.enabled)
    }

    pub fn channel(&self, id: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == id)
    }

    /// Item budget for a channel, falling back to the global default.
    pub fn max_items_for(&self, channel: &Channel) -> usize {
        channel.max_news_items.unwrap_or(self.max_news_items)
    }

    /// Topic mode string for a channel, falling back to the global default.
    pub fn topic_mode_for<'a>(&'a self, channel: &'a Channel) -> &'a str {
        channel.topic_mode.as_deref().unwrap_or(&self.topic_mode)
    }
}

/// Rewrites the three historical settings shapes into the unified
/// `channels` array:
///
/// 1. top-level `recipients` (email-only era) becomes one email channel;
/// 2. a top-level `webhook` object (single-webhook era) becomes one
///    webhook channel;
/// 3. `channels` as an id-keyed object becomes an array, the object key
///    winning over any embedded `id` field.
fn migrate_legacy(value: &mut Value) {
    let Some(obj) = value.as_object_mut() else {
        return;
    };

    // Shape 3: channels as an id-keyed map.
    if let Some(Value::Object(map)) = obj.get("channels") {
        let map = map.clone();
        let mut arr = Vec::with_capacity(map.len());
        for (id, mut ch) in map {
            if let Some(ch_obj) = ch.as_object_mut() {
                ch_obj.insert("id".to_string(), Value::String(id));
            }
            arr.push(ch);
        }
        obj.insert("channels".to_string(), Value::Array(arr));
    }

    let has_channels = obj
        .get("channels")
        .and_then(Value::as_array)
        .is_some_and(|a| !a.is_empty());

    let send_hour = obj.get("send_hour").and_then(Value::as_u64).unwrap_or(18);

    // Shape 1: bare recipients list.
    if !has_channels {
        if let Some(Value::Array(recipients)) = obj.get("recipients") {
            let channel = serde_json::json!({
                "id": "email",
                "type": "email",
                "name": "Email digest",
                "enabled": true,
                "send_hour": send_hour,
                "recipients": recipients,
            });
            push_channel(obj, channel);
        }
    }

    // Shape 2: single top-level webhook object.
    if let Some(Value::Object(webhook)) = obj.get("webhook").cloned().as_ref() {
        let channel = serde_json::json!({
            "id": "webhook",
            "type": "webhook",
            "name": webhook.get("name").and_then(Value::as_str).unwrap_or("Group chat"),
            "enabled": webhook.get("enabled").and_then(Value::as_bool).unwrap_or(true),
            "send_hour": webhook.get("send_hour").and_then(Value::as_u64).unwrap_or(send_hour),
            "webhook_url_base": webhook.get("url_base").cloned().unwrap_or(Value::Null),
        });
        push_channel(obj, channel);
        obj.remove("webhook");
    }
}

fn push_channel(obj: &mut serde_json::Map<String, Value>, channel: Value) {
    match obj.get_mut("channels") {
        Some(Value::Array(arr)) => arr.push(channel),
        _ => {
            obj.insert("channels".to_string(), Value::Array(vec![channel]));
        }
    }
}

impl Channel {
    pub fn enabled_recipients(&self) -> Vec<&str> {
        self.recipients
            .iter()
            .filter(|r| r.enabled && !r.email.is_empty())
            .map(|r| r.email.as_str())
            .collect()
    }

    pub fn is_email(&self) -> bool {
        self.channel_type == ChannelType::Email
    }
}

fn default_settings_template() -> String {
    let template = serde_json::json!({
        "channels": [
            {
                "id": "team",
                "type": "email",
                "name": "Team digest",
                "enabled": true,
                "send_hour": 18,
                "send_minute": 0,
                "recipients": [
                    { "email": "you@example.com", "enabled": true }
                ]
            }
        ],
        "feeds": [
            {
                "name": "Hacker News",
                "url": "https://news.ycombinator.com/rss",
                "enabled": true
            }
        ],
        "categories": [
            { "name": "模型与研究", "icon": "🧠" },
            { "name": "产品与应用", "icon": "🚀" },
            { "name": "行业与政策", "icon": "🏛️" }
        ],
        "blacklist_keywords": [],
        "whitelist_keywords": [],
        "topic_mode": "broad",
        "per_source_cap": 3,
        "max_news_items": 10,
        "llm": { "model": "gpt-4o-2024-08-06" }
    });
    serde_json::to_string_pretty(&template).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrates_bare_recipients_to_email_channel() {
        let raw = r#"{
            "recipients": [
                { "email": "a@example.com" },
                { "email": "b@example.com", "enabled": false }
            ],
            "send_hour": 9
        }"#;
        let settings = Settings::from_json(raw).unwrap();
        assert_eq!(settings.channels.len(), 1);
        let ch = &settings.channels[0];
        assert_eq!(ch.id, "email");
        assert!(ch.is_email());
        assert_eq!(ch.send_hour, 9);
        assert_eq!(ch.enabled_recipients(), vec!["a@example.com"]);
    }

    #[test]
    fn migrates_single_webhook_object() {
        let raw = r#"{
            "webhook": { "url_base": "https://example.com/hook", "send_hour": 8 }
        }"#;
        let settings = Settings::from_json(raw).unwrap();
        assert_eq!(settings.channels.len(), 1);
        let ch = &settings.channels[0];
        assert_eq!(ch.id, "webhook");
        assert_eq!(ch.channel_type, ChannelType::Webhook);
        assert_eq!(ch.send_hour, 8);
        assert_eq!(ch.webhook_url_base.as_deref(), Some("https://example.com/hook"));
    }

    #[test]
    fn migrates_channel_map_to_array() {
        let raw = r#"{
            "channels": {
                "ops": { "type": "webhook", "send_hour": 10 },
                "team": { "type": "email", "send_hour": 18, "id": "stale" }
            }
        }"#;
        let settings = Settings::from_json(raw).unwrap();
        assert_eq!(settings.channels.len(), 2);
        // The map key wins over any embedded id.
        assert!(settings.channel("ops").is_some());
        assert!(settings.channel("team").is_some());
        assert!(settings.channel("stale").is_none());
    }

    #[test]
    fn modern_shape_passes_through() {
        let raw = r#"{
            "channels": [
                { "id": "c1", "type": "webhook", "send_hour": 18, "topic_mode": "focused" }
            ],
            "feeds": [
                { "name": "HN", "url": "https://news.ycombinator.com/rss", "group": "hardware" }
            ],
            "per_source_cap": 5,
            "unlimited_group": "hardware"
        }"#;
        let settings = Settings::from_json(raw).unwrap();
        assert_eq!(settings.per_source_cap, 5);
        assert_eq!(settings.unlimited_group.as_deref(), Some("hardware"));
        let ch = settings.channel("c1").unwrap();
        assert_eq!(settings.topic_mode_for(ch), "focused");
        assert_eq!(settings.max_items_for(ch), 10);
    }

    #[test]
    fn channel_topic_mode_overrides_global() {
        let raw = r#"{
            "topic_mode": "focused",
            "channels": [
                { "id": "a", "type": "email", "send_hour": 8 },
                { "id": "b", "type": "email", "send_hour": 9, "topic_mode": "custom" }
            ]
        }"#;
        let settings = Settings::from_json(raw).unwrap();
        let a = settings.channel("a").unwrap();
        let b = settings.channel("b").unwrap();
        assert_eq!(settings.topic_mode_for(a), "focused");
        assert_eq!(settings.topic_mode_for(b), "custom");
    }

    #[test]
    fn filter_rules_flattened_from_top_level() {
        let raw = r#"{ "blacklist_keywords": ["crypto"], "whitelist_sources": ["TechCrunch"] }"#;
        let settings = Settings::from_json(raw).unwrap();
        assert_eq!(settings.filters.blacklist_keywords, vec!["crypto"]);
        assert_eq!(settings.filters.whitelist_sources, vec!["TechCrunch"]);
        assert!(!settings.filters.is_empty());
    }

    #[test]
    fn invalid_json_reports_path() {
        let raw = r#"{ "channels": [ { "id": "x", "type": "carrier-pigeon", "send_hour": 1 } ] }"#;
        let err = Settings::from_json(raw).unwrap_err();
        assert!(format!("{err:#}").contains("channels"));
    }
}
