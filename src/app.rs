use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Result, anyhow};
use chrono::{Local, NaiveDate, TimeZone, Utc};
use log::{debug, error, info, warn};

use crate::config::Settings;
use crate::drafts::DraftStore;
use crate::email::send_email;
use crate::feeds::{aggregate, build_client};
use crate::filter::apply_filters;
use crate::logger::init_logger;
use crate::models::{Channel, ChannelType, Draft, DraftSource, DraftStatus};
use crate::schedule::{due_now, window_bounds, window_label};
use crate::summarizer::{LlmBackends, SummarizeRequest, TopicMode, summarize};
use crate::webhook::send_webhook;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Fetch,
    Send,
    Webhook,
    Full,
}

pub struct RunOptions {
    pub mode: Mode,
    pub manual: bool,
    pub channel: Option<String>,
    pub date: Option<NaiveDate>,
}

pub async fn run(opts: RunOptions) -> Result<()> {
    init_logger()?;
    debug!("Logger initialized");

    let outcome = Settings::ensure_user_config()?;
    if outcome.created {
        info!(
            "Settings file created at {}. Please edit it and rerun.",
            outcome.path.display()
        );
        println!(
            "Settings file created at {}. Edit it and rerun.",
            outcome.path.display()
        );
        return Ok(());
    }

    let settings = Settings::load()?;
    debug!("Settings loaded: {} channel(s)", settings.channels.len());

    match opts.mode {
        Mode::Fetch => fetch_stage(&settings, &opts).await,
        Mode::Send => send_stage(&settings, &opts, false).await,
        Mode::Webhook => send_stage(&settings, &opts, true).await,
        Mode::Full => {
            fetch_stage(&settings, &opts).await?;
            send_stage(&settings, &opts, false).await
        }
    }
}

fn drafts_dir(settings: &Settings) -> PathBuf {
    if let Some(dir) = &settings.drafts_dir {
        return dir.clone();
    }
    xdg::BaseDirectories::with_prefix("newsdigest")
        .get_data_home()
        .map(|home| home.join("drafts"))
        .unwrap_or_else(|| PathBuf::from("drafts"))
}

fn selected_channels<'a>(settings: &'a Settings, opts: &RunOptions) -> Result<Vec<&'a Channel>> {
    let channels: Vec<&Channel> = match &opts.channel {
        Some(id) => {
            let ch = settings
                .channel(id)
                .ok_or_else(|| anyhow!("Unknown channel '{id}'"))?;
            vec![ch]
        }
        None => settings.enabled_channels().collect(),
    };
    if channels.is_empty() {
        warn!("No enabled channels configured");
    }
    Ok(channels)
}

/// Convert a local wall-clock instant to an RFC-3339 UTC string, the format
/// feed entry timestamps are compared against.
fn to_utc_rfc3339(local: chrono::NaiveDateTime) -> String {
    match Local.from_local_datetime(&local).earliest() {
        Some(dt) => dt.with_timezone(&Utc).to_rfc3339(),
        None => format!("{}", local.format("%Y-%m-%dT%H:%M:%S+00:00")),
    }
}

/// Aggregate, filter, summarize, and persist one draft per selected channel.
async fn fetch_stage(settings: &Settings, opts: &RunOptions) -> Result<()> {
    let backends = LlmBackends::from_env(&settings.llm)?;
    let client = build_client()?;
    let store = DraftStore::new(drafts_dir(settings))?;

    let today = Local::now().date_naive();
    store.sweep(today, settings.retention_days)?;

    let now = Local::now().naive_local();
    for channel in selected_channels(settings, opts)? {
        let (start, end) = window_bounds(now, channel.send_hour, opts.manual);
        let date = opts.date.unwrap_or_else(|| end.date());

        if let Some(existing) = store.load(date, Some(&channel.id)) {
            if existing.status.is_terminal() {
                info!(
                    "Draft for {date}/{} already {:?}, skipping fetch",
                    channel.id, existing.status
                );
                continue;
            }
        }

        let mode = TopicMode::resolve(
            settings.topic_mode_for(channel),
            settings.custom_prompt.as_deref(),
            settings.unlimited_group.as_deref(),
        );
        let cutoff = to_utc_rfc3339(start);
        let window = window_label(start, end);
        info!(
            "Fetching for channel {} (mode {}, window {window})",
            channel.id,
            mode.as_str()
        );

        let articles = aggregate(
            &client,
            &settings.feeds,
            &cutoff,
            settings.per_source_cap,
            settings.unlimited_group.as_deref(),
        )
        .await;
        info!("Aggregated {} articles", articles.len());

        let articles = apply_filters(articles, &settings.filters);
        info!("{} articles after filters", articles.len());

        let focus_sources: HashSet<String> = match &mode {
            TopicMode::Focused { group } => settings
                .feeds
                .iter()
                .filter(|f| f.group.as_deref() == Some(group.as_str()))
                .map(|f| f.name.clone())
                .collect(),
            _ => HashSet::new(),
        };

        let request = SummarizeRequest {
            articles: &articles,
            max_items: settings.max_items_for(channel),
            mode: &mode,
            taxonomy: &settings.categories,
            time_window: &window,
            focus_sources,
            balanced: settings.balanced_truncation,
        };
        let categories = summarize(&backends, &request).await;
        info!(
            "Summarizer produced {} categories, {} items",
            categories.len(),
            categories.iter().map(|c| c.news.len()).sum::<usize>()
        );

        let draft = Draft {
            date,
            time_window: window,
            categories,
            status: DraftStatus::PendingReview,
            created_at: Utc::now().to_rfc3339(),
            channel_id: Some(channel.id.clone()),
            channel_name: Some(channel.name.clone()),
            topic_mode: Some(mode.as_str().to_string()),
            source: if opts.manual {
                DraftSource::Manual
            } else {
                DraftSource::Scheduled
            },
        };
        let path = store.save(&draft)?;
        info!("Draft saved to {}", path.display());
    }

    Ok(())
}

/// Load drafts and deliver them. `force_webhook` bypasses the schedule check
/// and pushes webhook channels unconditionally.
async fn send_stage(settings: &Settings, opts: &RunOptions, force_webhook: bool) -> Result<()> {
    let store = DraftStore::new(drafts_dir(settings))?;
    let client = build_client()?;
    let now = Local::now().naive_local();

    let mut attempted = 0;
    let mut failures = Vec::new();

    for channel in selected_channels(settings, opts)? {
        if force_webhook && channel.channel_type != ChannelType::Webhook {
            continue;
        }
        // Scheduled sends only fire inside the channel's send slot; an
        // explicit --channel selection or webhook mode overrides that.
        if !force_webhook && opts.channel.is_none() && !due_now(channel, now) {
            debug!("Channel {} not due, skipping", channel.id);
            continue;
        }
        attempted += 1;

        let (_, end) = window_bounds(now, channel.send_hour, opts.manual);
        let date = opts.date.unwrap_or_else(|| end.date());

        // Channel-scoped draft first, shared (legacy) draft as fallback.
        let mut draft = match store
            .load(date, Some(&channel.id))
            .or_else(|| store.load(date, None))
        {
            Some(d) => d,
            None => {
                error!("No draft found for {date} (channel {})", channel.id);
                failures.push(channel.id.clone());
                continue;
            }
        };

        match draft.status {
            DraftStatus::Sent => {
                info!("Draft {date}/{} already sent, skipping", channel.id);
                continue;
            }
            DraftStatus::Rejected => {
                info!("Draft {date}/{} was rejected, skipping", channel.id);
                continue;
            }
            DraftStatus::PendingReview | DraftStatus::Approved => {}
        }

        let result = match channel.channel_type {
            ChannelType::Email => send_email(channel, &draft).await,
            ChannelType::Webhook => send_webhook(&client, &draft, Some(channel), settings).await,
        };

        match result {
            Ok(()) => {
                draft.status = DraftStatus::Sent;
                if let Err(e) = store.update(&draft) {
                    warn!("Delivered but could not persist sent status: {e:#}");
                }
                info!("Channel {} delivered", channel.id);
            }
            Err(e) => {
                error!("Channel {} delivery failed: {e:#}", channel.id);
                failures.push(channel.id.clone());
            }
        }
    }

    if !failures.is_empty() {
        anyhow::bail!("Delivery failed for channel(s): {}", failures.join(", "));
    }
    if attempted == 0 {
        info!("No channels due for delivery");
    }
    Ok(())
}
