use std::{env, time::Duration};

use anyhow::{Context, Result, anyhow};
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
    message::{Mailbox, Message, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
};
use log::info;

use crate::models::{Channel, Draft};

const SMTP_TIMEOUT: Duration = Duration::from_secs(20);

/// Deliver a draft as an HTML email to the channel's enabled recipients.
/// SMTP credentials come from the environment; any failure surfaces as an
/// overall failure to the caller, no retry.
pub async fn send_email(channel: &Channel, draft: &Draft) -> Result<()> {
    let host = env::var("SMTP_HOST").unwrap_or_else(|_| "smtp.qq.com".to_string());
    let port: u16 = env::var("SMTP_PORT")
        .unwrap_or_else(|_| "587".to_string())
        .parse()
        .context("SMTP_PORT is not a number")?;
    let username = env::var("SMTP_USERNAME").context("SMTP_USERNAME not set")?;
    let password = env::var("SMTP_PASSWORD").context("SMTP_PASSWORD not set")?;
    let sender = env::var("SMTP_SENDER").unwrap_or_else(|_| username.clone());

    let mut recipients: Vec<String> = channel
        .enabled_recipients()
        .into_iter()
        .map(str::to_string)
        .collect();
    if recipients.is_empty() {
        // Legacy deployments configured recipients via env only.
        recipients = env::var("EMAIL_RECIPIENTS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    if recipients.is_empty() {
        return Err(anyhow!("Channel {} has no email recipients", channel.id));
    }

    let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&host)
        .context("Invalid SMTP host")?
        .port(port)
        .credentials(Credentials::new(username, password))
        .timeout(Some(SMTP_TIMEOUT))
        .build();

    let subject = format!("科技日报 - {}", draft.date);
    let html = render_email_html(draft);

    for rcpt in &recipients {
        let email = Message::builder()
            .from(sender.parse::<Mailbox>().context("Invalid SMTP_SENDER")?)
            .to(rcpt.parse::<Mailbox>().context("Invalid recipient email")?)
            .subject(subject.clone())
            .multipart(MultiPart::alternative().singlepart(SinglePart::html(html.clone())))?;

        mailer
            .send(email)
            .await
            .with_context(|| format!("SMTP delivery to {rcpt} failed"))?;
    }

    info!(
        "Email sent to {} recipient(s) for channel {}",
        recipients.len(),
        channel.id
    );
    Ok(())
}

/// Single self-contained HTML document, inline styles only.
pub fn render_email_html(draft: &Draft) -> String {
    let mut body = String::new();
    body.push_str("<html><body style=\"font-family: -apple-system, 'PingFang SC', sans-serif; max-width: 640px; margin: 0 auto; color: #222;\">\n");
    body.push_str(&format!(
        "<h1 style=\"font-size: 22px;\">科技日报 {}</h1>\n",
        draft.date
    ));
    body.push_str(&format!(
        "<p style=\"color: #888; font-size: 13px;\">时间窗口: {}</p>\n",
        escape_html(&draft.time_window)
    ));

    let mut total = 0;
    for cat in &draft.categories {
        if cat.news.is_empty() {
            continue;
        }
        body.push_str(&format!(
            "<h2 style=\"font-size: 17px; border-top: 1px solid #eee; padding-top: 12px;\">{} {}</h2>\n",
            escape_html(&cat.icon),
            escape_html(&cat.name)
        ));
        for item in &cat.news {
            total += 1;
            body.push_str("<div style=\"margin-bottom: 14px;\">\n");
            body.push_str(&format!("<strong>{}</strong><br>\n", escape_html(&item.title)));
            if !item.summary.is_empty() {
                body.push_str(&format!(
                    "<span style=\"color: #444;\">{}</span><br>\n",
                    escape_html(&item.summary)
                ));
            }
            if let Some(comment) = &item.comment {
                body.push_str(&format!(
                    "<span style=\"color: #07c160;\">{}</span><br>\n",
                    escape_html(comment)
                ));
            }
            body.push_str(&format!(
                "<a href=\"{}\" style=\"font-size: 13px;\">阅读原文</a> <span style=\"color: #aaa; font-size: 13px;\">{}</span>\n",
                escape_attr(&item.url),
                escape_html(&item.source)
            ));
            body.push_str("</div>\n");
        }
    }

    if total == 0 {
        body.push_str("<p>今日暂无重要新闻。</p>\n");
    }
    body.push_str(&format!(
        "<hr style=\"border: none; border-top: 1px solid #eee;\"><p style=\"color: #888; font-size: 12px;\">共 {total} 条 · 由 AI News Assistant 自动生成</p>\n"
    ));
    body.push_str("</body></html>\n");
    body
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attr(s: &str) -> String {
    escape_html(s).replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Category, DraftSource, DraftStatus, NewsItem};

    fn sample_draft() -> Draft {
        Draft {
            date: "2025-06-01".parse().unwrap(),
            time_window: "2025-05-31 18:00 ~ 2025-06-01 17:59".to_string(),
            categories: vec![Category {
                name: "模型".to_string(),
                icon: "🧠".to_string(),
                news: vec![NewsItem {
                    title: "新模型 <发布>".to_string(),
                    summary: "一句话摘要".to_string(),
                    comment: Some("这对谁最重要？".to_string()),
                    source: "The Verge".to_string(),
                    url: "https://example.com/a?x=1&y=2".to_string(),
                }],
            }],
            status: DraftStatus::PendingReview,
            created_at: "2025-06-01T18:00:00Z".to_string(),
            channel_id: None,
            channel_name: None,
            topic_mode: None,
            source: DraftSource::Scheduled,
        }
    }

    #[test]
    fn html_contains_items_and_escapes_markup() {
        let html = render_email_html(&sample_draft());
        assert!(html.contains("科技日报 2025-06-01"));
        assert!(html.contains("新模型 &lt;发布&gt;"));
        assert!(html.contains("这对谁最重要？"));
        assert!(html.contains("https://example.com/a?x=1&amp;y=2"));
        assert!(html.contains("共 1 条"));
        assert!(!html.contains("<发布>"));
    }

    #[test]
    fn empty_draft_renders_placeholder() {
        let mut draft = sample_draft();
        draft.categories.clear();
        let html = render_email_html(&draft);
        assert!(html.contains("今日暂无重要新闻"));
        assert!(html.contains("共 0 条"));
    }
}
