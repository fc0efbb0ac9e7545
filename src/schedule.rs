use chrono::{Duration, NaiveDateTime};

use crate::models::Channel;

/// Minutes after a channel's send time during which a scheduled run still
/// counts as due. Cron drift should not silently skip a digest.
const SEND_GRACE_MINUTES: i64 = 15;

/// 24-hour news window ending at the most recent occurrence of
/// `send_hour:00` (the previous day's slot when now is before it).
/// Manual runs use now as the window end instead.
pub fn window_bounds(now: NaiveDateTime, send_hour: u32, manual: bool) -> (NaiveDateTime, NaiveDateTime) {
    let end = if manual {
        now
    } else {
        let slot = now
            .date()
            .and_hms_opt(send_hour.min(23), 0, 0)
            .unwrap_or(now);
        if now < slot { slot - Duration::days(1) } else { slot }
    };
    (end - Duration::days(1), end)
}

/// `"YYYY-MM-DD HH:MM ~ YYYY-MM-DD HH:MM"`, end shown minus one minute so
/// adjacent windows do not visually overlap.
pub fn window_label(start: NaiveDateTime, end: NaiveDateTime) -> String {
    format!(
        "{} ~ {}",
        start.format("%Y-%m-%d %H:%M"),
        (end - Duration::minutes(1)).format("%Y-%m-%d %H:%M")
    )
}

/// Whether a channel's send slot covers the current wall-clock time.
pub fn due_now(channel: &Channel, now: NaiveDateTime) -> bool {
    let Some(slot) = now
        .date()
        .and_hms_opt(channel.send_hour.min(23), channel.send_minute.min(59), 0)
    else {
        return false;
    };
    now >= slot && now - slot < Duration::minutes(SEND_GRACE_MINUTES)
}
