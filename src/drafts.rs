use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use log::{debug, info, warn};

use crate::models::Draft;

/// Draft files live in one directory, named `{date}.json` or
/// `{date}_{channel_id}.json`.
///
/// The check-then-write in `save` is not locked; the pipeline is expected to
/// run as a single non-overlapping scheduled process.
pub struct DraftStore {
    dir: PathBuf,
}

impl DraftStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create drafts dir {}", dir.display()))?;
        Ok(DraftStore { dir })
    }

    pub fn path_for(&self, date: NaiveDate, channel_id: Option<&str>) -> PathBuf {
        let name = match channel_id {
            Some(id) => format!("{date}_{id}.json"),
            None => format!("{date}.json"),
        };
        self.dir.join(name)
    }

    /// Persist a draft unless the stored copy is already in a terminal
    /// status (sent/rejected/approved) — a re-fetch must never clobber a
    /// reviewed or delivered draft. A corrupt stored file counts as absent.
    pub fn save(&self, draft: &Draft) -> Result<PathBuf> {
        let path = self.path_for(draft.date, draft.channel_id.as_deref());

        if let Some(existing) = read_draft(&path) {
            if existing.status.is_terminal() {
                info!(
                    "Draft {} already {:?}, keeping existing file",
                    path.display(),
                    existing.status
                );
                return Ok(path);
            }
        }

        let json = serde_json::to_string_pretty(draft).context("Failed to serialize draft")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write draft {}", path.display()))?;
        debug!("Saved draft {}", path.display());
        Ok(path)
    }

    pub fn load(&self, date: NaiveDate, channel_id: Option<&str>) -> Option<Draft> {
        read_draft(&self.path_for(date, channel_id))
    }

    /// Overwrite a stored draft unconditionally; used by the dispatcher to
    /// flip status after delivery.
    pub fn update(&self, draft: &Draft) -> Result<PathBuf> {
        let path = self.path_for(draft.date, draft.channel_id.as_deref());
        let json = serde_json::to_string_pretty(draft).context("Failed to serialize draft")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write draft {}", path.display()))?;
        Ok(path)
    }

    /// Delete drafts whose filename-encoded date is older than the horizon,
    /// regardless of status.
    pub fn sweep(&self, today: NaiveDate, horizon_days: i64) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read drafts dir {}", self.dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(date) = filename_date(name) else {
                continue;
            };
            if (today - date).num_days() > horizon_days {
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!("Could not delete old draft {name}: {e}");
                } else {
                    debug!("Deleted old draft {name}");
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!("Retention sweep removed {removed} drafts");
        }
        Ok(removed)
    }
}

fn read_draft(path: &Path) -> Option<Draft> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(draft) => Some(draft),
        Err(e) => {
            warn!("Corrupt draft {} treated as absent: {e}", path.display());
            None
        }
    }
}

/// Date prefix of a draft filename: `2025-06-01.json` or
/// `2025-06-01_team.json`.
fn filename_date(name: &str) -> Option<NaiveDate> {
    let stem = name.strip_suffix(".json")?;
    let date_part = stem.split('_').next()?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}
