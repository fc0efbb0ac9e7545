mod app;
mod config;
mod drafts;
mod email;
mod feeds;
mod filter;
mod logger;
mod models;
mod repair;
mod schedule;
mod summarizer;
mod webhook;

use chrono::NaiveDate;
use clap::{Parser, ValueEnum};

use crate::app::{Mode, RunOptions};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    /// Aggregate feeds, summarize, and save drafts
    Fetch,
    /// Deliver due drafts over their configured channels
    Send,
    /// Force webhook delivery for a draft, ignoring the schedule
    Webhook,
    /// Fetch then send (default)
    Full,
}

#[derive(Parser)]
#[command(name = "newsdigest")]
#[command(about = "Scheduled AI/tech news digest")]
struct Cli {
    #[arg(value_enum, default_value = "full")]
    mode: ModeArg,

    /// Draft date (defaults to the current window's end date)
    date: Option<NaiveDate>,

    /// Use the current time as the window end instead of the send slot
    #[arg(long)]
    manual: bool,

    /// Restrict the run to one channel id
    #[arg(long)]
    channel: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let opts = RunOptions {
        mode: match cli.mode {
            ModeArg::Fetch => Mode::Fetch,
            ModeArg::Send => Mode::Send,
            ModeArg::Webhook => Mode::Webhook,
            ModeArg::Full => Mode::Full,
        },
        manual: cli.manual,
        channel: cli.channel,
        date: cli.date,
    };

    if let Err(e) = app::run(opts).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
