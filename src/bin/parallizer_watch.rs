//! Command-line client for a running parallizer server.
//!
//! Usage:
//!   parallizer-watch --file plan.md --line 12 --col 4
//!   parallizer-watch --file plan.md --scope-root ~/src/project --token secret
//!   parallizer-watch --file plan.md --clear

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use parallizer::cards::{CardCategory, CardDto, GlobalContext};
use parallizer::client::FeedClient;
use parallizer::http::{PollResponse, TriggerBody};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "parallizer-watch")]
#[command(about = "Trigger a parallizer run for a document and print cards as they arrive", long_about = None)]
struct Cli {
    /// Base URL of the parallizer server
    #[arg(long, default_value = "http://127.0.0.1:8000", env = "PARALLIZER_SERVER")]
    server: String,

    /// Document to send as the trigger text
    #[arg(long)]
    file: PathBuf,

    /// Zero-based cursor line
    #[arg(long, default_value_t = 0)]
    line: u32,

    /// Zero-based cursor column
    #[arg(long, default_value_t = 0)]
    col: u32,

    /// Directory producers search in; defaults to the current directory
    #[arg(long)]
    scope_root: Option<PathBuf>,

    /// Explicit user id; derived from scope root and file when omitted
    #[arg(long)]
    user_id: Option<String>,

    #[arg(long, env = "PARALLIZER_BEARER_TOKEN")]
    token: Option<String>,

    /// Clear the user's feed instead of triggering
    #[arg(long)]
    clear: bool,

    /// Give up after this many polls
    #[arg(long, default_value_t = 20)]
    max_polls: u32,
}

fn category_of(card: &CardDto) -> Option<CardCategory> {
    card.kind.parse().ok()
}

fn print_feed(feed: &PollResponse) {
    let status = if feed.processing { "processing" } else { "idle" };
    println!("--- {} cards ({status}) ---", feed.cards.len());
    for category in CardCategory::ALL {
        let cards: Vec<_> = feed
            .cards
            .iter()
            .filter(|c| category_of(c) == Some(category))
            .collect();
        if cards.is_empty() {
            continue;
        }
        println!("[{category}]");
        for card in cards {
            println!("  {}", card.header);
            for line in card.text.lines() {
                println!("    {line}");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let scope_root = match cli.scope_root {
        Some(root) => root,
        None => std::env::current_dir().context("cannot resolve current directory")?,
    };
    let global_context = GlobalContext::new(scope_root, Some(cli.file.clone()));
    let user_id = cli
        .user_id
        .unwrap_or_else(|| global_context.derive_user_id());
    let client = FeedClient::new(&cli.server, cli.token, Duration::from_secs(30))?;

    if cli.clear {
        let resp = client.clear(&user_id).await?;
        println!("{}: {}", resp.status, resp.message);
        return Ok(());
    }

    let document_text = std::fs::read_to_string(&cli.file)
        .with_context(|| format!("cannot read {}", cli.file.display()))?;
    let body = TriggerBody {
        user_id: user_id.clone(),
        document_text,
        cursor_position: vec![i64::from(cli.line), i64::from(cli.col)],
        global_context,
    };

    eprintln!("user {user_id} -> {}", cli.server);
    let final_feed = client.watch(&body, cli.max_polls, print_feed).await?;
    if final_feed.processing {
        eprintln!("server still processing after {} polls", cli.max_polls);
    }
    Ok(())
}
