//! Nostr CLI - publish, react, delete and query on the configured relays
//!
//! Relays and the signing key come from `NOSTR_RELAY_URL(S)` and
//! `NOSTR_PRIVATE_KEY` (a `.env` file is loaded when present). Events are
//! printed to stdout as JSON lines; logs go to stderr.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use nostr::{KIND_METADATA, KIND_SHORT_TEXT_NOTE, decode_npub};
use nostr_client::{
    ENV_RELAY_URL, Event, Filter, PublishReport, RelayPool, SessionConfig,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "nostr", about = "Talk to Nostr relays", version)]
struct Cli {
    /// Load variables from this file instead of ./.env
    #[arg(long, global = true)]
    env: Option<PathBuf>,

    /// Relay URL; repeat for several. Overrides NOSTR_RELAY_URL(S)
    #[arg(long = "relay", global = true)]
    relays: Vec<String>,

    /// Seconds to wait for stored events
    #[arg(long, global = true, default_value_t = 10)]
    timeout: u64,

    /// Stop after the first matching event
    #[arg(long, global = true)]
    first: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the public key of the configured signing key
    Pubkey,
    /// Publish a text note (kind 1)
    Note {
        content: String,
    },
    /// React to an event (kind 7)
    React {
        event_id: String,
        #[arg(default_value = "+")]
        reaction: String,
        /// Author of the reacted-to event (hex or npub)
        #[arg(long)]
        author: Option<String>,
    },
    /// Withdraw a reaction by requesting its deletion
    Unreact {
        reaction_event_id: String,
    },
    /// Request deletion of one of your events (kind 5)
    Delete {
        event_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Fetch every stored event. Only sensible on a relay you run
    QueryAll {
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Fetch profile metadata (kind 0); defaults to your own key
    QueryMetadata {
        pubkey: Option<String>,
    },
    /// Fetch text notes (kind 1); defaults to your own key
    QueryNotes {
        pubkey: Option<String>,
    },
    /// Fetch one event by id
    QueryEvent {
        event_id: String,
    },
    /// Fetch every event by an author; defaults to your own key
    QueryAuthor {
        pubkey: Option<String>,
    },
    /// Stream new events until interrupted
    Follow {
        /// Only these kinds; repeat for several
        #[arg(long = "kind")]
        kinds: Vec<u16>,
        /// Only this author (hex or npub)
        #[arg(long)]
        author: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = load_config(&cli)?;

    match cli.command {
        Command::Pubkey => {
            let keys = config.require_keys()?;
            println!("{}", keys.public_key());
            println!("{}", keys.npub()?);
        }
        Command::Note { content } => {
            let pool = connect(config).await?;
            let report = pool.publish_note(&content, vec![]).await?;
            finish_publish(&pool, report).await?;
        }
        Command::React {
            event_id,
            reaction,
            author,
        } => {
            let author = author.as_deref().map(parse_pubkey).transpose()?;
            let pool = connect(config).await?;
            let report = pool.react(&event_id, author.as_deref(), &reaction).await?;
            finish_publish(&pool, report).await?;
        }
        Command::Unreact { reaction_event_id } => {
            let pool = connect(config).await?;
            let report = pool.undo_reaction(&reaction_event_id).await?;
            finish_publish(&pool, report).await?;
        }
        Command::Delete { event_id, reason } => {
            let pool = connect(config).await?;
            let report = pool.delete(&event_id, reason.as_deref()).await?;
            finish_publish(&pool, report).await?;
        }
        Command::QueryAll { limit } => {
            let mut filter = Filter::new();
            if let Some(limit) = limit {
                filter = filter.limit(limit);
            }
            run_query(config, filter, cli.timeout, cli.first).await?;
        }
        Command::QueryMetadata { pubkey } => {
            let author = author_or_self(&config, pubkey.as_deref())?;
            let filter = Filter::new()
                .authors(vec![author])
                .kinds(vec![KIND_METADATA]);
            run_query(config, filter, cli.timeout, cli.first).await?;
        }
        Command::QueryNotes { pubkey } => {
            let author = author_or_self(&config, pubkey.as_deref())?;
            let filter = Filter::new()
                .authors(vec![author])
                .kinds(vec![KIND_SHORT_TEXT_NOTE]);
            run_query(config, filter, cli.timeout, cli.first).await?;
        }
        Command::QueryEvent { event_id } => {
            let filter = Filter::new().ids(vec![event_id]);
            run_query(config, filter, cli.timeout, true).await?;
        }
        Command::QueryAuthor { pubkey } => {
            let author = author_or_self(&config, pubkey.as_deref())?;
            run_query(config, Filter::new().authors(vec![author]), cli.timeout, cli.first).await?;
        }
        Command::Follow { kinds, author } => {
            let mut filter = Filter::new().since(nostr::unix_now());
            if !kinds.is_empty() {
                filter = filter.kinds(kinds);
            }
            if let Some(author) = author {
                filter = filter.authors(vec![parse_pubkey(&author)?]);
            }
            config.auto_reconnect = true;
            follow(config, filter).await?;
        }
    }

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn load_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match &cli.env {
        Some(path) => SessionConfig::from_env_file(path)?,
        None => {
            // A missing ./.env is fine.
            let _ = dotenvy::dotenv();
            SessionConfig::from_env()?
        }
    };
    if !cli.relays.is_empty() {
        config.relays = cli.relays.clone();
    }
    Ok(config)
}

async fn connect(config: SessionConfig) -> Result<RelayPool> {
    if config.relays.is_empty() {
        bail!("no relays configured (set {} or pass --relay)", ENV_RELAY_URL);
    }
    let pool = RelayPool::new(config)?;

    for (url, result) in pool.connect().await {
        if let Err(e) = result {
            warn!("Could not connect to {}: {}", url, e);
        }
    }
    if pool.connected_count() == 0 {
        bail!("could not connect to any relay");
    }
    Ok(pool)
}

async fn finish_publish(pool: &RelayPool, report: PublishReport) -> Result<()> {
    for confirmation in report.accepted() {
        info!(
            "{} accepted {} {}",
            confirmation.relay_url, confirmation.event_id, confirmation.message
        );
    }
    pool.disconnect_all().await;

    if !report.is_success() {
        bail!("no relay accepted event {}", report.event_id());
    }
    println!("{}", report.event_id());
    Ok(())
}

async fn run_query(config: SessionConfig, filter: Filter, timeout: u64, first: bool) -> Result<()> {
    let pool = connect(config).await?;
    let wait = Duration::from_secs(timeout);

    let events: Vec<Event> = if first {
        let mut subscription = pool.fetch(vec![filter]).await?;
        let found = tokio::time::timeout(wait, subscription.next())
            .await
            .unwrap_or(Ok(None))?;
        subscription.close().await;
        found.into_iter().collect()
    } else {
        pool.query(vec![filter], wait).await?
    };

    info!("{} events", events.len());
    for event in &events {
        print_event(event)?;
    }
    pool.disconnect_all().await;
    Ok(())
}

async fn follow(config: SessionConfig, filter: Filter) -> Result<()> {
    let pool = connect(config).await?;
    let mut subscription = pool.subscribe(vec![filter]).await?;
    info!("Following {} (Ctrl-C to stop)", subscription.id());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            next = subscription.next() => match next? {
                Some(event) => print_event(&event)?,
                None => break,
            },
        }
    }

    subscription.close().await;
    pool.disconnect_all().await;
    Ok(())
}

fn print_event(event: &Event) -> Result<()> {
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}

fn author_or_self(config: &SessionConfig, pubkey: Option<&str>) -> Result<String> {
    match pubkey {
        Some(pubkey) => parse_pubkey(pubkey),
        None => Ok(config
            .require_keys()
            .context("no public key given")?
            .public_key()
            .to_string()),
    }
}

/// Accept a public key as `npub1...` or 64 hex characters.
fn parse_pubkey(input: &str) -> Result<String> {
    let input = input.trim();
    if input.starts_with("npub1") {
        return Ok(hex::encode(decode_npub(input)?));
    }
    if input.len() != 64 || hex::decode(input).is_err() {
        bail!("expected npub1... or 64 hex characters, got {:?}", input);
    }
    Ok(input.to_ascii_lowercase())
}
