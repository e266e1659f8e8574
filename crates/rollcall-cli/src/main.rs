use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{
    parse_code, Descriptor, DescriptorMatcher, EnrolledIdentity, QrKey, RosterEntry,
};
use rollcall_kiosk::{KioskConfig, OfflineQueue};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall check-in kiosk tools")]
struct Cli {
    /// TOML config file (defaults plus ROLLCALL_* overrides when absent)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or edit the offline submission queue
    Queue {
        /// Queue database (overrides the configured path)
        #[arg(long)]
        db: Option<PathBuf>,

        #[command(subcommand)]
        action: QueueAction,
    },
    /// Match a query descriptor against a roster file
    Match {
        /// JSON array of roster entries with stored descriptors
        #[arg(long)]
        roster: PathBuf,
        /// JSON descriptor: a bare array or {"descriptor": [...]}
        #[arg(long)]
        query: PathBuf,
        /// Minimum confidence percentage (defaults to the configured threshold)
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Show which roster key a scanned code refers to
    Qr {
        code: String,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum QueueAction {
    /// List pending submissions, oldest first
    List,
    /// Print the number of pending submissions
    Len,
    /// Drop a pending submission by id
    Remove {
        id: Uuid,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QueryFile {
    Values(Vec<f32>),
    Object { descriptor: Vec<f32> },
}

fn load_config(path: Option<&Path>) -> Result<KioskConfig> {
    let config = match path {
        Some(path) => KioskConfig::from_toml_file(path)?,
        None => KioskConfig::from_env(),
    };
    config.validate()?;
    Ok(config)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

async fn run_queue(db: &Path, action: QueueAction) -> Result<()> {
    let queue = OfflineQueue::open(db)
        .await
        .with_context(|| format!("opening queue at {}", db.display()))?;

    match action {
        QueueAction::List => {
            let pending = queue.list().await?;
            if pending.is_empty() {
                println!("Offline queue is empty");
                return Ok(());
            }
            for item in pending {
                println!(
                    "{}  {}  event={}  attempts={}  queued={}{}",
                    item.id,
                    item.identity_id,
                    item.event_id,
                    item.attempt_count,
                    item.enqueued_at.to_rfc3339(),
                    item.last_error
                        .as_deref()
                        .map(|e| format!("  last_error={e}"))
                        .unwrap_or_default(),
                );
            }
        }
        QueueAction::Len => println!("{}", queue.length().await?),
        QueueAction::Remove { id } => {
            if !queue.remove(id).await? {
                bail!("no pending submission with id {id}");
            }
            tracing::info!(submission = %id, "removed from offline queue");
            println!("Removed {id}");
        }
    }
    Ok(())
}

fn run_match(roster: &Path, query: &Path, threshold: f32) -> Result<()> {
    let entries: Vec<RosterEntry> = read_json(roster)?;
    let loaded_at = chrono::Utc::now();
    let identities: Vec<EnrolledIdentity> = entries
        .into_iter()
        .filter_map(|entry| {
            let Some(values) = entry.descriptor else {
                eprintln!("skipping {}: no stored descriptor", entry.id);
                return None;
            };
            Some(EnrolledIdentity {
                id: entry.id,
                account_id: entry.account_id,
                display_name: entry.display_name,
                descriptor: Descriptor::new(values),
                enrolled_at: entry.enrolled_at.unwrap_or(loaded_at),
            })
        })
        .collect();

    let matcher = DescriptorMatcher::build(identities);
    if matcher.is_empty() {
        bail!("roster has no usable descriptors");
    }

    let query = match read_json::<QueryFile>(query)? {
        QueryFile::Values(values) | QueryFile::Object { descriptor: values } => {
            Descriptor::new(values)
        }
    };

    match matcher.find_match(&query, threshold) {
        Some(found) => println!(
            "{} ({}) confidence {:.1}%",
            found.display_name, found.identity_id, found.confidence
        ),
        None => println!(
            "No match at or above {threshold:.1}% among {} identities",
            matcher.len()
        ),
    }
    Ok(())
}

fn run_qr(code: &str) -> Result<()> {
    match parse_code(code)? {
        QrKey::Participant(id) => println!("participant {id}"),
        QrKey::Account(id) => println!("account {id}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Queue { db, action } => {
            let db = db.unwrap_or_else(|| config.queue_db_path.clone());
            run_queue(&db, action).await?;
        }
        Commands::Match {
            roster,
            query,
            threshold,
        } => run_match(&roster, &query, threshold.unwrap_or(config.match_threshold))?,
        Commands::Qr { code } => run_qr(&code)?,
        Commands::Config => println!("{}", serde_json::to_string_pretty(&config)?),
    }

    Ok(())
}
