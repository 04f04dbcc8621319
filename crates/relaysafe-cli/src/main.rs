//! RelaySafe CLI
//!
//! Thin wrapper around relaysafe-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Create a PIN-protected vault
//! relaysafe --pin 1234 init
//!
//! # Generate an owner key
//! relaysafe --pin 1234 key generate "Personal"
//!
//! # Store a secret on every configured relay
//! relaysafe --pin 1234 secret add "Bank" "hunter2" --tag finance
//!
//! # List secrets and their replication
//! relaysafe --pin 1234 secret list
//!
//! # Repair under-replicated secrets
//! relaysafe --pin 1234 sync
//!
//! # Retry writes that no relay accepted
//! relaysafe --pin 1234 queue retry
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use relaysafe_core::{SafeEngine, SafeError, SaveOutcome, VaultMode};

/// RelaySafe - encrypted secrets on public relays
#[derive(Parser)]
#[command(name = "relaysafe")]
#[command(version = "0.1.0")]
#[command(about = "RelaySafe - encrypted secrets on public relays")]
#[command(
    long_about = "Stores end-to-end encrypted secrets as self-addressed events on a set of relays, queues writes while offline and repairs replication across relays."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.relaysafe/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Vault PIN
    #[arg(long, global = true, env = "RELAYSAFE_PIN", hide_env_values = true)]
    pin: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new vault
    Init {
        /// Store the vault without PIN protection
        #[arg(long)]
        no_pin: bool,
    },

    /// Show vault, relay and queue status
    Info,

    /// Owner key management
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// Relay list management
    Relay {
        #[command(subcommand)]
        action: RelayAction,
    },

    /// Secret management
    Secret {
        #[command(subcommand)]
        action: SecretAction,
    },

    /// Repair replication across relays
    Sync {
        /// Only repair this secret
        #[arg(long)]
        event: Option<String>,
    },

    /// Offline write queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// PIN protection
    Pin {
        #[command(subcommand)]
        action: PinAction,
    },
}

#[derive(Subcommand)]
enum KeyAction {
    /// Generate a new key
    Generate {
        /// Display name
        name: String,
        /// Color tag
        #[arg(long)]
        color: Option<String>,
    },
    /// Import an nsec or hex secret key
    Import {
        /// Display name
        name: String,
        /// Secret key (nsec1... or 64 hex chars)
        secret: String,
        /// Color tag
        #[arg(long)]
        color: Option<String>,
    },
    /// List keys
    List,
    /// Rename a key
    Rename {
        /// Key id
        id: String,
        /// New name
        name: String,
    },
    /// Make a key the default
    Default {
        /// Key id
        id: String,
    },
    /// Remove a key
    Remove {
        /// Key id
        id: String,
    },
}

#[derive(Subcommand)]
enum RelayAction {
    /// Add a relay
    Add {
        /// ws:// or wss:// URL
        url: String,
    },
    /// Remove a relay
    Remove {
        /// Relay URL
        url: String,
    },
    /// List relays
    List,
}

#[derive(Subcommand)]
enum SecretAction {
    /// Encrypt and publish a secret
    Add {
        /// Title
        title: String,
        /// Secret value
        content: String,
        /// Tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Key id or public key (default key if omitted)
        #[arg(long)]
        key: Option<String>,
    },
    /// List secrets from all relays
    List {
        /// Show tombstoned secrets instead
        #[arg(long)]
        deleted: bool,
    },
    /// Decrypt and print a secret
    Show {
        /// Event id
        id: String,
    },
    /// Tombstone a secret and request deletion from relays
    Delete {
        /// Event id
        id: String,
        /// Key that owns the secret, if it cannot be fetched
        #[arg(long)]
        key: Option<String>,
    },
    /// Lift a tombstone
    Restore {
        /// Event id
        id: String,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Show queued writes
    Status,
    /// Retry queued writes now
    Retry {
        /// Reset and retry one exhausted item
        id: Option<String>,
    },
}

#[derive(Subcommand)]
enum PinAction {
    /// Turn on PIN protection (or change the PIN)
    Enable {
        /// New PIN
        new_pin: String,
    },
    /// Turn off PIN protection
    Disable,
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory (~/.relaysafe/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".relaysafe")
        .join("data")
}

fn format_millis(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}

/// Unlock the vault with the PIN from the command line if it needs one
fn unlock(engine: &SafeEngine, pin: Option<&str>) -> Result<()> {
    match engine.vault_mode()? {
        None => anyhow::bail!("No vault found. Run: relaysafe init"),
        Some(VaultMode::Pin) if pin.is_none() => {
            anyhow::bail!("Vault is PIN protected. Pass --pin or set RELAYSAFE_PIN")
        }
        Some(_) => {}
    }

    match engine.unlock(pin) {
        Ok(report) => {
            if !report.repairs.is_empty() {
                eprintln!("Vault repaired on load:");
                for repair in &report.repairs {
                    eprintln!("  - {}", repair);
                }
            }
            Ok(())
        }
        Err(SafeError::AuthenticationFailed { remaining_attempts }) => anyhow::bail!(
            "Incorrect PIN ({} attempts left before the vault is wiped)",
            remaining_attempts
        ),
        Err(SafeError::VaultWiped) => {
            anyhow::bail!("Too many incorrect PINs. The vault has been wiped.")
        }
        Err(e) => Err(e.into()),
    }
}

/// Refresh from relays, reporting instead of failing when none answer
async fn refresh(engine: &SafeEngine) {
    match engine.refresh().await {
        Ok(result) => {
            for (relay, error) in &result.relay_errors {
                eprintln!("warning: {} failed: {}", relay, error);
            }
        }
        Err(SafeError::NoRelaysConfigured) => {
            eprintln!("warning: no relays configured");
        }
        Err(e) => eprintln!("warning: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let engine = SafeEngine::open(&data_dir)
        .with_context(|| format!("Failed to open data directory {}", data_dir.display()))?;
    let pin = cli.pin.as_deref();

    let result = run(&engine, cli.command, pin, &data_dir).await;
    engine.shutdown().await;
    result
}

async fn run(
    engine: &SafeEngine,
    command: Commands,
    pin: Option<&str>,
    data_dir: &std::path::Path,
) -> Result<()> {
    match command {
        Commands::Init { no_pin } => {
            if engine.vault_exists()? {
                anyhow::bail!("A vault already exists in {}", data_dir.display());
            }
            if no_pin {
                engine.create_vault(None)?;
                println!("Vault created (no PIN).");
            } else {
                let pin = pin.context("A PIN is required. Pass --pin or use --no-pin")?;
                engine.create_vault(Some(pin))?;
                println!("Vault created (PIN protected).");
            }
            println!("Next: relaysafe key generate <name>");
        }

        Commands::Info => {
            println!("RelaySafe v0.1.0");
            println!();
            println!("Vault:");
            match engine.vault_mode()? {
                Some(mode) => {
                    println!("  Mode: {}", mode);
                    if mode == VaultMode::Pin {
                        println!("  PIN attempts left: {}", engine.remaining_pin_attempts()?);
                    }
                }
                None => println!("  (not created)"),
            }
            println!();
            println!("Relays:");
            let relays = engine.relays();
            if relays.is_empty() {
                println!("  (none)");
            }
            for relay in relays {
                println!("  {}", relay);
            }
            println!();
            let queue = engine.queue_snapshot();
            println!(
                "Queue: {} pending, {} exhausted",
                queue.pending, queue.exhausted
            );
            println!("Data directory: {}", data_dir.display());
        }

        Commands::Key { action } => {
            unlock(engine, pin)?;
            match action {
                KeyAction::Generate { name, color } => {
                    let key = engine.generate_key(&name, color)?;
                    println!("Key generated:");
                    println!("  ID: {}", key.id);
                    println!("  Public key: {}", key.public_key);
                }
                KeyAction::Import {
                    name,
                    secret,
                    color,
                } => {
                    let key = engine.import_key(&name, &secret, color)?;
                    println!("Key imported:");
                    println!("  ID: {}", key.id);
                    println!("  Public key: {}", key.public_key);
                }
                KeyAction::List => {
                    let keys = engine.keys();
                    if keys.is_empty() {
                        println!("No keys. Create one with: relaysafe key generate <name>");
                    }
                    for key in keys {
                        let marker = if key.is_default { "*" } else { " " };
                        println!("{} {}  {}", marker, key.id, key.name);
                        println!("    {}", key.public_key);
                        if let Some(color) = key.color {
                            println!("    color: {}", color);
                        }
                    }
                }
                KeyAction::Rename { id, name } => {
                    engine.rename_key(&id, &name)?;
                    println!("Key renamed.");
                }
                KeyAction::Default { id } => {
                    engine.set_default_key(&id)?;
                    println!("Default key set.");
                }
                KeyAction::Remove { id } => {
                    let removed = engine.remove_key(&id)?;
                    println!("Key '{}' removed.", removed.name);
                }
            }
        }

        Commands::Relay { action } => match action {
            RelayAction::Add { url } => {
                if engine.add_relay(&url)? {
                    println!("Relay added.");
                } else {
                    println!("Relay already configured.");
                }
            }
            RelayAction::Remove { url } => {
                if engine.remove_relay(&url)? {
                    println!("Relay removed.");
                } else {
                    println!("Relay not configured.");
                }
            }
            RelayAction::List => {
                let relays = engine.relays();
                if relays.is_empty() {
                    println!("No relays configured.");
                }
                for relay in relays {
                    println!("{}", relay);
                }
            }
        },

        Commands::Secret { action } => {
            unlock(engine, pin)?;
            match action {
                SecretAction::Add {
                    title,
                    content,
                    tags,
                    key,
                } => match engine.save(&title, &content, tags, key.as_deref()).await? {
                    SaveOutcome::Published { event_id, relays } => {
                        println!("Secret saved to {} relays.", relays.len());
                        println!("  ID: {}", event_id);
                    }
                    SaveOutcome::Queued { queue_id, event_id } => {
                        println!("No relay accepted the secret; it was queued.");
                        println!("  ID: {}", event_id);
                        println!("  Queue item: {}", queue_id);
                    }
                },
                SecretAction::List { deleted } => {
                    refresh(engine).await;
                    let secrets = if deleted {
                        engine.deleted_secrets()
                    } else {
                        engine.secrets()
                    };
                    if secrets.is_empty() {
                        println!("No secrets.");
                    }
                    for secret in secrets {
                        let status = engine.sync_status(&secret.id);
                        let replication = status
                            .map(|s| format!("{:.0}%", s.replication_percent))
                            .unwrap_or_default();
                        println!("{}  {}", secret.id, secret.title);
                        println!(
                            "    relays: {} ({})  tags: {}",
                            secret.relays.len(),
                            replication,
                            secret.tags.join(", ")
                        );
                        if let Some(error) = &secret.hydration_error {
                            println!("    unreadable: {}", error);
                        }
                    }
                }
                SecretAction::Show { id } => {
                    refresh(engine).await;
                    let secret = engine
                        .secret(&id)
                        .ok_or_else(|| anyhow::anyhow!("Secret not found: {}", id))?;
                    let last_opened = engine.last_opened(&id);
                    let value = engine.reveal(&id)?;
                    println!("Title: {}", secret.title);
                    if !secret.tags.is_empty() {
                        println!("Tags: {}", secret.tags.join(", "));
                    }
                    if let Some(at) = last_opened {
                        println!("Last opened: {}", format_millis(at));
                    }
                    println!();
                    println!("{}", value.as_str());
                }
                SecretAction::Delete { id, key } => {
                    if key.is_none() {
                        refresh(engine).await;
                    }
                    if engine.delete_secret(&id, key.as_deref()).await? {
                        println!("Secret deleted.");
                    } else {
                        println!("Secret hidden locally; deletion request queued.");
                    }
                }
                SecretAction::Restore { id } => {
                    if engine.restore_secret(&id)? {
                        println!("Secret restored.");
                    } else {
                        println!("Secret was not deleted.");
                    }
                }
            }
        }

        Commands::Sync { event } => {
            unlock(engine, pin)?;
            engine.refresh().await?;
            let reports = match event {
                Some(id) => vec![engine.sync_one(&id).await?],
                None => engine.sync_all().await?,
            };
            if reports.is_empty() {
                println!("Every secret is on every relay.");
            }
            for report in reports {
                println!(
                    "{}: {} repaired, {} failed",
                    report.event_id,
                    report.succeeded.len(),
                    report.failed.len()
                );
                for (relay, error) in &report.failed {
                    println!("    {}: {}", relay, error);
                }
            }
        }

        Commands::Queue { action } => match action {
            QueueAction::Status => {
                let items = engine.queue_items();
                if items.is_empty() {
                    println!("Queue is empty.");
                }
                for item in items {
                    let state = if item.exhausted { "exhausted" } else { "pending" };
                    println!("{}  {}  kind {}", item.id, state, item.kind);
                    println!("    event: {}", item.event_id);
                    println!(
                        "    queued: {}  retries: {}",
                        format_millis(item.enqueued_at),
                        item.retry_count
                    );
                    if let Some(error) = item.last_error {
                        println!("    last error: {}", error);
                    }
                }
            }
            QueueAction::Retry { id } => {
                unlock(engine, pin)?;
                if let Some(id) = id {
                    if !engine.retry_queued(&id)? {
                        anyhow::bail!("Queue item {} is not exhausted or does not exist", id);
                    }
                }
                let report = engine.process_queue(true).await;
                println!(
                    "Delivered: {}  Failed: {}  Exhausted: {}  Skipped: {}",
                    report.delivered.len(),
                    report.failed.len(),
                    report.exhausted.len(),
                    report.skipped
                );
            }
        },

        Commands::Pin { action } => {
            unlock(engine, pin)?;
            match action {
                PinAction::Enable { new_pin } => {
                    engine.enable_pin(&new_pin)?;
                    println!("PIN protection enabled.");
                }
                PinAction::Disable => {
                    engine.disable_pin()?;
                    println!("PIN protection disabled.");
                }
            }
        }
    }

    Ok(())
}
