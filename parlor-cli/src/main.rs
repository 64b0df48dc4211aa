//! CLI entry point for parlor

mod chat;

use anyhow::{bail, Context, Result};
use chat::{ChatRepl, StreamPrinter};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Input};
use parlor_client::{CancellationToken, ChatBackend, StreamConsumer, TurnOutcome};
use parlor_core::config::{Config, ConfigLoader};
use parlor_core::logging::init_logging;
use parlor_core::session::{FileBlobStore, SessionStore, Transcript};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "parlor")]
#[command(about = "Terminal client for a streaming chat backend")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration directory
    #[arg(short, long, global = true)]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration file
    Init,
    /// Start an interactive chat (the default)
    Chat,
    /// Send one message and print the reply
    Send {
        /// Message to send
        #[arg(short, long)]
        message: String,
        /// Session to send it in (defaults to the most recent one)
        #[arg(short, long)]
        session: Option<String>,
    },
    /// Manage local sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Download the backend's conversation history
    Export {
        /// Output directory
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
    /// Check that the backend is reachable
    Health,
    /// Show backend conversation statistics
    Stats,
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List sessions, newest first
    List,
    /// Start a new empty session
    New,
    /// Delete a session
    Delete {
        /// Session id
        id: String,
    },
    /// Rename a session
    Rename {
        /// Session id
        id: String,
        /// New name
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loader = match &cli.config_dir {
        Some(dir) => ConfigLoader::with_dir(dir),
        None => ConfigLoader::new(),
    };

    if let Some(Commands::Init) = cli.command {
        return run_init(&loader);
    }

    let mut config = loader
        .load()
        .with_context(|| format!("Failed to load {}", loader.config_path().display()))?;
    config.logging.dir = expand_tilde(&config.logging.dir).display().to_string();
    let _guard = init_logging(&config.logging);

    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Init => run_init(&loader),
        Commands::Chat => run_chat(&config).await,
        Commands::Send { message, session } => run_send(&config, &message, session).await,
        Commands::Sessions { command } => run_sessions(&config, command).await,
        Commands::Export { dir } => run_export(&config, dir).await,
        Commands::Health => run_health(&config).await,
        Commands::Stats => run_stats(&config).await,
    }
}

fn run_init(loader: &ConfigLoader) -> Result<()> {
    println!("{}", style("Welcome to parlor!").bold().cyan());
    println!();

    let config_path = loader.config_path();
    if config_path.exists() {
        let overwrite = Confirm::new()
            .with_prompt(format!(
                "Configuration already exists at {}. Overwrite?",
                config_path.display()
            ))
            .default(false)
            .interact()?;
        if !overwrite {
            println!("{}", style("Keeping existing configuration.").yellow());
            return Ok(());
        }
    }

    let mut config = Config::default();
    config.backend.base_url = Input::new()
        .with_prompt("Backend URL")
        .default(config.backend.base_url)
        .interact_text()?;

    loader.save(&config)?;
    println!(
        "{} {}",
        style("Configuration saved to").green(),
        config_path.display()
    );
    Ok(())
}

async fn run_chat(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let backend = Arc::new(ChatBackend::from_config(&config.backend)?);
    info!(backend = %backend.base_url(), "Starting chat");

    ChatRepl::new(store, backend, config).run().await
}

async fn run_send(config: &Config, message: &str, session: Option<String>) -> Result<()> {
    let mut store = open_store(config)?;
    if let Some(id) = session {
        let current = store.active().messages.clone();
        store
            .switch_session(&id, current)
            .with_context(|| format!("Unknown session '{}'", id))?;
    }

    let backend = Arc::new(ChatBackend::from_config(&config.backend)?);
    let consumer =
        StreamConsumer::new(backend).with_max_message_chars(config.chat.max_message_chars);
    let session_id = store.active_id().to_string();
    let mut transcript = Transcript::from_messages(store.active().messages.clone());

    let outcome = consumer
        .send(
            message,
            &session_id,
            &mut transcript,
            &StreamPrinter::default(),
            &CancellationToken::new(),
        )
        .await?;
    store.save_active(transcript.snapshot())?;

    if let TurnOutcome::Ended { .. } = outcome {
        println!();
    }
    Ok(())
}

async fn run_sessions(config: &Config, command: SessionCommands) -> Result<()> {
    let mut store = open_store(config)?;

    match command {
        SessionCommands::List => {
            for summary in store.sessions() {
                let marker = if summary.id == store.active_id() { "*" } else { " " };
                println!(
                    "{} {}  {}  {} messages  {}",
                    style(marker).green().bold(),
                    style(&summary.id).dim(),
                    style(&summary.name).bold(),
                    summary.message_count,
                    summary.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        SessionCommands::New => {
            let current = store.active().messages.clone();
            let id = store.create_session(current)?;
            println!("{} {}", style("Created session").green(), id);
        }
        SessionCommands::Delete { id } => {
            let backend = ChatBackend::from_config(&config.backend)?;
            match store.delete_session(&id, &backend).await {
                Ok(_) => println!("{} {}", style("Deleted session").green(), id),
                Err(parlor_core::Error::LastSession) => {
                    bail!("At least one session must remain. Create another one first.")
                }
                Err(e) => return Err(e.into()),
            }
        }
        SessionCommands::Rename { id, name } => {
            store.rename_session(&id, &name)?;
            println!("{} {}", style("Renamed session").green(), id);
        }
    }
    Ok(())
}

async fn run_export(config: &Config, dir: PathBuf) -> Result<()> {
    let backend = ChatBackend::from_config(&config.backend)?;
    let today = chrono::Local::now().date_naive();
    let path = backend
        .export_to_file(&dir, today)
        .await
        .context("Failed to export chat history")?;
    println!("{} {}", style("History exported to").green(), path.display());
    Ok(())
}

async fn run_health(config: &Config) -> Result<()> {
    let backend = ChatBackend::from_config(&config.backend)?;
    let health = backend
        .health()
        .await
        .with_context(|| format!("Backend at {} is not reachable", backend.base_url()))?;

    println!(
        "{} {} ({})",
        style("Backend").bold(),
        style(&health.status).green(),
        health.service.as_deref().unwrap_or(backend.base_url())
    );
    Ok(())
}

async fn run_stats(config: &Config) -> Result<()> {
    let backend = ChatBackend::from_config(&config.backend)?;
    let stats = backend.stats().await.context("Failed to fetch statistics")?;

    println!("{}", style("Backend statistics").bold().cyan());
    println!("  Active sessions in memory: {}", stats.active_memory_sessions);
    println!("  Sessions:                  {}", stats.total_sessions);
    println!("  Conversations:             {}", stats.total_conversations);
    println!("  Conversations today:       {}", stats.today_conversations);
    Ok(())
}

fn open_store(config: &Config) -> Result<SessionStore> {
    let dir = expand_tilde(&config.storage.dir);
    SessionStore::bootstrap(FileBlobStore::new(&dir))
        .with_context(|| format!("Failed to open session storage at {}", dir.display()))
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
