//! Interactive chat loop

use anyhow::{Context, Result};
use console::style;
use dialoguer::Input;
use parlor_client::{
    rate_message, CancellationToken, ChatBackend, StreamConsumer, TranscriptObserver,
    TranscriptUpdate, TurnOutcome,
};
use parlor_core::config::Config;
use parlor_core::session::{Message, Rating, SessionStore, Transcript};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Slash commands accepted at the chat prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    New,
    Sessions,
    Switch(String),
    Delete(String),
    Rename(String),
    Rate { score: u8, comment: Option<String> },
    Export,
    Help,
    Quit,
}

impl SlashCommand {
    /// Parse a prompt line; `Ok(None)` means it is a chat message
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let Some(rest) = line.trim().strip_prefix('/') else {
            return Ok(None);
        };
        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };

        let command = match name {
            "new" => Self::New,
            "sessions" | "ls" => Self::Sessions,
            "switch" | "sw" => Self::Switch(required(args, "/switch <number|id>")?),
            "delete" | "rm" => Self::Delete(required(args, "/delete <number|id>")?),
            "rename" => Self::Rename(required(args, "/rename <name>")?),
            "rate" => {
                let (score, comment) = match args.split_once(char::is_whitespace) {
                    Some((score, comment)) => (score, Some(comment.trim().to_string())),
                    None => (args, None),
                };
                let score = score
                    .parse::<u8>()
                    .map_err(|_| "usage: /rate <1-5> [comment]".to_string())?;
                Self::Rate {
                    score,
                    comment: comment.filter(|c| !c.is_empty()),
                }
            }
            "export" => Self::Export,
            "help" | "?" => Self::Help,
            "quit" | "exit" | "q" => Self::Quit,
            other => return Err(format!("unknown command /{} (try /help)", other)),
        };
        Ok(Some(command))
    }
}

fn required(args: &str, usage: &str) -> Result<String, String> {
    if args.is_empty() {
        Err(format!("usage: {}", usage))
    } else {
        Ok(args.to_string())
    }
}

/// Resolve a 1-based list position or a session id
fn resolve_session(store: &SessionStore, target: &str) -> Option<String> {
    if store.get(target).is_some() {
        return Some(target.to_string());
    }
    let position = target.parse::<usize>().ok()?.checked_sub(1)?;
    store.sessions().get(position).map(|s| s.id.clone())
}

/// Prints a streamed reply as it arrives
#[derive(Debug, Default)]
pub(crate) struct StreamPrinter {
    opened: AtomicBool,
}

impl TranscriptObserver for StreamPrinter {
    fn on_update(&self, transcript: &Transcript, update: TranscriptUpdate<'_>) {
        let mut out = std::io::stdout().lock();
        let _ = match update {
            TranscriptUpdate::Started { .. } => {
                self.opened.store(true, Ordering::Relaxed);
                write!(out, "{} ", style("assistant:").cyan().bold())
            }
            TranscriptUpdate::Appended { content, .. } => {
                if !self.opened.swap(true, Ordering::Relaxed) {
                    let _ = write!(out, "{} ", style("assistant:").cyan().bold());
                }
                write!(out, "{}", content)
            }
            TranscriptUpdate::Completed { .. } => {
                self.opened.store(false, Ordering::Relaxed);
                writeln!(out)
            }
            TranscriptUpdate::Failed { index } => {
                let opened = self.opened.swap(false, Ordering::Relaxed);
                let text = &transcript.messages()[index].text;
                if opened {
                    writeln!(out, "\n{}", style(text).red())
                } else {
                    writeln!(out, "{} {}", style("assistant:").cyan().bold(), style(text).red())
                }
            }
        };
        let _ = out.flush();
    }
}

fn print_message(message: &Message) {
    if message.is_user {
        println!("{} {}", style("you:").green().bold(), message.text);
        return;
    }
    match message.feedback_given {
        Some(rating) => println!(
            "{} {} {}",
            style("assistant:").cyan().bold(),
            message.text,
            style(format!("[rated {}/5]", rating.score())).dim()
        ),
        None => println!("{} {}", style("assistant:").cyan().bold(), message.text),
    }
}

/// State of an interactive chat
pub struct ChatRepl {
    store: SessionStore,
    transcript: Transcript,
    consumer: StreamConsumer,
    backend: Arc<ChatBackend>,
    greeting: String,
    export_dir: PathBuf,
}

impl ChatRepl {
    pub fn new(store: SessionStore, backend: Arc<ChatBackend>, config: &Config) -> Self {
        let consumer = StreamConsumer::new(backend.clone())
            .with_max_message_chars(config.chat.max_message_chars);
        let transcript = Transcript::from_messages(store.active().messages.clone());
        Self {
            store,
            transcript,
            consumer,
            backend,
            greeting: config.chat.greeting.clone(),
            export_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Run until `/quit` or end of input, then flush the transcript
    pub async fn run(&mut self) -> Result<()> {
        println!("{}", style("Type a message, or /help for commands.").dim());
        self.render();

        while let Some(line) = read_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match SlashCommand::parse(line) {
                Ok(None) => self.send(line).await?,
                Ok(Some(SlashCommand::Quit)) => break,
                Ok(Some(command)) => {
                    if let Err(e) = self.handle(command).await {
                        println!("{} {:#}", style("error:").red().bold(), e);
                    }
                }
                Err(usage) => println!("{}", style(usage).yellow()),
            }
        }

        self.store
            .save_active(self.transcript.snapshot())
            .context("Failed to save the active session")?;
        info!(session_id = %self.store.active_id(), "Chat closed");
        Ok(())
    }

    async fn send(&mut self, text: &str) -> Result<()> {
        let session_id = self.store.active_id().to_string();
        let cancel = CancellationToken::new();
        let printer = StreamPrinter::default();

        let result = {
            let send = self
                .consumer
                .send(text, &session_id, &mut self.transcript, &printer, &cancel);
            tokio::pin!(send);
            loop {
                tokio::select! {
                    result = &mut send => break result,
                    _ = tokio::signal::ctrl_c() => {
                        debug!("Interrupt received, cancelling reply");
                        cancel.cancel();
                    }
                }
            }
        };

        match result {
            Ok(TurnOutcome::Completed { .. }) => {
                println!("{}", style("Rate this reply with /rate <1-5>").dim())
            }
            Ok(TurnOutcome::Cancelled) => println!("\n{}", style("(reply cancelled)").dim()),
            Ok(TurnOutcome::Ended { .. }) => println!(),
            Ok(TurnOutcome::Failed { .. }) => {}
            Err(e) => println!("{}", style(e).yellow()),
        }

        self.store.save_active(self.transcript.snapshot())?;
        Ok(())
    }

    async fn handle(&mut self, command: SlashCommand) -> Result<()> {
        match command {
            SlashCommand::New => {
                self.store.create_session(self.transcript.snapshot())?;
                self.transcript = Transcript::new();
                self.render();
            }
            SlashCommand::Sessions => self.list_sessions(),
            SlashCommand::Switch(target) => {
                let id = self.resolve(&target)?;
                match self.store.switch_session(&id, self.transcript.snapshot())? {
                    Some(messages) => {
                        self.transcript = Transcript::from_messages(messages);
                        self.render();
                    }
                    None => println!("{}", style("Already in that session.").dim()),
                }
            }
            SlashCommand::Delete(target) => {
                let id = self.resolve(&target)?;
                match self.store.delete_session(&id, self.backend.as_ref()).await {
                    Ok(Some(messages)) => {
                        self.transcript = Transcript::from_messages(messages);
                        self.render();
                    }
                    Ok(None) => println!("{}", style("Session deleted.").green()),
                    Err(parlor_core::Error::LastSession) => println!(
                        "{}",
                        style("At least one session must remain. Create another one first.")
                            .red()
                            .bold()
                    ),
                    Err(e) => return Err(e.into()),
                }
            }
            SlashCommand::Rename(name) => {
                let id = self.store.active_id().to_string();
                self.store.rename_session(&id, &name)?;
                println!("{} {}", style("Renamed to").green(), name.trim());
            }
            SlashCommand::Rate { score, comment } => {
                let rating = Rating::new(score)?;
                let Some(index) = self.transcript.latest_rateable() else {
                    println!("{}", style("There is no finished reply left to rate.").yellow());
                    return Ok(());
                };
                let session_id = self.store.active_id().to_string();
                rate_message(
                    &mut self.transcript,
                    index,
                    rating,
                    comment.as_deref(),
                    &session_id,
                    &self.backend,
                )
                .await?;
                self.store.save_active(self.transcript.snapshot())?;
                println!("{}", style("Thanks for the feedback!").green());
            }
            SlashCommand::Export => {
                let today = chrono::Local::now().date_naive();
                let path = self.backend.export_to_file(&self.export_dir, today).await?;
                println!("{} {}", style("History exported to").green(), path.display());
            }
            SlashCommand::Help => print_help(),
            SlashCommand::Quit => {}
        }
        Ok(())
    }

    fn resolve(&self, target: &str) -> Result<String> {
        resolve_session(&self.store, target)
            .with_context(|| format!("No session matches '{}' (see /sessions)", target))
    }

    fn list_sessions(&self) {
        for (position, summary) in self.store.sessions().iter().enumerate() {
            let marker = if summary.id == self.store.active_id() {
                style("*").green().bold()
            } else {
                style(" ")
            };
            println!(
                "{} {:>2}. {} {} ({} messages, {})",
                marker,
                position + 1,
                style(&summary.name).bold(),
                style(&summary.id).dim(),
                summary.message_count,
                summary.created_at.format("%Y-%m-%d %H:%M")
            );
        }
    }

    fn render(&self) {
        println!(
            "\n{}",
            style(format!("── {} ──", self.store.active().name)).bold()
        );
        println!("{} {}", style("assistant:").cyan().bold(), self.greeting);
        for message in self.transcript.messages() {
            print_message(message);
        }
    }
}

fn print_help() {
    let commands = [
        ("/new", "start a new session"),
        ("/sessions", "list sessions"),
        ("/switch <n|id>", "switch to another session"),
        ("/delete <n|id>", "delete a session"),
        ("/rename <name>", "rename the current session"),
        ("/rate <1-5> [comment]", "rate the latest reply"),
        ("/export", "download the conversation history"),
        ("/quit", "save and exit"),
    ];
    for (command, description) in commands {
        println!("  {:<24} {}", style(command).cyan(), description);
    }
    println!("  {}", style("Ctrl-C while a reply streams stops it.").dim());
}

async fn read_line() -> Result<Option<String>> {
    let line = tokio::task::spawn_blocking(|| {
        Input::<String>::new()
            .with_prompt("you")
            .allow_empty(true)
            .interact_text()
    })
    .await?;

    match line {
        Ok(line) => Ok(Some(line)),
        Err(e) => {
            debug!("Input closed: {}", e);
            Ok(None)
        }
    }
}
