//! Courier CLI
//!
//! Thin wrapper around courier-core for command-line usage. Doubles as the
//! external job runner the engine expects: `courier sync run` is the
//! scheduled-sync trigger, `courier serve` a long-lived driver.
//!
//! ## Usage
//!
//! ```bash
//! # Show node information
//! courier info
//!
//! # Show or publish the device identity
//! courier identity show
//! courier identity publish
//!
//! # Create a conversation with one or more peers
//! courier conversation create <peer_id> [<peer_id>...]
//!
//! # List conversations
//! courier conversation list
//!
//! # Manage membership (rotates the session key)
//! courier conversation add-member <conversation_id> <peer_id>
//! courier conversation remove-member <conversation_id> <peer_id>
//!
//! # Send a message
//! courier message send <conversation_id> "hello"
//!
//! # Show a conversation's timeline
//! courier message timeline <conversation_id>
//!
//! # Resend a failed message
//! courier message resend <message_id>
//!
//! # One-shot scheduled sync (for cron/job runners)
//! courier sync run
//!
//! # Run as a persistent syncing client
//! courier serve --interval 30
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use courier_core::{
    ConversationId, CourierEngine, EngineConfig, EngineEvent, MessageBody, MessageId, PeerId,
};

/// Courier - offline-first encrypted chat sync
#[derive(Parser)]
#[command(name = "courier")]
#[command(version = "0.1.0")]
#[command(about = "Courier - offline-first encrypted chat sync")]
#[command(
    long_about = "An offline-first chat client engine: messages stay readable and sendable \
                  with no connectivity, and an untrusted relay delivers ciphertext it cannot read."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.courier/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Relay base URL (overrides config.json)
    #[arg(short, long, global = true)]
    relay_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node information
    Info,

    /// Identity management
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },

    /// Conversation management
    Conversation {
        #[command(subcommand)]
        action: ConversationAction,
    },

    /// Message operations
    Message {
        #[command(subcommand)]
        action: MessageAction,
    },

    /// Sync operations
    Sync {
        #[command(subcommand)]
        action: SyncAction,
    },

    /// Run as a persistent syncing client
    Serve {
        /// Seconds between scheduled sync runs
        #[arg(short, long, default_value = "30")]
        interval: u64,
    },
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Show the device's peer id and key fingerprint
    Show,
    /// Publish the public key bundle to the relay
    Publish,
}

#[derive(Subcommand)]
enum ConversationAction {
    /// Create a conversation with the given peers
    Create {
        /// Participant peer ids
        #[arg(required = true)]
        peers: Vec<String>,
    },
    /// List all conversations
    List,
    /// Show conversation details
    Show {
        /// Conversation ID
        conversation_id: String,
    },
    /// Delete a conversation (local only; the relay is unaffected)
    Delete {
        /// Conversation ID
        conversation_id: String,
    },
    /// Add a participant (supersedes the session key)
    AddMember {
        /// Conversation ID
        conversation_id: String,
        /// Peer to add
        peer_id: String,
    },
    /// Remove a participant (supersedes the session key)
    RemoveMember {
        /// Conversation ID
        conversation_id: String,
        /// Peer to remove
        peer_id: String,
    },
    /// Force a session key rotation
    RotateKey {
        /// Conversation ID
        conversation_id: String,
    },
}

#[derive(Subcommand)]
enum MessageAction {
    /// Enqueue a text message for delivery
    Send {
        /// Conversation ID
        conversation_id: String,
        /// Message text
        text: String,
    },
    /// Show the conversation timeline
    Timeline {
        /// Conversation ID
        conversation_id: String,
        /// Only entries after this server position
        #[arg(short, long, default_value = "0")]
        after: u64,
    },
    /// Resend a failed message
    Resend {
        /// Message ID
        message_id: String,
    },
}

#[derive(Subcommand)]
enum SyncAction {
    /// Run one scheduled sync pass (for cron/job runners)
    Run,
    /// Show sync status and outbox counts
    Status,
}

fn setup_logging(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".courier")
        .join("data")
}

/// Assemble the engine config: config.json in the data dir, then flags.
fn load_config(data_dir: PathBuf, relay_url: Option<String>) -> EngineConfig {
    let config_path = data_dir.join("config.json");
    let mut config = EngineConfig::load(&config_path).unwrap_or_default();
    config.data_dir = data_dir;
    if let Some(relay_url) = relay_url {
        config.relay_url = relay_url;
    }
    config
}

fn parse_conversation_id(s: &str) -> Result<ConversationId> {
    ConversationId::from_string(s)
        .map_err(|e| anyhow::anyhow!("invalid conversation id '{}': {}", s, e))
}

fn parse_message_id(s: &str) -> Result<MessageId> {
    MessageId::from_string(s).map_err(|e| anyhow::anyhow!("invalid message id '{}': {}", s, e))
}

fn format_timestamp(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let config = load_config(data_dir, cli.relay_url);
    let engine = CourierEngine::new(config.clone()).await?;

    match cli.command {
        Commands::Info => {
            let conversations = engine.list_conversations()?;
            println!("Courier v0.1.0");
            println!();
            println!("Identity:");
            println!("  Peer ID: {}", engine.peer_id());
            println!();
            println!("Relay: {}", config.relay_url);
            println!("Data directory: {}", config.data_dir.display());
            println!("Conversations: {}", conversations.len());
            println!("Status: {}", engine.status());
        }

        Commands::Identity { action } => match action {
            IdentityAction::Show => {
                let bundle = engine.public_bundle();
                println!("Identity:");
                println!("  Peer ID: {}", engine.peer_id());
                println!("  Fingerprint: {}", bundle.fingerprint());
                println!("  X25519 key: {}", hex::encode(bundle.x25519));
                println!("  ML-KEM key size: {} bytes", bundle.mlkem.len());
            }
            IdentityAction::Publish => {
                engine.publish_identity().await?;
                println!("Published key bundle for {}", engine.peer_id());
            }
        },

        Commands::Conversation { action } => match action {
            ConversationAction::Create { peers } => {
                let peers: Vec<PeerId> =
                    peers.into_iter().map(PeerId::from_string).collect();
                let conversation = engine.create_conversation(peers).await?;
                println!("Created conversation {}", conversation.id);
                if conversation.active_session.is_none() {
                    println!("(session establishment deferred until the relay is reachable)");
                }
            }
            ConversationAction::List => {
                let conversations = engine.list_conversations()?;
                if conversations.is_empty() {
                    println!("No conversations.");
                }
                for conversation in conversations {
                    println!(
                        "{}  {} participants  created {}",
                        conversation.id,
                        conversation.participants.len(),
                        format_timestamp(conversation.created_at),
                    );
                }
            }
            ConversationAction::Show { conversation_id } => {
                let id = parse_conversation_id(&conversation_id)?;
                let conversation = engine.conversation(&id)?;
                println!("Conversation {}", conversation.id);
                println!("  Created: {}", format_timestamp(conversation.created_at));
                println!("  Cursor: {}", engine.cursor(&id)?);
                match conversation.active_session {
                    Some(key_id) => println!("  Session key: {}", key_id),
                    None => println!("  Session key: (none established)"),
                }
                println!("  Participants:");
                for peer in &conversation.participants {
                    let marker = if *peer == engine.peer_id() { " (me)" } else { "" };
                    println!("    {}{}", peer, marker);
                }
            }
            ConversationAction::Delete { conversation_id } => {
                let id = parse_conversation_id(&conversation_id)?;
                engine.delete_conversation(&id)?;
                println!("Deleted conversation {} (local only)", id);
            }
            ConversationAction::AddMember {
                conversation_id,
                peer_id,
            } => {
                let id = parse_conversation_id(&conversation_id)?;
                let conversation = engine
                    .add_participant(&id, PeerId::from_string(peer_id))
                    .await?;
                println!(
                    "Conversation {} now has {} participants (session key rotated)",
                    id,
                    conversation.participants.len()
                );
            }
            ConversationAction::RemoveMember {
                conversation_id,
                peer_id,
            } => {
                let id = parse_conversation_id(&conversation_id)?;
                let peer = PeerId::from_string(peer_id);
                let conversation = engine.remove_participant(&id, &peer).await?;
                println!(
                    "Conversation {} now has {} participants (session key rotated)",
                    id,
                    conversation.participants.len()
                );
            }
            ConversationAction::RotateKey { conversation_id } => {
                let id = parse_conversation_id(&conversation_id)?;
                engine.rotate_session(&id).await?;
                println!("Rotated session key for conversation {}", id);
            }
        },

        Commands::Message { action } => match action {
            MessageAction::Send {
                conversation_id,
                text,
            } => {
                let id = parse_conversation_id(&conversation_id)?;
                engine.notify_connectivity_changed(true).await.ok();
                let message_id = engine.enqueue(id, MessageBody::text(text)).await?;
                println!("Enqueued message {}", message_id);
                // Drive one sync pass so a reachable relay gets it now
                engine.run_scheduled_sync().await?;
                let delivered = engine
                    .timeline(&id, 0)?
                    .iter()
                    .any(|i| i.message.id == message_id && i.message.server_position.is_some());
                if delivered {
                    println!("Delivered.");
                } else {
                    println!("Pending; will deliver on the next sync.");
                }
            }
            MessageAction::Timeline {
                conversation_id,
                after,
            } => {
                let id = parse_conversation_id(&conversation_id)?;
                let items = engine.timeline(&id, after)?;
                if items.is_empty() {
                    println!("No messages.");
                }
                let me = engine.peer_id();
                for item in items {
                    let position = item
                        .message
                        .server_position
                        .map(|p| format!("#{}", p))
                        .unwrap_or_else(|| "--".to_string());
                    let who = if item.message.sender == me {
                        "me".to_string()
                    } else {
                        item.message.sender.to_string()
                    };
                    let body = match item.text() {
                        Some(text) => text.to_string(),
                        None => "(unreadable: key expired or corrupt)".to_string(),
                    };
                    println!(
                        "{:>4} [{}] {} {}: {}",
                        position,
                        item.message.state,
                        format_timestamp(item.message.created_at),
                        who,
                        body
                    );
                }
            }
            MessageAction::Resend { message_id } => {
                let id = parse_message_id(&message_id)?;
                engine.notify_connectivity_changed(true).await.ok();
                engine.resend_failed(&id).await?;
                engine.run_scheduled_sync().await?;
                println!("Resent message {}", id);
            }
        },

        Commands::Sync { action } => match action {
            SyncAction::Run => {
                engine.notify_connectivity_changed(true).await.ok();
                let report = engine.run_scheduled_sync().await?;
                println!(
                    "Sync complete: {} pulled, {} sent, {} failed, {} released by watchdog",
                    report.pulled, report.sent, report.failed, report.released
                );
            }
            SyncAction::Status => {
                println!("Status: {}", engine.status());
                for conversation in engine.list_conversations()? {
                    let cursor = engine.cursor(&conversation.id)?;
                    let pending = engine
                        .timeline(&conversation.id, 0)?
                        .iter()
                        .filter(|i| i.message.state.awaits_transmission())
                        .count();
                    println!(
                        "  {}  cursor {}  {} pending",
                        conversation.id, cursor, pending
                    );
                }
            }
        },

        Commands::Serve { interval } => {
            engine.start()?;
            engine.publish_identity().await.ok();
            engine.notify_connectivity_changed(true).await.ok();
            println!("Serving as {} (ctrl-c to stop)", engine.peer_id());

            let mut events = engine.subscribe();
            let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        println!("Shutting down.");
                        engine.shutdown();
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = engine.run_scheduled_sync().await {
                            tracing::warn!("Scheduled sync failed: {}", e);
                        }
                    }
                    event = events.recv() => {
                        match event {
                            Ok(EngineEvent::TimelineUpdated { conversation_id, .. }) => {
                                println!("[{}] timeline updated", conversation_id);
                            }
                            Ok(EngineEvent::MessageStateChanged { message_id, state, .. }) => {
                                println!("[{}] -> {}", message_id, state);
                            }
                            Ok(EngineEvent::ConnectivityChanged { online }) => {
                                println!("connectivity: {}", if online { "online" } else { "offline" });
                            }
                            Ok(EngineEvent::SessionEstablished { conversation_id, .. }) => {
                                println!("[{}] session established", conversation_id);
                            }
                            Ok(EngineEvent::SyncError { message, .. }) => {
                                eprintln!("sync error: {}", message);
                            }
                            Err(_) => {}
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
