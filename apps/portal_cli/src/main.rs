use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use client_core::{
    config::load_settings,
    realtime::{ChatEvent, ChatSession},
    ClientEvent, PortalClient,
};
use shared::{
    domain::{ConversationId, MessageId},
    protocol::LoginCredentials,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "THOGMi portal client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        email: String,
        password: String,
    },
    Logout,
    Whoami,
    Conversations,
    /// Join a conversation's live chat. Lines from stdin are sent as
    /// messages; `/typing`, `/read <id>` and `/quit` are commands.
    Chat {
        conversation_id: i64,
    },
    /// Post into a conversation over REST.
    Send {
        conversation_id: i64,
        text: String,
    },
    Notifications {
        #[arg(long)]
        watch: bool,
    },
    Branches,
    Live,
}

impl Command {
    fn needs_session(&self) -> bool {
        !matches!(
            self,
            Command::Login { .. } | Command::Logout | Command::Branches | Command::Live
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let cli = Cli::parse();
    let client = PortalClient::from_settings(load_settings())?;

    if cli.command.needs_session() {
        let Some(user) = client.auth().restore().await else {
            bail!("not logged in; run `portal_cli login <email> <password>` first");
        };
        debug!(email = %user.email, "session restored");
    }

    match cli.command {
        Command::Login { email, password } => {
            let user = client
                .login(&LoginCredentials {
                    email,
                    password,
                    user_type: None,
                })
                .await?;
            println!("logged in as {} <{}>", user.display_name(), user.email);
        }
        Command::Logout => {
            client.logout().await;
            println!("logged out");
        }
        Command::Whoami => {
            let user = client.auth().profile().await?;
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        Command::Conversations => {
            for conversation in client.communications().conversations().await? {
                println!(
                    "{:>6}  {}  ({} participants)",
                    conversation.id, conversation.subject, conversation.participant_count
                );
            }
        }
        Command::Chat { conversation_id } => {
            let session = client.open_conversation(ConversationId(conversation_id));
            run_chat(&client, &session).await?;
            session.close();
        }
        Command::Send {
            conversation_id,
            text,
        } => {
            let message = client
                .communications()
                .send_conversation_message(ConversationId(conversation_id), &text)
                .await?;
            println!("sent message {}", message.id);
        }
        Command::Notifications { watch } => {
            if watch {
                watch_notifications(&client).await?;
            } else {
                let summary = client.notifications().summary().await?;
                print_summary(summary.total_unread, summary.active_conversations.len());
            }
        }
        Command::Branches => {
            for branch in client.public().branches().await? {
                println!("{:<24} {}", branch.slug, branch.name);
            }
        }
        Command::Live => {
            for stream in client.public().live_streams().await? {
                println!(
                    "{} [{}] {} viewers  {}",
                    stream.title, stream.branch.name, stream.viewers, stream.stream_url
                );
            }
        }
    }

    Ok(())
}

async fn run_chat(client: &PortalClient, session: &ChatSession) -> Result<()> {
    let mut chat_events = BroadcastStream::new(session.subscribe());
    let mut client_events = BroadcastStream::new(client.subscribe_events());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_input(session, line.trim()) {
                    break;
                }
            }
            Some(Ok(event)) = chat_events.next() => print_chat_event(event),
            Some(Ok(event)) = client_events.next() => {
                if let ClientEvent::Toast(toast) = event {
                    eprintln!("[{}] {}", toast.title, toast.description);
                }
            }
        }
    }
    Ok(())
}

/// Returns false when the user asked to leave.
fn handle_input(session: &ChatSession, line: &str) -> bool {
    match line.split_once(' ').unwrap_or((line, "")) {
        ("/quit", _) => return false,
        ("/typing", _) => {
            session.send_typing_indicator(true);
        }
        ("/read", id) => match id.trim().parse::<i64>() {
            Ok(id) => {
                if !session.send_read_receipt(MessageId(id)) {
                    eprintln!("not connected; receipt dropped");
                }
            }
            Err(_) => eprintln!("usage: /read <message id>"),
        },
        _ if line.is_empty() => {}
        _ => {
            if !session.send_message(line) {
                eprintln!("not connected; message dropped");
            }
        }
    }
    true
}

fn print_chat_event(event: ChatEvent) {
    match event {
        ChatEvent::Message(message) => {
            println!("{} {}: {}", message.created_at.format("%H:%M"), message.sender_name, message.content)
        }
        ChatEvent::History(history) => {
            for message in history {
                println!("{} {}: {}", message.created_at.format("%H:%M"), message.sender_name, message.content);
            }
        }
        ChatEvent::Typing { user, is_typing } => {
            if is_typing {
                println!("{} is typing...", user.name);
            }
        }
        ChatEvent::ReadReceipt { message_id, user } => println!("{} read {}", user.name, message_id),
        ChatEvent::StatusChanged(status) => {
            eprintln!("* {:?} (attempts: {})", status.state, status.reconnect_attempts)
        }
        ChatEvent::ConnectionError(err) => warn!("chat connection error: {err}"),
        ChatEvent::ReconnectFailed => eprintln!("* gave up reconnecting; press Enter to exit"),
    }
}

async fn watch_notifications(client: &PortalClient) -> Result<()> {
    let (_handle, mut state) = client.notifications().watch();
    loop {
        tokio::select! {
            changed = state.changed() => {
                changed?;
                let current = state.borrow_and_update().clone();
                match (current.data, current.error) {
                    (_, Some(err)) => warn!("notification refresh failed: {err}"),
                    (Some(summary), None) => {
                        print_summary(summary.total_unread, summary.active_conversations.len())
                    }
                    (None, None) => {}
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

fn print_summary(unread: usize, conversations: usize) {
    if unread == 0 {
        println!("no unread messages ({conversations} conversations)");
    } else {
        println!("{unread} unread messages across {conversations} conversations");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn public_commands_skip_session_restore() {
        let cli = Cli::try_parse_from(["portal_cli", "branches"]).unwrap();
        assert!(!cli.command.needs_session());
        let cli = Cli::try_parse_from(["portal_cli", "notifications", "--watch"]).unwrap();
        assert!(cli.command.needs_session());
    }
}
