use crate::error::SyncError;
use crate::session::ChatSession;
use crate::types::{DeliveryState, InboundMessage, Message, UserId, UserRef};
use colored::*;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use uuid::Uuid;

/// One line typed at the console
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Open(UserId),
    Close,
    Inbox,
    Show,
    Notes,
    Retry(Uuid),
    Help,
    Quit,
    Say(String),
    Invalid(String),
}

pub fn parse_command(line: &str) -> ConsoleCommand {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return ConsoleCommand::Say(line.to_string());
    };
    let mut parts = rest.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim).unwrap_or_default();

    match name {
        "open" => match arg.parse::<UserId>() {
            Ok(peer) => ConsoleCommand::Open(peer),
            Err(_) => ConsoleCommand::Invalid("Usage: /open <user_id>".to_string()),
        },
        "close" => ConsoleCommand::Close,
        "inbox" => ConsoleCommand::Inbox,
        "show" => ConsoleCommand::Show,
        "notes" => ConsoleCommand::Notes,
        "retry" => match Uuid::parse_str(arg) {
            Ok(client_ref) => ConsoleCommand::Retry(client_ref),
            Err(_) => ConsoleCommand::Invalid("Usage: /retry <message_ref>".to_string()),
        },
        "help" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => ConsoleCommand::Invalid(format!("Unknown command: /{}", other)),
    }
}

pub fn print_usage() {
    println!("{}", "⚡ chatsync console".bright_cyan().bold());
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  {} <user_id>     Open a conversation and load its history", "/open".cyan());
    println!("  {}               Close the open conversation", "/close".cyan());
    println!("  {}               List conversations and unread counts", "/inbox".cyan());
    println!("  {}                Print the open conversation", "/show".cyan());
    println!("  {}               List active notifications", "/notes".cyan());
    println!("  {} <message_ref> Resend a failed message", "/retry".cyan());
    println!("  {}                Log out and exit", "/quit".cyan());
    println!("  Anything else is sent to the open conversation.");
}

fn print_message(message: &Message, self_id: UserId) {
    let who = if message.sender_id == self_id {
        "me".green().bold()
    } else {
        message.sender_id.to_string().cyan().bold()
    };
    let state = match message.delivery_state {
        DeliveryState::Confirmed => "".normal(),
        DeliveryState::Optimistic => " (sending)".dimmed(),
        DeliveryState::Failed => match message.client_ref {
            Some(client_ref) => format!(" (failed, /retry {})", client_ref).red(),
            None => " (failed)".red(),
        },
    };
    println!(
        "  {} {}: {}{}",
        message.timestamp.format("%H:%M").to_string().dimmed(),
        who,
        message.content,
        state
    );
}

/// Read commands from stdin until `/quit` or end of input
pub async fn run(session: &ChatSession) -> anyhow::Result<()> {
    run_with(session, BufReader::new(tokio::io::stdin())).await
}

/// Run the console over any line source. The extra message subscriber lives only as
/// long as the console does.
pub async fn run_with<R>(session: &ChatSession, input: R) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let me = session
        .user()
        .ok_or_else(|| anyhow::anyhow!("Session is not running"))?;

    // Second subscriber on the message topic; it shares the session's connection.
    let watcher = session.clone();
    let self_id = me.id;
    let watch = session.channel().subscribe_json(
        &session.config().message_topic,
        move |event: InboundMessage| {
            if watcher.active_conversation() == Some(event.counterpart(self_id).id)
                && event.sender.id != self_id
            {
                print_message(&Message::from(&event), self_id);
            }
        },
    );

    let result = read_commands(session, &me, input).await;
    session.channel().unsubscribe(watch);
    result
}

async fn read_commands<R>(session: &ChatSession, me: &UserRef, input: R) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    print_usage();
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        match parse_command(&line) {
            ConsoleCommand::Open(peer) => {
                if let Some(load) = session.open_conversation(Some(peer)) {
                    let _ = load.await;
                }
                println!("{} Conversation with {}", "✓".green().bold(), peer.to_string().cyan());
                for message in session.messages(peer) {
                    print_message(&message, me.id);
                }
            }
            ConsoleCommand::Close => {
                session.open_conversation(None);
            }
            ConsoleCommand::Inbox => {
                println!(
                    "{} {} unread",
                    "Inbox:".bright_white().bold(),
                    session.total_unread().to_string().yellow()
                );
                for row in session.inbox() {
                    let badge = if row.unread_count > 0 {
                        format!(" [{}]", row.unread_count).yellow().bold()
                    } else {
                        "".normal()
                    };
                    println!(
                        "  {} {}{}  {}",
                        row.peer_id.to_string().cyan(),
                        row.peer_name,
                        badge,
                        row.last_preview.dimmed()
                    );
                }
            }
            ConsoleCommand::Show => match session.active_conversation() {
                Some(peer) => {
                    for message in session.messages(peer) {
                        print_message(&message, me.id);
                    }
                }
                None => println!("{}", "No conversation open".yellow()),
            },
            ConsoleCommand::Notes => {
                for note in session.notifications().active() {
                    println!("  {} {}", "•".yellow(), note.text);
                }
            }
            ConsoleCommand::Retry(client_ref) => {
                let Some(peer) = session.active_conversation() else {
                    println!("{}", "No conversation open".yellow());
                    continue;
                };
                if let Err(e) = session.retry(peer, client_ref) {
                    eprintln!("{} {}", "✗".red().bold(), e.to_string().red());
                }
            }
            ConsoleCommand::Help => print_usage(),
            ConsoleCommand::Quit => break,
            ConsoleCommand::Say(text) => {
                let Some(peer) = session.active_conversation() else {
                    println!("{}", "Open a conversation first: /open <user_id>".yellow());
                    continue;
                };
                match session.send(peer, &text) {
                    Ok(_) => {}
                    Err(SyncError::InvalidInput(_)) => {}
                    Err(e) => eprintln!("{} {}", "✗".red().bold(), e.to_string().red()),
                }
            }
            ConsoleCommand::Invalid(reason) => eprintln!("{}", reason.yellow()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command("/open 42"), ConsoleCommand::Open(42));
        assert_eq!(parse_command(" /close "), ConsoleCommand::Close);
        assert_eq!(parse_command("/quit"), ConsoleCommand::Quit);
        assert_eq!(
            parse_command("is it still for sale?"),
            ConsoleCommand::Say("is it still for sale?".to_string())
        );
        assert!(matches!(parse_command("/open bob"), ConsoleCommand::Invalid(_)));
        assert!(matches!(parse_command("/frobnicate"), ConsoleCommand::Invalid(_)));
    }

    #[test]
    fn test_parse_retry_ref() {
        let id = Uuid::new_v4();
        assert_eq!(parse_command(&format!("/retry {}", id)), ConsoleCommand::Retry(id));
        assert!(matches!(parse_command("/retry nope"), ConsoleCommand::Invalid(_)));
    }
}
