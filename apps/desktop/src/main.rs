use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use client_core::{ChatClient, ClientConfig, ClientError, ClientEvent, Message};
use shared::domain::{GroupId, UserId, DEFAULT_GROUP_ID};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::{self, error::RecvError},
};
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    server_url: String,
    #[arg(long)]
    username: String,
    #[arg(long, default_value_t = DEFAULT_GROUP_ID.0)]
    group_id: i64,
    /// Post as "Anonymous" until toggled with /anon.
    #[arg(long)]
    anonymous: bool,
    #[arg(long, default_value_t = 3000)]
    poll_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();
    let args = Args::parse();

    let config = ClientConfig {
        group_id: GroupId(args.group_id),
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        ..ClientConfig::default()
    };
    let client = ChatClient::connect(&args.server_url, config)?;
    let events = client.subscribe_events();
    let session = client.login(&args.username).await?;
    println!(
        "Logged in as {} (user_id={}) in group {}. Type /help for commands.",
        session.user.name, session.user.id, session.group_id
    );

    let printer = tokio::spawn(print_events(events, session.user.id));
    run_prompt(&client, args.anonymous).await?;

    client.logout().await;
    printer.abort();
    Ok(())
}

async fn run_prompt(client: &Arc<ChatClient>, mut anonymous: bool) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "/quit" => break,
            "/help" => {
                println!("/anon     toggle anonymous posting");
                println!("/who      show who is online");
                println!("/history  reprint the conversation");
                println!("/group N  switch to group N");
                println!("/quit     leave");
            }
            "/anon" => {
                anonymous = !anonymous;
                println!("anonymous posting {}", if anonymous { "on" } else { "off" });
            }
            "/who" => match client.presence().await {
                Some(report) => {
                    println!("{} online", report.online_count);
                    for member in &report.members {
                        println!("  {} ({:?})", member.name, member.presence);
                    }
                    if let Some(session) = client.session().await {
                        if report.presence_of(session.user.id).is_none() {
                            println!("  (you are not listed as a member of this group)");
                        }
                    }
                }
                None => println!("presence not loaded yet"),
            },
            "/history" => {
                for message in client.messages().await {
                    print_message(&message);
                }
            }
            command if command.starts_with("/group ") => {
                match command["/group ".len()..].trim().parse::<i64>() {
                    Ok(group_id) => client.switch_group(GroupId(group_id)).await?,
                    Err(_) => println!("usage: /group <id>"),
                }
            }
            "" => {}
            text => match client.send(text, anonymous).await {
                Ok(_) | Err(ClientError::EmptyMessage) => {}
                Err(err) => error!(error = %err, "message was not delivered"),
            },
        }
    }
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<ClientEvent>, me: UserId) {
    loop {
        match events.recv().await {
            Ok(ClientEvent::MessagesMerged { messages, .. }) => {
                for message in messages.iter().filter(|m| m.author.user_id != me) {
                    print_message(message);
                }
            }
            Ok(ClientEvent::SendConfirmed { message, .. }) => print_message(&message),
            Ok(ClientEvent::SendFailed { provisional_id, error }) => {
                println!("! {provisional_id} failed: {error}");
            }
            Ok(ClientEvent::PresenceUpdated(report)) => {
                debug!(online = report.online_count, "presence updated");
            }
            Ok(ClientEvent::Error(message)) => warn!(%message, "sync error"),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_message(message: &Message) {
    let marker = if message.is_pending() { "*" } else { " " };
    println!(
        "{marker}[{}] {}: {}",
        message.created_at.format("%H:%M:%S"),
        message.display_name(),
        message.text
    );
}
