use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use client_core::{load_settings, ClientEvent, MessagingClient, StaticAuth};
use shared::domain::{ThreadId, UserId};
use tracing::info;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from client.toml / APP__SERVER_URL.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: String,
    #[arg(long, env = "APP_TOKEN")]
    token: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the user's threads.
    Threads,
    /// Print the newest page of a thread.
    History { thread_id: String },
    /// Send a text message to a thread.
    Send { thread_id: String, text: String },
    /// Open a thread and print live events until interrupted.
    Watch { thread_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    let auth = Arc::new(StaticAuth::new(UserId::new(args.user_id), args.token));
    let (client, router) = MessagingClient::connect(settings, auth).await?;
    info!(user_id = %client.user_id(), "desktop: connected");

    match args.command {
        Command::Threads => {
            for thread in client.list_threads().await? {
                let names: Vec<String> = thread
                    .participants
                    .iter()
                    .map(|user| user.name.clone().unwrap_or_else(|| user.id.to_string()))
                    .collect();
                println!(
                    "{}  [{}]  unread={}",
                    thread.id,
                    names.join(", "),
                    thread.unread_count
                );
            }
        }
        Command::History { thread_id } => {
            let engine = client.open_thread(&ThreadId::new(thread_id)).await?;
            for entry in engine.entries().await {
                println!(
                    "{} {:>10} {:?}: {}",
                    entry.message.created_at.format("%Y-%m-%d %H:%M"),
                    entry.message.sender_id.as_str(),
                    entry.delivery_state(),
                    entry.plaintext
                );
            }
        }
        Command::Send { thread_id, text } => {
            let thread_id = ThreadId::new(thread_id);
            client.open_thread(&thread_id).await?;
            let sent = client.send_message(&thread_id, &text, None).await?;
            println!(
                "sent id={}",
                sent.id.map(|id| id.to_string()).unwrap_or_default()
            );
        }
        Command::Watch { thread_id } => {
            let thread_id = ThreadId::new(thread_id);
            let mut events = client.subscribe_events();
            client.open_thread(&thread_id).await?;
            println!("watching {thread_id}, ctrl-c to stop");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(ClientEvent::RealtimeDisconnected) | Err(_) => break,
                        Ok(event) => print_event(&client, event).await,
                    },
                }
            }
            client.close_thread(&thread_id).await;
        }
    }

    router.abort();
    Ok(())
}

async fn print_event(client: &MessagingClient, event: ClientEvent) {
    match event {
        ClientEvent::ThreadUpdated { thread_id, outcome } => {
            let Some(engine) = client.thread(&thread_id).await else {
                return;
            };
            if let Some(entry) = engine.entries().await.last() {
                println!(
                    "[{outcome:?}] {}: {}",
                    entry.message.sender_id, entry.plaintext
                );
            }
        }
        ClientEvent::TypingChanged { typing, .. } if !typing.is_empty() => {
            let names: Vec<String> = typing.iter().map(ToString::to_string).collect();
            println!("{} typing...", names.join(", "));
        }
        ClientEvent::PresenceChanged(state) => {
            println!("{} is {:?}", state.user_id, state.status);
        }
        ClientEvent::KeyUnavailable { reason } => println!("encryption key unavailable: {reason}"),
        ClientEvent::SendFailed { reason, .. } | ClientEvent::ActionFailed { reason } => {
            println!("failed: {reason}");
        }
        ClientEvent::Error(message) => println!("server error: {message}"),
        _ => {}
    }
}
