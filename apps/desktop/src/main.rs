use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    load_settings, load_settings_from, EventKind, FileSessionStore, SendOutcome, SessionEvent,
    SyncContext, SyncEvent,
};
use shared::domain::ChannelId;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Settings file; defaults to `client.toml` in the working directory.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    push_url: Option<String>,
    #[arg(long)]
    session_file: Option<PathBuf>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long, default_value_t = 1)]
    channel: i64,
    /// Skip the websocket and sync by polling only.
    #[arg(long)]
    no_push: bool,
    #[arg(long)]
    logout: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => load_settings_from(path),
        None => load_settings(),
    };
    if let Some(server_url) = args.server_url.clone() {
        settings.server_url = server_url;
    }
    if let Some(push_url) = args.push_url.clone() {
        settings.push_url = Some(push_url);
    }
    if let Some(session_file) = args.session_file.clone() {
        settings.session_file = Some(session_file);
    }

    let session_file = settings.resolved_session_file()?;
    let store = Arc::new(
        FileSessionStore::open(&session_file)
            .with_context(|| format!("failed to open session file {}", session_file.display()))?,
    );
    let ctx = SyncContext::connect(settings, store)?;
    ctx.start();

    if args.logout {
        ctx.auth().restore_from_store();
        ctx.auth().logout().await;
        println!("Logged out");
        return Ok(());
    }

    let mut session_events = ctx.auth().subscribe();
    if !ctx.auth().restore_from_store() {
        let (Some(username), Some(password)) = (args.username.as_deref(), args.password.as_deref())
        else {
            anyhow::bail!("no stored session; pass --username and --password");
        };
        let user = ctx
            .auth()
            .sign_in(username, password)
            .await
            .context("sign in failed")?;
        println!("Signed in as {}", user.username);
    }

    if !args.no_push {
        if let Some(transport) = ctx.transport() {
            if let Err(err) = transport.connect().await {
                warn!(error = %err, "desktop: push unavailable, syncing by polling");
            }
        }
    }

    let mut events = ctx.events().channel(&EventKind::ALL);
    let mut channel = ChannelId(args.channel);
    ctx.coordinator().join(channel).await;
    println!("Type a message and press enter. /join <id> switches channel, /quit exits.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(event) = events.recv() => print_event(&event),
            session = session_events.recv() => {
                if let Ok(SessionEvent::LoginRequired(reason)) = session {
                    println!("Session ended ({reason:?}); sign in again.");
                    break;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" {
                    break;
                }
                if let Some(raw) = line.strip_prefix("/join ") {
                    match raw.trim().parse() {
                        Ok(id) => {
                            channel = ChannelId(id);
                            ctx.coordinator().join(channel).await;
                        }
                        Err(_) => println!("Not a channel id: {raw}"),
                    }
                    continue;
                }
                if let SendOutcome::Failed(err) = ctx.coordinator().send_message(channel, line).await {
                    println!("Not sent: {}", err.server_message().unwrap_or("network unavailable"));
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    ctx.shutdown().await;
    Ok(())
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::ChannelJoined { channel_id, mode } => {
            println!("-- joined #{channel_id} via {mode:?}")
        }
        SyncEvent::MessageAdded(message) => println!(
            "[#{}] {}: {}",
            message.channel_id,
            message.author_username.as_deref().unwrap_or("?"),
            message.content
        ),
        SyncEvent::MessageEdited(message) => {
            println!("[#{}] (edited {}) {}", message.channel_id, message.id, message.content)
        }
        SyncEvent::MessageDeleted {
            channel_id,
            message_id,
        } => println!("[#{channel_id}] message {message_id} deleted"),
        SyncEvent::TypingStart {
            user_id, username, ..
        } => println!(
            "   {} is typing...",
            username.clone().unwrap_or_else(|| user_id.to_string())
        ),
        SyncEvent::TypingStop { .. } => {}
        SyncEvent::PresenceChanged {
            user_id, online, ..
        } => println!(
            "   user {user_id} is {}",
            if *online { "online" } else { "offline" }
        ),
        SyncEvent::MessageSendError { error, .. } => println!("!! send failed: {error}"),
        SyncEvent::SyncDegraded {
            consecutive_failures,
            ..
        } => println!("!! sync degraded after {consecutive_failures} failed polls, retrying"),
        SyncEvent::SyncRestored { .. } => println!("-- sync restored"),
        SyncEvent::TransportChanged { mode } => println!("-- now syncing via {mode:?}"),
    }
}
