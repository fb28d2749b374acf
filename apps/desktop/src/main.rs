use anyhow::{anyhow, Result};
use clap::Parser;
use client_core::SessionClient;
use shared::{domain::UserId, protocol::EventKind};
use tracing::{info, warn};

mod config;

use config::load_settings;

#[derive(Parser, Debug)]
struct Args {
    /// Base URL of the attendance server; overrides config and env.
    #[arg(long)]
    server_url: Option<String>,
    /// Bearer token; overrides config and env.
    #[arg(long)]
    token: Option<String>,
    /// Open the conversation with this user id and select it.
    #[arg(long)]
    peer: Option<i64>,
    /// One-shot message to send into the opened conversation.
    #[arg(long)]
    message: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let settings = load_settings();
    let server_url = args.server_url.unwrap_or(settings.server_url);
    let token = args
        .token
        .or(settings.auth_token)
        .ok_or_else(|| anyhow!("no credential: pass --token or set AUTH_TOKEN"))?;

    let client = SessionClient::new();
    for kind in [
        EventKind::NewMessage,
        EventKind::NewConversation,
        EventKind::UserOnline,
        EventKind::UserOffline,
        EventKind::Notification,
    ] {
        client.on(kind, |event| {
            if let Ok(line) = serde_json::to_string(event) {
                println!("{line}");
            }
        });
    }

    let mut status = client.status_watch();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow();
            info!(status = ?current, "connection status changed");
        }
    });

    client.initialize(&server_url, &token).await?;

    if let Err(err) = client.hydrate_conversations().await {
        warn!(error = %err, "conversation hydration failed, realtime events still flow");
    }

    if let Some(peer) = args.peer {
        let conversation_id = client.open_conversation_with(UserId(peer)).await?;
        client.select_conversation(Some(conversation_id)).await;
        if let Some(text) = args.message {
            client.send_message(conversation_id, text).await;
        }
    }

    info!("listening for realtime events, ctrl-c to exit");
    tokio::signal::ctrl_c().await?;
    client.disconnect().await;
    Ok(())
}
