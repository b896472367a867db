use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use client_core::{Composer, FeedController, FeedUpdate, RemoteBackendClient, SessionController};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::warn;

mod config;

use config::load_settings;

#[derive(Parser, Debug)]
struct Args {
    /// Hosted backend base URL; overrides the settings file.
    #[arg(long)]
    server_url: Option<String>,
    /// Display name hint forwarded to the sign-in flow.
    #[arg(long)]
    display_name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(display_name) = args.display_name {
        settings.display_name = Some(display_name);
    }

    let client = Arc::new(RemoteBackendClient::with_display_name_hint(
        &settings.server_url,
        settings.display_name.clone(),
    )?);

    let sessions = SessionController::new(client.clone());
    let Some(session) = sessions.establish().await else {
        println!("Sign-in did not complete; staying signed out.");
        return Ok(());
    };
    println!("Signed in as {}", session.username);

    let feed = Arc::new(FeedController::new(client, &session));
    feed.attach().await?;
    println!("Live feed attached; type a message and press enter to send.");

    let mut updates = feed.subscribe_updates();
    let printer = tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(FeedUpdate::Appended(entry)) => {
                    println!(
                        "[{}] {}: {}",
                        entry.received_at.format("%H:%M:%S"),
                        entry.record.name,
                        entry.record.text
                    );
                }
                Ok(FeedUpdate::Replaced(entry)) => {
                    println!("(edited) {}: {}", entry.record.name, entry.record.text);
                }
                Ok(FeedUpdate::Removed(document_id)) => {
                    println!("(removed message {document_id})");
                }
                Ok(FeedUpdate::Error(message)) => {
                    eprintln!("feed error: {message}");
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut composer = Composer::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        composer.set_draft(&line);
        if !composer.can_send() {
            continue;
        }
        if let Err(err) = feed.send(&composer.take()).await {
            warn!("send failed: {err}");
        }
    }

    feed.detach().await;
    printer.abort();
    Ok(())
}
