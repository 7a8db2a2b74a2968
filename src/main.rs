//! Chatbridge CLI entry point.

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use chatbridge::chat::discord::DiscordGateway;
use chatbridge::chat::matrix::MatrixGateway;
use chatbridge::chat::slack::SlackGateway;
use chatbridge::chat::telegram::TelegramGateway;
use chatbridge::config::Config;
use chatbridge::emoji::EmojiTable;
use chatbridge::model::Source;
use chatbridge::room::{self, Gateways};

#[derive(Parser)]
#[command(name = "chatbridge", version)]
#[command(about = "Bridges chat rooms across Slack, Discord, Telegram and Matrix")]
struct Cli {
    /// Path to the configuration file
    #[arg(long = "conf", default_value = "conf/config.yml")]
    conf: std::path::PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = Config::load(&cli.conf)?;
    let emoji = Arc::new(EmojiTable::from_pairs(&config.emoji));

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    // One gateway per platform the configuration references; connection
    // failures here are fatal.
    let mut gateways = Gateways::default();
    if config.uses(Source::Slack) {
        let channel_ids = config.chat_ids(Source::Slack);
        gateways.slack = Some(
            SlackGateway::connect(&config.slack, &channel_ids, emoji.clone(), cancel.clone())
                .await
                .context("slack startup failed")?,
        );
    }
    if config.uses(Source::Discord) {
        let channel_ids = config.chat_ids(Source::Discord);
        gateways.discord = Some(
            DiscordGateway::connect(&config.discord, &channel_ids, cancel.clone())
                .await
                .context("discord startup failed")?,
        );
    }
    if config.uses(Source::Telegram) {
        let chat_ids = config.chat_ids(Source::Telegram);
        gateways.telegram = Some(
            TelegramGateway::connect(&config.telegram, &chat_ids, cancel.clone())
                .await
                .context("telegram startup failed")?,
        );
    }
    if config.uses(Source::Matrix) {
        let room_ids = config.chat_ids(Source::Matrix);
        gateways.matrix = Some(
            MatrixGateway::connect(&config.matrix, &room_ids, cancel.clone())
                .await
                .context("matrix startup failed")?,
        );
    }

    let rooms = room::build_rooms(&config, &gateways, &emoji).await?;
    room::run_rooms(rooms, cancel).await;

    tracing::info!("chat bridge stopped");
    Ok(())
}

fn init_tracing(debug: bool) {
    let default_filter = if debug { "chatbridge=debug,info" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// SIGINT/SIGTERM cancel the root token; dispatcher loops exit cleanly and
/// in-flight outbound calls are left to finish.
fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {
                            tracing::info!("received interrupt signal, exiting...");
                        }
                        _ = sigterm.recv() => {
                            tracing::info!("received terminate signal, exiting...");
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "failed to register SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    tracing::info!("received interrupt signal, exiting...");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received interrupt signal, exiting...");
        }
        cancel.cancel();
    });
}
