//! Chat tail example: follows one channel and prints chat as JSON lines.
//!
//! Usage:
//!   cargo run --example chat_tail -- --channel csharpfritz --bot-name tagzbot \
//!     --oauth-token $TWITCH_OAUTH_TOKEN --hashtag tagzapp
//!
//! Settings come from `--config` (default `~/.config/twitch-chat/config.toml`)
//! when the file exists; flags and env vars override it.
//!
//! Set `TWITCH_CHAT_LOG_JSON=1` for JSON logs, `RUST_LOG=twitch_chat_sdk=trace`
//! to see every protocol line.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use twitch_chat_sdk::config::{self, TwitchChatConfig};
use twitch_chat_sdk::{ChatClient, ChatMessage};

#[derive(Parser)]
#[command(name = "chat-tail", about = "Follow a Twitch channel's chat")]
struct Args {
    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Channel to join (without '#')
    #[arg(long, env = "TWITCH_CHANNEL")]
    channel: Option<String>,

    /// Bot account login name
    #[arg(long, env = "TWITCH_BOT_NAME")]
    bot_name: Option<String>,

    /// OAuth token for the bot account
    #[arg(long, env = "TWITCH_OAUTH_TOKEN", hide_env_values = true)]
    oauth_token: Option<String>,

    /// Only print messages containing one of these hashtags (without '#')
    #[arg(long = "hashtag")]
    hashtags: Vec<String>,

    /// Post this message to the channel once connected
    #[arg(long)]
    greeting: Option<String>,
}

impl Args {
    fn load_config(&self) -> Result<TwitchChatConfig> {
        let path = self.config.clone().unwrap_or_else(config::default_path);
        let mut cfg = if path.exists() {
            TwitchChatConfig::load(&path)?
        } else {
            TwitchChatConfig::default()
        };
        if let Some(ref channel) = self.channel {
            cfg.channel = channel.clone();
        }
        if let Some(ref name) = self.bot_name {
            cfg.chat_bot_name = name.clone();
        }
        if let Some(ref token) = self.oauth_token {
            cfg.oauth_token = token.clone();
        }
        Ok(cfg)
    }

    fn wants(&self, msg: &ChatMessage) -> bool {
        if self.hashtags.is_empty() {
            return true;
        }
        let text = msg.message.to_lowercase();
        self.hashtags
            .iter()
            .any(|tag| text.contains(&format!("#{}", tag.trim_start_matches('#').to_lowercase())))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let json_logs = std::env::var("TWITCH_CHAT_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "chat_tail=info,twitch_chat_sdk=info".into());
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let args = Args::parse();
    let cfg = args.load_config()?;
    let client = ChatClient::from_config(&cfg)?;
    let mut chat = client.subscribe();

    tracing::info!(
        channel = %client.session().channel(),
        nick = %client.session().bot_name(),
        "Starting chat tail"
    );
    client.start().await?;

    if let Some(ref greeting) = args.greeting
        && let Err(e) = client.post_message(greeting).await
    {
        tracing::warn!("Greeting not sent: {e}");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            msg = chat.recv() => {
                let Some(msg) = msg else { break };
                if args.wants(&msg) {
                    println!("{}", serde_json::to_string(&msg)?);
                }
            }
        }
    }

    client.shutdown().await;
    Ok(())
}
