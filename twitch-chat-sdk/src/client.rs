//! Twitch chat client.
//!
//! This is the main entry point for SDK consumers. It owns the connection,
//! the receive loop task, the outbound rate limiter and the event bus.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use twitch_chat_sdk::client::ChatClient;
//! use twitch_chat_sdk::config::{ClientOptions, Session};
//!
//! let session = Session::new("csharpfritz", "tagzbot", "oauth-token")?;
//! let client = ChatClient::new(session, ClientOptions::default());
//! let mut chat = client.subscribe();
//! client.start().await?;
//!
//! while let Some(msg) = chat.recv().await {
//!     println!("{}: {}", msg.display_name, msg.message);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Reconnection
//!
//! Only the first connection is made by [`ChatClient::start`], and only its
//! failure is reported to the caller. Later connection losses are handled by
//! the receive loop, which retries per [`ReconnectPolicy`](crate::receiver::ReconnectPolicy)
//! (every 2s, forever, by default). Subscribers just see a gap in the stream.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{EventBus, Subscription};
use crate::config::{ClientOptions, Session, TwitchChatConfig};
use crate::connection;
use crate::error::{ConnectError, SendError};
use crate::irc::Message;
use crate::receiver::{LoopState, ReceiveLoop, WriterSlot};
use crate::throttle::RateLimiter;

/// Pseudo-channel whispers are routed through.
const WHISPER_CHANNEL: &str = "#jtv";

pub struct ChatClient {
    session: Arc<Session>,
    options: ClientOptions,
    writer: WriterSlot,
    limiter: Mutex<RateLimiter>,
    events: Arc<EventBus>,
    shutdown: CancellationToken,
    state: Arc<watch::Sender<LoopState>>,
    task: Mutex<Option<JoinHandle<()>>>,
    starting: tokio::sync::Mutex<()>,
}

impl ChatClient {
    pub fn new(session: Session, options: ClientOptions) -> Self {
        let limiter = RateLimiter::new(options.rate_window, options.rate_cap);
        let events = EventBus::new(options.backpressure, options.event_capacity);
        let (state, _) = watch::channel(LoopState::Connecting);
        Self {
            session: Arc::new(session),
            options,
            writer: Arc::new(tokio::sync::Mutex::new(None)),
            limiter: Mutex::new(limiter),
            events: Arc::new(events),
            shutdown: CancellationToken::new(),
            state: Arc::new(state),
            task: Mutex::new(None),
            starting: tokio::sync::Mutex::new(()),
        }
    }

    /// Validate `config` and build a client from it. Nothing is opened until
    /// [`start`](Self::start).
    pub fn from_config(config: &TwitchChatConfig) -> Result<Self, ConnectError> {
        let session = config.session()?;
        Ok(Self::new(session, config.client_options()))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Make the first connection and launch the receive loop.
    ///
    /// A failure here is fatal: the client is shut down and the error is
    /// returned. Calling `start` on a running client does nothing.
    pub async fn start(&self) -> Result<(), ConnectError> {
        let _starting = self.starting.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(ConnectError::ShutDown);
        }
        if self.task.lock().is_some() {
            return Ok(());
        }

        self.state.send_replace(LoopState::Connecting);
        let conn = match connection::connect(&self.session, &self.options.endpoint).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!("Failed to connect to chat server: {e}");
                self.shutdown.cancel();
                self.events.close();
                self.state.send_replace(LoopState::ShuttingDown);
                return Err(e);
            }
        };

        let (reader, mut writer) = conn.into_split();
        writer.set_write_timeout(self.options.write_timeout);
        *self.writer.lock().await = Some(writer);
        self.state.send_replace(LoopState::Listening);

        let receive_loop = ReceiveLoop {
            session: self.session.clone(),
            options: self.options.clone(),
            writer: self.writer.clone(),
            events: self.events.clone(),
            shutdown: self.shutdown.clone(),
            state: self.state.clone(),
        };
        *self.task.lock() = Some(tokio::spawn(receive_loop.run(reader)));
        Ok(())
    }

    /// Post `text` to the joined channel.
    pub async fn post_message(&self, text: &str) -> Result<(), SendError> {
        let line = self.outbound(format!("#{}", self.session.channel()), sanitize(text));
        self.send(&line).await
    }

    /// Send `text` privately to `user_name`.
    pub async fn whisper_message(&self, text: &str, user_name: &str) -> Result<(), SendError> {
        let body = format!("/w {} {}", sanitize(user_name), sanitize(text));
        let line = self.outbound(WHISPER_CHANNEL.to_string(), body);
        self.send(&line).await
    }

    /// A new, independent stream of chat messages.
    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Watch receive-loop state transitions.
    pub fn state_changes(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    /// Stop the receive loop and close the connection. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!("Shutting down chat client");
            self.shutdown.cancel();
        }
        if let Some(mut w) = self.writer.lock().await.take() {
            w.close().await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::warn!("Receive loop ended abnormally: {e}");
        }
        self.events.close();
        self.state.send_replace(LoopState::ShuttingDown);
    }

    fn outbound(&self, target: String, body: String) -> String {
        let nick = self.session.bot_name();
        Message {
            prefix: Some(format!("{nick}!{nick}@{nick}.tmi.twitch.tv")),
            command: "PRIVMSG".to_string(),
            params: vec![target, body],
            ..Default::default()
        }
        .to_string()
    }

    async fn send(&self, line: &str) -> Result<(), SendError> {
        let delay = self.limiter.lock().check_delay();
        if !delay.is_zero() {
            tracing::debug!("Throttled, waiting {delay:?} before sending");
            tokio::time::sleep(delay).await;
        }

        if self.task.lock().is_none() && !self.shutdown.is_cancelled() {
            self.start().await.map_err(|e| {
                tracing::warn!("Message dropped, could not connect: {e}");
                SendError::NotConnected
            })?;
        }

        let mut slot = self.writer.lock().await;
        let Some(writer) = slot.as_mut() else {
            tracing::warn!("Not connected, message dropped");
            return Err(SendError::NotConnected);
        };
        writer.send_line(line).await.inspect_err(|e| {
            tracing::warn!("Failed to send message: {e}");
        })
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Outbound text is a single protocol line; embedded line breaks become spaces.
fn sanitize(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}
