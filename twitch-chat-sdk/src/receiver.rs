//! The receive loop: one background task per client.
//!
//! ```text
//! Connecting ──ok──▶ Listening ──disconnected──▶ Reconnecting ──backoff──▶ Connecting
//!     │                  │                            │
//!     └───────── shutdown requested in any state ─────┴──▶ ShuttingDown
//! ```
//!
//! Read errors are logged and treated as an empty read; only a connection
//! that reports itself disconnected triggers a reconnect. Retries are
//! unbounded unless [`ReconnectPolicy::max_attempts`] says otherwise.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::codec::{ChatLineCodec, Inbound};
use crate::config::{ClientOptions, MIN_POLL_INTERVAL, Session};
use crate::connection::{self, LineReader, LineWriter};

/// Write half of whichever connection is current. `None` while disconnected.
pub(crate) type WriterSlot = Arc<Mutex<Option<LineWriter>>>;

/// Where the receive loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Connecting,
    Listening,
    Reconnecting,
    /// Terminal.
    ShuttingDown,
}

/// How long to wait between reconnect attempts, and how many to make.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Wait before the first attempt.
    pub delay: Duration,
    /// Growth factor per consecutive failure; `1` keeps the delay fixed.
    pub multiplier: u32,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(2),
            multiplier: 1,
            max_delay: Duration::from_secs(2),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `failures + 1`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(failures);
        self.delay.saturating_mul(factor).min(self.max_delay.max(self.delay))
    }

    fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }
}

pub(crate) struct ReceiveLoop {
    pub(crate) session: Arc<Session>,
    pub(crate) options: ClientOptions,
    pub(crate) writer: WriterSlot,
    pub(crate) events: Arc<EventBus>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) state: Arc<watch::Sender<LoopState>>,
}

impl ReceiveLoop {
    /// Drive the state machine until shutdown. `reader` belongs to the
    /// connection the caller already established.
    pub(crate) async fn run(self, reader: LineReader) {
        let codec = ChatLineCodec::new(self.session.channel());
        let mut reader = Some(reader);
        let mut failures: u32 = 0;
        let mut state = LoopState::Listening;

        loop {
            if self.shutdown.is_cancelled() {
                state = LoopState::ShuttingDown;
            }
            self.state.send_replace(state);

            state = match state {
                LoopState::Listening => match reader.as_mut() {
                    Some(r) => self.listen(r, &codec).await,
                    None => LoopState::Reconnecting,
                },
                LoopState::Reconnecting => {
                    reader = None;
                    self.drop_writer().await;
                    if self.options.reconnect.exhausted(failures) {
                        tracing::error!(failures, "Giving up on reconnecting to chat server");
                        LoopState::ShuttingDown
                    } else {
                        let wait = self.options.reconnect.backoff(failures);
                        tracing::warn!("Disconnected from chat server, reconnecting in {wait:?}");
                        tokio::select! {
                            _ = self.shutdown.cancelled() => LoopState::ShuttingDown,
                            _ = tokio::time::sleep(wait) => LoopState::Connecting,
                        }
                    }
                }
                LoopState::Connecting => {
                    let attempt = tokio::select! {
                        _ = self.shutdown.cancelled() => None,
                        res = connection::connect(&self.session, &self.options.endpoint) => Some(res),
                    };
                    match attempt {
                        None => LoopState::ShuttingDown,
                        Some(Ok(conn)) => {
                            failures = 0;
                            let (r, mut w) = conn.into_split();
                            w.set_write_timeout(self.options.write_timeout);
                            *self.writer.lock().await = Some(w);
                            reader = Some(r);
                            tracing::info!("Reconnected to chat server");
                            LoopState::Listening
                        }
                        Some(Err(e)) => {
                            failures = failures.saturating_add(1);
                            tracing::warn!(failures, "Reconnect failed: {e}");
                            LoopState::Reconnecting
                        }
                    }
                }
                LoopState::ShuttingDown => break,
            };
        }

        drop(reader);
        self.drop_writer().await;
        self.events.close();
        self.state.send_replace(LoopState::ShuttingDown);
        tracing::warn!("Exiting receive loop");
    }

    async fn listen(&self, reader: &mut LineReader, codec: &ChatLineCodec) -> LoopState {
        let poll = self.options.poll_interval.max(MIN_POLL_INTERVAL);
        let stall = self.options.stall_threshold;
        let mut last_received = Instant::now();

        loop {
            if self.shutdown.is_cancelled() {
                return LoopState::ShuttingDown;
            }
            if last_received.elapsed() > stall {
                tracing::warn!("Haven't received a message in {} seconds", stall.as_secs());
                last_received = Instant::now();
            }
            if !reader.is_connected() {
                return LoopState::Reconnecting;
            }

            let read = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return LoopState::ShuttingDown,
                read = reader.read_line(poll) => read,
            };
            let line = match read {
                Ok(Some(line)) => line,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!("Error reading messages: {e}");
                    continue;
                }
            };

            last_received = Instant::now();
            tracing::trace!("> {line}");

            match codec.classify(&line) {
                Inbound::Ping { payload } => {
                    tracing::debug!("Received PING, sending PONG");
                    self.send_unthrottled(&Inbound::pong(&payload)).await;
                }
                Inbound::Chat(msg) => {
                    tracing::trace!(user = %msg.user_name, "Message received: {}", msg.message);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return LoopState::ShuttingDown,
                        _ = self.events.publish(msg) => {}
                    }
                }
                Inbound::Other => {}
            }
        }
    }

    /// Heartbeat replies skip the rate limiter.
    async fn send_unthrottled(&self, line: &str) {
        let mut slot = self.writer.lock().await;
        match slot.as_mut() {
            Some(w) => {
                if let Err(e) = w.send_line(line).await {
                    tracing::warn!("Failed to send {line:?}: {e}");
                }
            }
            None => tracing::warn!("No connection, {line:?} not sent"),
        }
    }

    async fn drop_writer(&self) {
        if let Some(mut w) = self.writer.lock().await.take() {
            w.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_fixed_two_seconds_forever() {
        let p = ReconnectPolicy::default();
        for failures in [0, 1, 10, 1000] {
            assert_eq!(p.backoff(failures), Duration::from_secs(2));
            assert!(!p.exhausted(failures));
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = ReconnectPolicy {
            delay: Duration::from_secs(2),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
            max_attempts: Some(5),
        };
        assert_eq!(p.backoff(0), Duration::from_secs(2));
        assert_eq!(p.backoff(1), Duration::from_secs(4));
        assert_eq!(p.backoff(3), Duration::from_secs(16));
        assert_eq!(p.backoff(4), Duration::from_secs(30));
        assert_eq!(p.backoff(40), Duration::from_secs(30));
        assert!(!p.exhausted(4));
        assert!(p.exhausted(5));
    }
}
