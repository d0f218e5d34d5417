//! Bounded multi-subscriber delivery of chat events.
//!
//! The receive loop publishes; subscribers pull from their own
//! [`Subscription`]. What happens when a subscriber falls behind is decided
//! by [`Backpressure`].

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};

use crate::event::ChatMessage;

/// Policy applied when a subscriber's buffer is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// The slow subscriber loses its oldest buffered events. Intake never waits.
    #[default]
    DropOldest,
    /// The receive loop waits for the slow subscriber, pausing intake.
    Block,
}

pub struct EventBus {
    policy: Backpressure,
    capacity: usize,
    broadcast: Mutex<Option<broadcast::Sender<ChatMessage>>>,
    queues: Mutex<Vec<mpsc::Sender<ChatMessage>>>,
    closed: AtomicBool,
}

impl EventBus {
    pub fn new(policy: Backpressure, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let broadcast = match policy {
            Backpressure::DropOldest => Some(broadcast::channel(capacity).0),
            Backpressure::Block => None,
        };
        Self {
            policy,
            capacity,
            broadcast: Mutex::new(broadcast),
            queues: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        match self.policy {
            Backpressure::DropOldest => {
                let rx = match *self.broadcast.lock() {
                    Some(ref tx) => tx.subscribe(),
                    // Closed bus: hand out a receiver whose sender is already gone.
                    None => broadcast::channel(1).1,
                };
                Subscription {
                    inner: Inner::Broadcast(rx),
                }
            }
            Backpressure::Block => {
                let (tx, rx) = mpsc::channel(self.capacity);
                let mut queues = self.queues.lock();
                if !self.closed.load(Ordering::Acquire) {
                    queues.push(tx);
                }
                Subscription {
                    inner: Inner::Queue(rx),
                }
            }
        }
    }

    /// Deliver one event to every live subscriber.
    pub async fn publish(&self, msg: ChatMessage) {
        match self.policy {
            Backpressure::DropOldest => {
                let tx = self.broadcast.lock().clone();
                if let Some(tx) = tx
                    && tx.send(msg).is_err()
                {
                    tracing::trace!("No subscribers, chat event dropped");
                }
            }
            Backpressure::Block => {
                let queues = self.queues.lock().clone();
                let mut any_gone = false;
                for tx in &queues {
                    if tx.send(msg.clone()).await.is_err() {
                        any_gone = true;
                    }
                }
                if any_gone {
                    self.queues.lock().retain(|tx| !tx.is_closed());
                }
            }
        }
    }

    /// Ends every subscription once its buffered events are drained.
    pub fn close(&self) {
        self.broadcast.lock().take();
        let mut queues = self.queues.lock();
        self.closed.store(true, Ordering::Release);
        queues.clear();
    }
}

/// One subscriber's view of the event stream.
pub struct Subscription {
    inner: Inner,
}

enum Inner {
    Broadcast(broadcast::Receiver<ChatMessage>),
    Queue(mpsc::Receiver<ChatMessage>),
}

impl Subscription {
    /// Next chat event, or `None` once the client has shut down.
    pub async fn recv(&mut self) -> Option<ChatMessage> {
        match self.inner {
            Inner::Broadcast(ref mut rx) => loop {
                match rx.recv().await {
                    Ok(msg) => return Some(msg),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Chat subscriber lagging, dropped oldest events");
                    }
                    Err(RecvError::Closed) => return None,
                }
            },
            Inner::Queue(ref mut rx) => rx.recv().await,
        }
    }
}
