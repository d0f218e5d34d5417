//! Client SDK for Twitch chat over IRC.
//!
//! Connects, authenticates and joins one channel, turns inbound lines into
//! [`ChatMessage`](event::ChatMessage) events, answers keep-alives, throttles
//! outbound messages and reconnects on its own when the connection drops.

pub mod bus;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod irc;
pub mod receiver;
pub mod throttle;

pub use client::ChatClient;
pub use config::{ClientOptions, Session, TwitchChatConfig};
pub use event::ChatMessage;
