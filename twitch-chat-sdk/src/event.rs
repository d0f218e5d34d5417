//! Events the client hands to its subscribers.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A chat message posted to the joined channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    /// Platform message id (`id` tag).
    pub message_id: String,
    /// Login name taken from the `nick!user@host` prefix.
    pub user_name: String,
    /// `display-name` tag.
    pub display_name: String,
    /// Message body.
    pub message: String,
    /// `badges` tag split on `,`, e.g. `["broadcaster/1", "subscriber/12"]`.
    pub badges: Vec<String>,
    /// When the platform says the message was sent (`tmi-sent-ts`).
    pub timestamp: DateTime<Utc>,
}
