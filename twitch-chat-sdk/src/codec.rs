//! Classifies inbound lines into heartbeats, channel chat, or noise.

use chrono::{DateTime, Utc};

use crate::event::ChatMessage;
use crate::irc::Message;

/// What a single inbound line turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Server keep-alive. Must be answered with [`Inbound::pong`].
    Ping { payload: String },
    /// A PRIVMSG to the configured channel.
    Chat(ChatMessage),
    /// Anything else; dropped by the receive loop.
    Other,
}

impl Inbound {
    /// The reply line for a [`Inbound::Ping`].
    pub fn pong(payload: &str) -> String {
        format!("PONG :{payload}")
    }
}

/// Stateless line classifier bound to one channel.
#[derive(Debug, Clone)]
pub struct ChatLineCodec {
    channel: String,
}

impl ChatLineCodec {
    /// `channel` is the bare channel name, without `#`.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }

    pub fn classify(&self, line: &str) -> Inbound {
        self.classify_at(line, Utc::now())
    }

    /// Like [`classify`](Self::classify), using `received_at` when the line
    /// carries no usable `tmi-sent-ts`.
    pub fn classify_at(&self, line: &str, received_at: DateTime<Utc>) -> Inbound {
        if line.starts_with("PING") {
            let payload = line
                .split_once(':')
                .map(|(_, p)| p)
                .unwrap_or_else(|| line["PING".len()..].trim());
            return Inbound::Ping {
                payload: payload.trim_end_matches(['\r', '\n']).to_string(),
            };
        }

        let Some(msg) = Message::parse(line) else {
            return Inbound::Other;
        };
        if msg.command != "PRIVMSG" || msg.params.len() < 2 {
            return Inbound::Other;
        }
        match msg.params[0].strip_prefix('#') {
            Some(channel) if channel == self.channel => {}
            _ => return Inbound::Other,
        }

        let timestamp = msg
            .tag("tmi-sent-ts")
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or(received_at);

        Inbound::Chat(ChatMessage {
            message_id: msg.tag("id").to_string(),
            user_name: msg.user().to_string(),
            display_name: msg.tag("display-name").to_string(),
            message: msg.params[1].clone(),
            badges: split_badges(msg.tag("badges")),
            timestamp,
        })
    }
}

fn split_badges(raw: &str) -> Vec<String> {
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split(',').map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAT: &str = "@badge-info=;badges=broadcaster/1,premium/1;color=#FF0000;display-name=CsharpFritz;emotes=;id=b34ccfc7-4977-403a-8a94-33c6bac34fb8;mod=0;room-id=1337;tmi-sent-ts=1700000000000;user-id=1337 :csharpfritz!csharpfritz@csharpfritz.tmi.twitch.tv PRIVMSG #csharpfritz :Hello #tagzapp friends";

    fn codec() -> ChatLineCodec {
        ChatLineCodec::new("csharpfritz")
    }

    #[test]
    fn extracts_chat_fields() {
        let Inbound::Chat(msg) = codec().classify(CHAT) else {
            panic!("expected chat");
        };
        assert_eq!(msg.message_id, "b34ccfc7-4977-403a-8a94-33c6bac34fb8");
        assert_eq!(msg.user_name, "csharpfritz");
        assert_eq!(msg.display_name, "CsharpFritz");
        assert_eq!(msg.message, "Hello #tagzapp friends");
        assert_eq!(msg.badges, vec!["broadcaster/1", "premium/1"]);
        assert_eq!(msg.timestamp.to_rfc3339(), "2023-11-14T22:13:20+00:00");
    }

    #[test]
    fn other_channel_is_ignored() {
        let line = CHAT.replace("PRIVMSG #csharpfritz", "PRIVMSG #someoneelse");
        assert_eq!(codec().classify(&line), Inbound::Other);
    }

    #[test]
    fn channel_match_is_case_sensitive() {
        let line = CHAT.replace("PRIVMSG #csharpfritz", "PRIVMSG #CsharpFritz");
        assert_eq!(codec().classify(&line), Inbound::Other);
    }

    #[test]
    fn ping_yields_pong_payload() {
        let inbound = codec().classify("PING :tmi.twitch.tv\r\n");
        assert_eq!(
            inbound,
            Inbound::Ping {
                payload: "tmi.twitch.tv".to_string()
            }
        );
        assert_eq!(Inbound::pong("tmi.twitch.tv"), "PONG :tmi.twitch.tv");
    }

    #[test]
    fn ping_payload_keeps_later_colons() {
        let Inbound::Ping { payload } = codec().classify("PING :a:b") else {
            panic!("expected ping");
        };
        assert_eq!(payload, "a:b");
    }

    #[test]
    fn missing_tags_default_to_empty() {
        let received = DateTime::from_timestamp_millis(42).unwrap();
        let line = ":viewer!viewer@viewer.tmi.twitch.tv PRIVMSG #csharpfritz :no tags here";
        let Inbound::Chat(msg) = codec().classify_at(line, received) else {
            panic!("expected chat");
        };
        assert_eq!(msg.user_name, "viewer");
        assert_eq!(msg.message_id, "");
        assert_eq!(msg.display_name, "");
        assert!(msg.badges.is_empty());
        assert_eq!(msg.timestamp, received);
    }

    #[test]
    fn empty_badges_tag_is_empty_list() {
        let line = CHAT.replace("badges=broadcaster/1,premium/1", "badges=");
        let Inbound::Chat(msg) = codec().classify(&line) else {
            panic!("expected chat");
        };
        assert!(msg.badges.is_empty());
    }

    #[test]
    fn badges_are_split_verbatim() {
        let line = CHAT.replace("badges=broadcaster/1,premium/1", "badges=moderator/1,,vip/1");
        let Inbound::Chat(msg) = codec().classify(&line) else {
            panic!("expected chat");
        };
        assert_eq!(msg.badges, vec!["moderator/1", "", "vip/1"]);
    }

    #[test]
    fn non_chat_commands_are_other() {
        let c = codec();
        assert_eq!(c.classify(":tmi.twitch.tv 001 bot :Welcome, GLHF!"), Inbound::Other);
        assert_eq!(c.classify(":bot!bot@bot.tmi.twitch.tv JOIN #csharpfritz"), Inbound::Other);
        assert_eq!(c.classify("@msg-id=x :tmi.twitch.tv NOTICE #csharpfritz :hi"), Inbound::Other);
        assert_eq!(c.classify(""), Inbound::Other);
    }
}
