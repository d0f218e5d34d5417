//! Line grammar: `[@tags ][:prefix ]COMMAND[ params...][ :trailing]`.
//!
//! A line is split into its parts once. Tag lookup and command matching then
//! work on the parsed [`Message`] independently of each other.

use std::collections::HashMap;
use std::fmt;

/// One parsed protocol line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// IRCv3 message tags with escapes already resolved.
    pub tags: HashMap<String, String>,
    /// Source prefix without the leading `:` (e.g. `nick!user@host`).
    pub prefix: Option<String>,
    pub command: String,
    /// Middle params followed by the trailing param, if any.
    pub params: Vec<String>,
}

impl Message {
    /// Parse a single line. Trailing CR/LF is ignored. Returns `None` for
    /// lines without a command.
    pub fn parse(line: &str) -> Option<Message> {
        let mut rest = line.trim_end_matches(['\r', '\n']);

        let mut tags = HashMap::new();
        if let Some(after) = rest.strip_prefix('@') {
            let (raw_tags, remainder) = after.split_once(' ').unwrap_or((after, ""));
            for pair in raw_tags.split(';').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                tags.insert(key.to_string(), unescape_tag_value(value));
            }
            rest = remainder;
        }

        rest = rest.trim_start_matches(' ');
        let mut prefix = None;
        if let Some(after) = rest.strip_prefix(':') {
            let (p, remainder) = after.split_once(' ').unwrap_or((after, ""));
            prefix = Some(p.to_string());
            rest = remainder;
        }

        rest = rest.trim_start_matches(' ');
        let (command, mut rest) = rest.split_once(' ').unwrap_or((rest, ""));
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            let (param, remainder) = rest.split_once(' ').unwrap_or((rest, ""));
            params.push(param.to_string());
            rest = remainder;
        }

        Some(Message {
            tags,
            prefix,
            command: command.to_string(),
            params,
        })
    }

    /// Tag value, or `""` when the tag is absent.
    pub fn tag(&self, key: &str) -> &str {
        self.tags.get(key).map(String::as_str).unwrap_or("")
    }

    /// The `user` part of a `nick!user@host` prefix, or `""`.
    pub fn user(&self) -> &str {
        self.prefix
            .as_deref()
            .and_then(|p| p.split_once('!'))
            .and_then(|(_, rest)| rest.split_once('@'))
            .map(|(user, _)| user)
            .unwrap_or("")
    }
}

impl fmt::Display for Message {
    /// Serialises without tags; the client never sends any.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref prefix) = self.prefix {
            write!(f, ":{prefix} ")?;
        }
        f.write_str(&self.command)?;
        if let Some((last, middle)) = self.params.split_last() {
            for p in middle {
                write!(f, " {p}")?;
            }
            write!(f, " :{last}")?;
        }
        Ok(())
    }
}

fn unescape_tag_value(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}
