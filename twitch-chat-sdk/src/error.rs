//! Error types for each failure class of the chat client.
//!
//! Only [`ConnectError`] from the very first connection ever reaches a caller
//! of [`ChatClient::start`](crate::client::ChatClient::start). Everything the
//! receive loop hits later is logged and absorbed.

use std::io;

use tokio_util::codec::LinesCodecError;

/// Configuration was missing or unreadable. Raised before any socket is opened.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("can't read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("bad config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Opening the stream or writing the login handshake failed.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("TCP connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("handshake failed: {0}")]
    Handshake(#[source] SendError),
    #[error("client has been shut down")]
    ShutDown,
}

/// A single outbound line could not be written.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("not connected")]
    NotConnected,
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
}

/// The read half of the stream failed. Never fatal to the receive loop.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("read failed: {0}")]
    Io(#[source] io::Error),
    #[error("inbound line exceeded the maximum length")]
    LineTooLong,
}

impl From<LinesCodecError> for ReadError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::Io(e) => ReadError::Io(e),
            LinesCodecError::MaxLineLengthExceeded => ReadError::LineTooLong,
        }
    }
}
