//! Errors surfaced by the session, dispatcher and bridge

use std::time::Duration;

use cp02_proto::{DecodeError, EncodeError};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// BLE stack failure; the session reconnects
    #[error("transport error: {context}")]
    Transport { context: String },

    #[error("malformed frame: {0}")]
    Malformed(#[from] DecodeError),

    #[error("frame encoding failed: {0}")]
    Encode(#[from] EncodeError),

    /// Non-success response to a command that carried the token
    #[error("device rejected the token for {service}")]
    Auth { service: &'static str },

    /// Non-success response to a command sent without a token
    #[error("device rejected {service}")]
    Rejected { service: &'static str },

    #[error("{service} (msg_id {msg_id}) got no response within {timeout:?}")]
    Timeout {
        service: &'static str,
        msg_id: u8,
        timeout: Duration,
    },

    /// Retries exhausted; the session stays disconnected until restarted
    #[error("link lost after {attempts} reconnect attempts")]
    LinkLost { attempts: u32 },

    /// The session a request was sent on is gone
    #[error("session reset before the response arrived")]
    SessionReset,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("not connected to a charger")]
    NotConnected,

    #[error("invalid params for {command}: {reason}")]
    InvalidParams { command: String, reason: String },

    #[error("a token search is in progress")]
    TokenBusy,

    #[error("no token known for this charger")]
    TokenUnknown,

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// A reply could not be rendered as JSON
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0} is not supported here")]
    Unsupported(String),
}

/// Stable, machine-readable category of an [`Error`], rendered beside the
/// message in bridge responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Malformed,
    Auth,
    Rejected,
    Timeout,
    LinkLost,
    SessionReset,
    UnknownCommand,
    NotConnected,
    InvalidParams,
    TokenBusy,
    TokenUnknown,
    Storage,
    Internal,
    Unsupported,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport { .. } => ErrorKind::Transport,
            Error::Malformed(_) => ErrorKind::Malformed,
            Error::Encode(_) => ErrorKind::InvalidParams,
            Error::Auth { .. } => ErrorKind::Auth,
            Error::Rejected { .. } => ErrorKind::Rejected,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::LinkLost { .. } => ErrorKind::LinkLost,
            Error::SessionReset => ErrorKind::SessionReset,
            Error::UnknownCommand(_) => ErrorKind::UnknownCommand,
            Error::NotConnected => ErrorKind::NotConnected,
            Error::InvalidParams { .. } => ErrorKind::InvalidParams,
            Error::TokenBusy => ErrorKind::TokenBusy,
            Error::TokenUnknown => ErrorKind::TokenUnknown,
            Error::Storage(_) => ErrorKind::Storage,
            Error::Json(_) => ErrorKind::Internal,
            Error::Unsupported(_) => ErrorKind::Unsupported,
        }
    }

    pub fn transport(context: impl std::fmt::Display) -> Self {
        Error::Transport { context: context.to_string() }
    }

    pub fn invalid_params(command: &str, reason: impl Into<String>) -> Self {
        Error::InvalidParams { command: command.to_string(), reason: reason.into() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_snake_case() {
        let err = Error::LinkLost { attempts: 5 };
        assert_eq!(serde_json::to_value(err.kind()).unwrap(), "link_lost");
        assert_eq!(
            serde_json::to_value(Error::UnknownCommand("x".into()).kind()).unwrap(),
            "unknown_command"
        );
    }

    #[test]
    fn decode_errors_are_malformed() {
        let err: Error = DecodeError::TooShort { len: 3 }.into();
        assert_eq!(err.kind(), ErrorKind::Malformed);
        assert!(err.to_string().contains("3 bytes"));
    }

    #[test]
    fn json_failures_are_internal() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().starts_with("json error"));
    }
}
