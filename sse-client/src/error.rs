//! Error types for the `sse-client` crate.
//!
//! Same shape as the server crate: a root `Error` holding an `error_kind`
//! tree and the optional underlying `source`.

use std::error::Error as StdError;
use std::fmt;

#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

/// Major categories of client errors.
#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    /// Caller input rejected before anything was sent.
    Validation(ValidationErrorKind),
    /// The connection failed or was refused by the server.
    Transport(TransportErrorKind),
}

#[derive(Debug, PartialEq)]
pub enum ValidationErrorKind {
    /// Event names cannot contain `\n` or `\r`.
    EventNameContainsNewline,
    /// Request options could not be turned into a cache key.
    Options,
}

#[derive(Debug, PartialEq)]
pub enum TransportErrorKind {
    /// The request could not be built (bad header, bad URL).
    Builder,
    /// Connection refused, reset, DNS failure and the like.
    Network,
    /// The server answered with a non-success status.
    Status(u16),
    /// The server answered, but not with `text/event-stream`.
    NotEventStream,
    /// Reading the response body failed mid-stream.
    Body,
}

impl Error {
    pub fn is_transport(&self) -> bool {
        matches!(self.error_kind, ErrorKind::Transport(_))
    }

    /// HTTP status if the server refused the stream.
    pub fn status(&self) -> Option<u16> {
        match self.error_kind {
            ErrorKind::Transport(TransportErrorKind::Status(status)) => Some(status),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_kind {
            ErrorKind::Validation(kind) => write!(f, "Validation error: {:?}", kind),
            ErrorKind::Transport(TransportErrorKind::Status(status)) => {
                write!(f, "Http request failed with status {}", status)
            }
            ErrorKind::Transport(kind) => write!(f, "Transport error: {:?}", kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let error_kind = if err.is_builder() {
            TransportErrorKind::Builder
        } else if err.is_body() || err.is_decode() {
            TransportErrorKind::Body
        } else {
            TransportErrorKind::Network
        };

        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Transport(error_kind),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Validation(ValidationErrorKind::Options),
        }
    }
}

/// Helper function to create transport errors.
pub fn transport_error(kind: TransportErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Transport(kind),
    }
}

/// Helper function to create validation errors.
pub fn validation_error(kind: ValidationErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Validation(kind),
    }
}
