//! Error types for the `sse` crate.
//!
//! Follows the workspace pattern of a root `Error` struct carrying an
//! `error_kind` tree plus an optional boxed `source`.

use std::error::Error as StdError;
use std::fmt;

/// Top-level error returned by framing and emission.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

/// Major categories of errors in the `sse` crate.
#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    /// The caller handed over an event that cannot be framed. Nothing was written.
    Validation(ValidationErrorKind),
    /// The stream is closed, or its transport went away. Producers should stop.
    StreamClosed,
}

/// Reasons an event is rejected before framing.
#[derive(Debug, PartialEq)]
pub enum ValidationErrorKind {
    /// Event names are written on a single line and must not contain `\n` or `\r`.
    EventNameContainsNewline,
    /// The payload could not be turned into text.
    DataNotText,
}

impl Error {
    pub fn is_stream_closed(&self) -> bool {
        self.error_kind == ErrorKind::StreamClosed
    }

    pub fn is_validation(&self) -> bool {
        matches!(self.error_kind, ErrorKind::Validation(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_kind {
            ErrorKind::Validation(ValidationErrorKind::EventNameContainsNewline) => {
                write!(f, "Event name must not contain new line characters")
            }
            ErrorKind::Validation(ValidationErrorKind::DataNotText) => {
                write!(f, "Event data must be text")
            }
            ErrorKind::StreamClosed => write!(f, "Client disconnected from the stream"),
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

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Validation(ValidationErrorKind::DataNotText),
        }
    }
}

/// Helper function to create validation errors.
pub fn validation_error(kind: ValidationErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Validation(kind),
    }
}

/// Helper function to create the error every emit returns once a stream is gone.
pub fn stream_closed() -> Error {
    Error {
        source: None,
        error_kind: ErrorKind::StreamClosed,
    }
}
