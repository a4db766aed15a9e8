//! Frame codec: turns one event record into SSE wire bytes.
//!
//! Layout of one frame:
//!
//! ```text
//! id: <id>\n
//! event: <event>\n
//! data: <percent-encoded line>\n      (one per `\n`-separated line of data)
//! \n
//! ```
//!
//! Each data line is percent-encoded, so control characters in the payload can
//! never break the line framing. Decoding is incremental and lives in the
//! client crate.

use crate::error::{validation_error, Error, ValidationErrorKind};
use axum::body::Bytes;
use serde::Serialize;

/// One event as produced by an emitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    pub id: String,
    pub event: String,
    pub data: String,
}

impl EventRecord {
    pub fn new(id: impl Into<String>, event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            event: event.into(),
            data: data.into(),
        }
    }
}

/// Rejects event names that would break out of their `event:` line. Readers
/// treat a lone `\r` as a line break too.
pub fn validate_event_name(event: &str) -> Result<(), Error> {
    if event.contains(['\n', '\r']) {
        return Err(validation_error(
            ValidationErrorKind::EventNameContainsNewline,
            &format!("Event name must not contain new line characters, received {event:?}"),
        ));
    }
    Ok(())
}

/// Interprets raw payload bytes as UTF-8 text.
pub fn text_data(data: &[u8]) -> Result<&str, Error> {
    std::str::from_utf8(data).map_err(|e| Error {
        source: Some(Box::new(e)),
        error_kind: crate::error::ErrorKind::Validation(ValidationErrorKind::DataNotText),
    })
}

/// Frames `record`. Fails without producing any bytes when the event name is invalid.
pub fn encode(record: &EventRecord) -> Result<Bytes, Error> {
    validate_event_name(&record.event)?;

    let mut frame = String::with_capacity(record.event.len() + record.data.len() + 32);
    frame.push_str("id: ");
    frame.push_str(&record.id);
    frame.push_str("\nevent: ");
    frame.push_str(&record.event);
    frame.push('\n');
    for line in record.data.split('\n') {
        frame.push_str("data: ");
        frame.push_str(&urlencoding::encode(line));
        frame.push('\n');
    }
    frame.push('\n');

    Ok(Bytes::from(frame))
}

/// A comment frame. Clients ignore it, proxies see traffic on an idle stream.
pub fn comment(text: &str) -> Bytes {
    let mut frame = String::with_capacity(text.len() + 4);
    for line in text.split('\n') {
        frame.push_str(": ");
        frame.push_str(line);
        frame.push('\n');
    }
    frame.push('\n');
    Bytes::from(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(record: &EventRecord) -> String {
        String::from_utf8(encode(record).unwrap().to_vec()).unwrap()
    }

    #[test]
    fn test_encode_layout() {
        let frame = encoded(&EventRecord::new("1", "msg", "hello"));
        assert_eq!(frame, "id: 1\nevent: msg\ndata: hello\n\n");
    }

    #[test]
    fn test_encode_splits_multiline_data() {
        let frame = encoded(&EventRecord::new("7", "msg", "a\nb\n"));
        assert_eq!(frame, "id: 7\nevent: msg\ndata: a\ndata: b\ndata: \n\n");
    }

    #[test]
    fn test_encode_percent_encodes_control_and_reserved_characters() {
        let frame = encoded(&EventRecord::new("2", "msg", "a b\r%{\"k\":1}"));
        assert_eq!(
            frame,
            "id: 2\nevent: msg\ndata: a%20b%0D%25%7B%22k%22%3A1%7D\n\n"
        );
        // Only the frame's own delimiters remain.
        assert_eq!(frame.matches('\n').count(), 4);
        assert!(!frame.contains('\r'));
    }

    #[test]
    fn test_encode_rejects_newline_in_event_name() {
        let err = encode(&EventRecord::new("1", "a\nb", "x")).unwrap_err();
        assert_eq!(
            err.error_kind,
            crate::error::ErrorKind::Validation(ValidationErrorKind::EventNameContainsNewline)
        );
    }

    #[test]
    fn test_encode_rejects_carriage_return_in_event_name() {
        for name in ["a\r", "a\rb", "\r\n"] {
            let err = encode(&EventRecord::new("1", name, "x")).unwrap_err();
            assert_eq!(
                err.error_kind,
                crate::error::ErrorKind::Validation(ValidationErrorKind::EventNameContainsNewline),
                "{name:?}"
            );
        }
    }

    #[test]
    fn test_text_data_rejects_invalid_utf8() {
        assert_eq!(text_data(b"ok").unwrap(), "ok");
        let err = text_data(&[0xff, 0xfe]).unwrap_err();
        assert_eq!(
            err.error_kind,
            crate::error::ErrorKind::Validation(ValidationErrorKind::DataNotText)
        );
    }

    #[test]
    fn test_comment_frame() {
        assert_eq!(&comment("ping")[..], b": ping\n\n");
    }
}
