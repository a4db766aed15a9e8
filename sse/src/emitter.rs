use crate::codec::{self, EventRecord};
use crate::error::{stream_closed, Error};
use crate::lock::{CloseReason, Lock};
use axum::body::Bytes;
use log::*;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;

/// Raw output side of one stream: frames written here go out on the HTTP
/// response body in order.
#[derive(Clone)]
pub struct Sink {
    sender: UnboundedSender<Bytes>,
    lock: Lock,
}

impl Sink {
    pub fn new(sender: UnboundedSender<Bytes>, lock: Lock) -> Self {
        Self { sender, lock }
    }

    /// Writes already-framed bytes.
    ///
    /// Fails with `StreamClosed` once the lock is released. A failed write means
    /// the response body is gone, so it also releases the lock.
    pub fn write(&self, frame: Bytes) -> Result<(), Error> {
        if !self.lock.is_open() {
            return Err(stream_closed());
        }
        self.sender.send(frame).map_err(|_| {
            if self.lock.release(CloseReason::TransportGone) {
                warn!("Write to a dropped stream body, closing the stream");
            }
            stream_closed()
        })
    }

    pub fn is_closed(&self) -> bool {
        !self.lock.is_open()
    }
}

/// Frames `(event, data)` pairs with a per-stream monotonic id and writes them
/// to a [`Sink`]. Clones share the id counter.
#[derive(Clone)]
pub struct Emitter {
    sink: Sink,
    // Held across encode + write so ids hit the wire in order.
    next_id: Arc<Mutex<u64>>,
}

impl Emitter {
    pub fn new(sink: Sink) -> Self {
        Self {
            sink,
            next_id: Arc::new(Mutex::new(1)),
        }
    }

    /// Emits one event. The id is only consumed when the frame is written.
    pub fn emit(&self, event: &str, data: &str) -> Result<(), Error> {
        if self.sink.is_closed() {
            return Err(stream_closed());
        }
        codec::validate_event_name(event)?;

        let mut next_id = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
        let frame = codec::encode(&EventRecord::new(next_id.to_string(), event, data))?;
        self.sink.write(frame)?;
        *next_id += 1;
        Ok(())
    }

    /// Emits `value` serialized as JSON.
    pub fn emit_json<T: Serialize + ?Sized>(&self, event: &str, value: &T) -> Result<(), Error> {
        let data = serde_json::to_string(value)?;
        self.emit(event, &data)
    }

    /// Emits a payload that arrives as bytes; it must be valid UTF-8.
    pub fn emit_bytes(&self, event: &str, data: &[u8]) -> Result<(), Error> {
        self.emit(event, codec::text_data(data)?)
    }

    pub fn sink(&self) -> &Sink {
        &self.sink
    }
}
