use log::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Event name used when a record carries no `event:` field.
pub const DEFAULT_EVENT: &str = "message";

/// One complete record delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    /// The record's `id:` field, empty if the record had none.
    pub id: String,
    pub event: String,
    /// Decoded data lines joined with `\n`.
    pub data: String,
}

/// Turns assembled lines into [`MessageEvent`]s.
///
/// Fields accumulate until a blank line flushes them. `data` values are
/// percent-decoded; every other field is taken verbatim. Comment lines
/// (leading `:`) and unknown fields are ignored.
#[derive(Debug, Default)]
pub struct Demultiplexer {
    id: Option<String>,
    event: Option<String>,
    data: Vec<String>,
    last_event_id: Option<String>,
    retry: Option<Duration>,
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes one line, returning an event when the line completed one.
    pub fn feed(&mut self, line: &str) -> Option<MessageEvent> {
        if line.is_empty() {
            return self.flush();
        }
        if line.starts_with(':') {
            return None;
        }

        let Some((field, value)) = line.split_once(':') else {
            trace!("Ignoring line without a field separator: {:?}", line);
            return None;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);

        match field {
            "id" => {
                self.id = Some(value.to_string());
                self.last_event_id = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(decode_data(value)),
            "retry" => match value.parse::<u64>() {
                Ok(millis) => self.retry = Some(Duration::from_millis(millis)),
                Err(_) => debug!("Ignoring invalid retry value: {:?}", value),
            },
            _ => trace!("Ignoring unknown field: {:?}", field),
        }
        None
    }

    /// Id of the most recent record that carried one.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Reconnection delay announced by the server, consumed once read.
    pub fn take_retry(&mut self) -> Option<Duration> {
        self.retry.take()
    }

    /// Drops any half-received record. Used when the transport is replaced;
    /// the last event id survives.
    pub fn reset(&mut self) {
        self.id = None;
        self.event = None;
        self.data.clear();
    }

    fn flush(&mut self) -> Option<MessageEvent> {
        if self.id.is_none() && self.event.is_none() && self.data.is_empty() {
            return None;
        }

        let event = self
            .event
            .take()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_EVENT.to_string());

        Some(MessageEvent {
            id: self.id.take().unwrap_or_default(),
            event,
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

fn decode_data(value: &str) -> String {
    match urlencoding::decode(value) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => {
            debug!("Data line is not valid percent-encoded UTF-8, delivering it raw");
            value.to_string()
        }
    }
}

pub type Listener = Arc<dyn Fn(&MessageEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Per-event-name listener registry.
#[derive(Default)]
pub struct Listeners {
    next_id: u64,
    by_event: HashMap<String, Vec<(ListenerId, Listener)>>,
}

impl Listeners {
    pub fn add(&mut self, event: &str, listener: Listener) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.by_event
            .entry(event.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        let mut removed = false;
        self.by_event.retain(|_, listeners| {
            let before = listeners.len();
            listeners.retain(|(listener_id, _)| *listener_id != id);
            removed |= listeners.len() != before;
            !listeners.is_empty()
        });
        removed
    }

    /// Snapshot of the listeners for `event`, so they can be called without
    /// holding the registry.
    pub fn matching(&self, event: &str) -> Vec<Listener> {
        self.by_event
            .get(event)
            .map(|listeners| listeners.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, event: &str) -> usize {
        self.by_event.get(event).map_or(0, Vec::len)
    }

    pub fn clear(&mut self) {
        self.by_event.clear();
    }
}
