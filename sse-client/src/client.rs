use log::*;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::cache::{CacheKey, ConnectionCache, Transport};
use crate::demux::{ListenerId, MessageEvent};
use crate::error::{validation_error, Error, ValidationErrorKind};
use crate::source::{EventSource, SourceOptions};

/// Entry point for consumers. Cheap to clone; clones share one connection
/// cache and one HTTP client.
#[derive(Clone, Default)]
pub struct Client {
    http: reqwest::Client,
    cache: Arc<ConnectionCache<EventSource>>,
}

impl Client {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_http(http: reqwest::Client) -> Self {
        Self {
            http,
            cache: Arc::default(),
        }
    }

    /// Subscribes to `resource`. With caching on, sources for the same
    /// resource and options share one connection until the last is dropped.
    ///
    /// Must be called inside a Tokio runtime; a new connection starts
    /// immediately.
    pub fn source(&self, resource: &str, options: SourceOptions) -> Result<Source, Error> {
        if !options.cache {
            let transport = Arc::new(EventSource::new(self.http.clone(), resource, options));
            transport.connect();
            return Ok(Source {
                transport,
                lease: None,
            });
        }

        let key = CacheKey::new(resource, &options)?;
        let http = self.http.clone();
        let (transport, built) = self
            .cache
            .acquire(&key, || EventSource::new(http, resource, options));
        if built {
            debug!("Opening shared connection to {}", resource);
            transport.connect();
        }

        Ok(Source {
            transport,
            lease: Some(Lease {
                key,
                cache: self.cache.clone(),
            }),
        })
    }

    pub fn cache(&self) -> &ConnectionCache<EventSource> {
        &self.cache
    }
}

struct Lease {
    key: CacheKey,
    cache: Arc<ConnectionCache<EventSource>>,
}

/// One subscriber's handle on a connection. Dropping it releases the
/// subscription; the connection closes when no subscriber is left.
pub struct Source {
    transport: Arc<EventSource>,
    lease: Option<Lease>,
}

impl Source {
    pub fn transport(&self) -> &Arc<EventSource> {
        &self.transport
    }

    /// Receives the data of every event named `event`.
    pub fn select(&self, event: &str) -> Result<Selection, Error> {
        if event.contains(['\n', '\r']) {
            return Err(validation_error(
                ValidationErrorKind::EventNameContainsNewline,
                "Event names cannot contain newlines",
            ));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let listener = self.transport.add_listener(event, move |message: &MessageEvent| {
            let _ = sender.send(message.data.clone());
        });

        Ok(Selection {
            event: event.to_string(),
            receiver,
            listener,
            transport: self.transport.clone(),
        })
    }

    /// Releases this subscription now instead of at the end of scope.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        match self.lease.take() {
            Some(lease) => {
                lease.cache.release(&lease.key, &self.transport);
            }
            None => Transport::close(self.transport.as_ref()),
        }
    }
}

/// The data of one named event, in arrival order.
///
/// `recv` yields `None` once the underlying connection is torn down.
pub struct Selection {
    event: String,
    receiver: mpsc::UnboundedReceiver<String>,
    listener: ListenerId,
    transport: Arc<EventSource>,
}

impl Selection {
    pub fn event(&self) -> &str {
        &self.event
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.receiver.try_recv().ok()
    }

    /// Parses each payload as JSON. A payload that fails to parse repeats the
    /// latest value that did parse.
    pub fn json<T: DeserializeOwned + Clone + 'static>(self) -> JsonSelection<T> {
        self.json_or(repeat_previous::<T>)
    }

    /// Parses each payload as JSON and hands unparseable ones to `or`, which
    /// picks the value to yield. Returning `None` skips the payload.
    pub fn json_or<T, F>(self, or: F) -> JsonSelection<T>
    where
        T: DeserializeOwned + Clone + 'static,
        F: FnMut(JsonFallback<'_, T>) -> Option<T> + Send + 'static,
    {
        JsonSelection {
            inner: self,
            latest: None,
            or: Box::new(or),
        }
    }

    /// Maps every payload through `transformer`.
    pub fn transform<U, F>(self, transformer: F) -> Transformed<F>
    where
        F: FnMut(String) -> U,
    {
        Transformed {
            inner: self,
            transformer,
        }
    }
}

impl Drop for Selection {
    fn drop(&mut self) {
        self.transport.remove_listener(self.listener);
    }
}

/// A [`Selection`] mapped through a function.
pub struct Transformed<F> {
    inner: Selection,
    transformer: F,
}

impl<U, F: FnMut(String) -> U> Transformed<F> {
    pub async fn recv(&mut self) -> Option<U> {
        let data = self.inner.recv().await?;
        Some((self.transformer)(data))
    }
}

/// What a JSON fallback gets to decide with.
pub struct JsonFallback<'a, T> {
    pub error: &'a serde_json::Error,
    pub raw: &'a str,
    /// Latest payload that parsed, if any.
    pub previous: Option<&'a T>,
}

type Fallback<T> = Box<dyn for<'a> FnMut(JsonFallback<'a, T>) -> Option<T> + Send>;

fn repeat_previous<T: Clone>(fallback: JsonFallback<'_, T>) -> Option<T> {
    fallback.previous.cloned()
}

/// A [`Selection`] whose payloads are JSON values.
///
/// Payloads that fail to parse are logged and passed to the fallback.
pub struct JsonSelection<T> {
    inner: Selection,
    latest: Option<T>,
    or: Fallback<T>,
}

impl<T: DeserializeOwned + Clone> JsonSelection<T> {
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let data = self.inner.recv().await?;
            match serde_json::from_str::<T>(&data) {
                Ok(value) => {
                    self.latest = Some(value.clone());
                    return Some(value);
                }
                Err(e) => {
                    warn!(
                        "Could not parse {} payload as JSON: {}",
                        self.inner.event(),
                        e
                    );
                    let fallback = JsonFallback {
                        error: &e,
                        raw: &data,
                        previous: self.latest.as_ref(),
                    };
                    if let Some(value) = (self.or)(fallback) {
                        return Some(value);
                    }
                }
            }
        }
    }

    pub fn latest(&self) -> Option<&T> {
        self.latest.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    // Nothing listens on port 1. The long reconnect delay keeps each
    // transport parked between attempts instead of closed.
    const UNREACHABLE: &str = "http://127.0.0.1:1/events";

    fn quiet() -> SourceOptions {
        SourceOptions::default()
            .reconnect_delay(std::time::Duration::from_secs(60))
            .beacon(std::time::Duration::ZERO)
    }

    #[tokio::test]
    async fn test_select_rejects_newline_in_event_name() {
        let client = Client::new();
        let source = client.source(UNREACHABLE, quiet()).unwrap();
        let err = source.select("cat\ndog").err().unwrap();
        assert_eq!(
            err.error_kind,
            ErrorKind::Validation(ValidationErrorKind::EventNameContainsNewline)
        );
    }

    #[tokio::test]
    async fn test_sources_with_equal_options_share_connection() {
        let client = Client::new();
        let first = client.source(UNREACHABLE, quiet()).unwrap();
        let second = client.source(UNREACHABLE, quiet()).unwrap();
        let other = client.source(UNREACHABLE, quiet().header("x-lang", "it")).unwrap();

        assert!(Arc::ptr_eq(first.transport(), second.transport()));
        assert!(!Arc::ptr_eq(first.transport(), other.transport()));
        assert_eq!(client.cache().len(), 2);

        let shared = first.transport().clone();
        drop(first);
        assert!(!shared.is_closed());
        drop(second);
        assert!(shared.is_closed());
        assert_eq!(client.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_uncached_sources_are_independent() {
        let client = Client::new();
        let first = client.source(UNREACHABLE, quiet().cache(false)).unwrap();
        let second = client.source(UNREACHABLE, quiet().cache(false)).unwrap();
        assert!(!Arc::ptr_eq(first.transport(), second.transport()));
        assert!(client.cache().is_empty());
    }

    #[tokio::test]
    async fn test_dropping_selection_removes_listener() {
        let client = Client::new();
        let source = client.source(UNREACHABLE, quiet()).unwrap();
        let selection = source.select("cat").unwrap();
        assert_eq!(source.transport().listener_count("cat"), 1);
        drop(selection);
        assert_eq!(source.transport().listener_count("cat"), 0);
    }

    #[tokio::test]
    async fn test_select_rejects_carriage_return_in_event_name() {
        let client = Client::new();
        let source = client.source(UNREACHABLE, quiet()).unwrap();
        assert!(source.select("cat\r").is_err());
    }

    #[tokio::test]
    async fn test_close_releases_the_shared_connection() {
        let client = Client::new();
        let source = client.source(UNREACHABLE, quiet()).unwrap();
        let shared = source.transport().clone();
        source.close();
        assert!(shared.is_closed());
        assert!(client.cache().is_empty());
    }

    #[tokio::test]
    async fn test_selection_ends_when_last_source_is_dropped() {
        let client = Client::new();
        let source = client.source(UNREACHABLE, quiet()).unwrap();
        let mut selection = source.select("cat").unwrap();
        drop(source);
        assert_eq!(selection.recv().await, None);
    }
}
