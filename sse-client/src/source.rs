//! The event source: one logical stream subscription over a sequence of HTTP
//! responses.
//!
//! An [`EventSource`] issues the streaming request, feeds the body through the
//! line assembler and demultiplexer, and reports `open`/`error`/`close`
//! lifecycle events. A close initiated by the server or the network schedules
//! a reconnect; a close requested through [`EventSource::close`] never does.

use futures_util::StreamExt;
use log::*;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::Method;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

use crate::beacon::{BeaconSender, SSE_ID};
use crate::cache::Transport;
use crate::demux::{Demultiplexer, ListenerId, Listeners, MessageEvent};
use crate::error::{transport_error, Error, TransportErrorKind};
use crate::line::LineAssembler;

pub const DEFAULT_BEACON: Duration = Duration::from_millis(5000);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1000);

const EVENT_STREAM: &str = "text/event-stream";
const LAST_EVENT_ID: &str = "last-event-id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconnectOptions {
    pub enabled: bool,
    /// Wait before reopening, unless the server announced `retry:`.
    pub delay: Duration,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// How to open a stream. Two sources with equal options for the same resource
/// share a connection when caching is on.
#[derive(Debug, Clone, Serialize)]
pub struct SourceOptions {
    #[serde(serialize_with = "serialize_method")]
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    /// Beacon interval. Zero disables beacons.
    pub beacon: Duration,
    pub reconnect: ReconnectOptions,
    #[serde(skip)]
    pub cache: bool,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            method: Method::POST,
            headers: BTreeMap::new(),
            body: None,
            beacon: DEFAULT_BEACON,
            reconnect: ReconnectOptions::default(),
            cache: true,
        }
    }
}

impl SourceOptions {
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn beacon(mut self, interval: Duration) -> Self {
        self.beacon = interval;
        self
    }

    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.reconnect.enabled = enabled;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect.delay = delay;
        self
    }

    pub fn cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }
}

fn serialize_method<S: Serializer>(method: &Method, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(method.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closed = 2,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            _ => ReadyState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleKind {
    Open,
    Error,
    Close,
}

/// Delivered to lifecycle hooks.
///
/// `status`, `status_text` and `headers` describe the latest response; before
/// any response arrives they read 500 / "Internal Server Error" / empty.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub kind: LifecycleKind,
    pub status: u16,
    pub status_text: String,
    pub headers: HeaderMap,
    /// True when the close was requested through [`EventSource::close`].
    pub is_local: bool,
    pub stream_id: Option<String>,
    pub error: Option<Arc<Error>>,
}

pub type Hook = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    open: Vec<Hook>,
    error: Vec<Hook>,
    close: Vec<Hook>,
}

impl Hooks {
    fn of(&self, kind: LifecycleKind) -> Vec<Hook> {
        match kind {
            LifecycleKind::Open => self.open.clone(),
            LifecycleKind::Error => self.error.clone(),
            LifecycleKind::Close => self.close.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct ResponseInfo {
    status: u16,
    status_text: String,
    headers: HeaderMap,
}

impl Default for ResponseInfo {
    fn default() -> Self {
        Self {
            status: 500,
            status_text: "Internal Server Error".to_string(),
            headers: HeaderMap::new(),
        }
    }
}

/// How one request/response cycle ended.
struct Outcome {
    local: bool,
    error: Option<Error>,
}

impl Outcome {
    fn local() -> Self {
        Self {
            local: true,
            error: None,
        }
    }

    fn ended() -> Self {
        Self {
            local: false,
            error: None,
        }
    }

    fn failed(error: Error) -> Self {
        Self {
            local: false,
            error: Some(error),
        }
    }
}

pub struct EventSource {
    http: reqwest::Client,
    resource: String,
    options: SourceOptions,
    state: AtomicU8,
    // True from a successful `connect` until the run loop gives up.
    running: AtomicBool,
    closed_locally: AtomicBool,
    shutdown: watch::Sender<bool>,
    listeners: Mutex<Listeners>,
    hooks: Mutex<Hooks>,
    demux: Mutex<Demultiplexer>,
    response: Mutex<ResponseInfo>,
    stream_id: Mutex<Option<String>>,
    retry: Mutex<Option<Duration>>,
    beacon_interval: Mutex<Duration>,
    beacon: Mutex<Option<BeaconSender>>,
}

impl EventSource {
    pub fn new(http: reqwest::Client, resource: impl Into<String>, options: SourceOptions) -> Self {
        let (shutdown, _) = watch::channel(false);
        let beacon_interval = options.beacon;
        Self {
            http,
            resource: resource.into(),
            options,
            state: AtomicU8::new(ReadyState::Connecting as u8),
            running: AtomicBool::new(false),
            closed_locally: AtomicBool::new(false),
            shutdown,
            listeners: Mutex::new(Listeners::default()),
            hooks: Mutex::new(Hooks::default()),
            demux: Mutex::new(Demultiplexer::new()),
            response: Mutex::new(ResponseInfo::default()),
            stream_id: Mutex::new(None),
            retry: Mutex::new(None),
            beacon_interval: Mutex::new(beacon_interval),
            beacon: Mutex::new(None),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn options(&self) -> &SourceOptions {
        &self.options
    }

    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Id the server assigned to the current stream, if it sent one.
    pub fn stream_id(&self) -> Option<String> {
        guard(&self.stream_id).clone()
    }

    pub fn last_event_id(&self) -> Option<String> {
        guard(&self.demux).last_event_id().map(str::to_string)
    }

    /// Whether a connect/read/reconnect loop is currently alive.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn add_listener<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&MessageEvent) + Send + Sync + 'static,
    {
        guard(&self.listeners).add(event, Arc::new(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        guard(&self.listeners).remove(id)
    }

    pub fn listener_count(&self, event: &str) -> usize {
        guard(&self.listeners).count(event)
    }

    pub fn on_open<F>(&self, hook: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        guard(&self.hooks).open.push(Arc::new(hook));
    }

    pub fn on_error<F>(&self, hook: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        guard(&self.hooks).error.push(Arc::new(hook));
    }

    pub fn on_close<F>(&self, hook: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        guard(&self.hooks).close.push(Arc::new(hook));
    }

    /// Changes the beacon interval, restarting the beacon of an open stream.
    /// Zero stops beaconing. Must be called inside a Tokio runtime.
    pub fn set_beacon_interval(&self, interval: Duration) {
        *guard(&self.beacon_interval) = interval;
        self.stop_beacon();
        if self.ready_state() == ReadyState::Open {
            if let Some(stream_id) = self.stream_id() {
                self.start_beacon(&stream_id);
            }
        }
    }

    /// Starts the connection loop. Returns false, doing nothing, if one is
    /// already running. Must be called inside a Tokio runtime.
    pub fn connect(self: &Arc<Self>) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Connection to {} already in flight", self.resource);
            return false;
        }

        self.closed_locally.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(false);
        self.set_state(ReadyState::Connecting);
        tokio::spawn(self.clone().run());
        true
    }

    /// Closes the stream from this side. The close hooks see `is_local` and no
    /// reconnect is scheduled.
    pub fn close(&self) {
        if self.closed_locally.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing event source for {}", self.resource);
        self.shutdown.send_replace(true);
        self.stop_beacon();
        if !self.is_running() {
            self.set_state(ReadyState::Closed);
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            let outcome = self.attempt().await;
            self.stop_beacon();
            self.set_state(ReadyState::Closed);

            let is_local = outcome.local || self.closed_locally.load(Ordering::SeqCst);
            let reconnect = !is_local && self.options.reconnect.enabled;
            if !reconnect {
                // Cleared before the close hooks so they can reconnect.
                self.running.store(false, Ordering::SeqCst);
            }

            if let Some(error) = outcome.error {
                warn!("Stream from {} failed: {}", self.resource, error);
                self.fire(LifecycleKind::Error, is_local, Some(Arc::new(error)));
            }
            self.fire(LifecycleKind::Close, is_local, None);

            if !reconnect {
                return;
            }

            let delay = self.reconnect_delay();
            debug!("Reconnecting to {} in {:?}", self.resource, delay);
            let mut shutdown = self.shutdown.subscribe();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = closed_locally(&mut shutdown) => {}
            }
            if self.closed_locally.load(Ordering::SeqCst) {
                debug!("Reconnect to {} cancelled by local close", self.resource);
                self.running.store(false, Ordering::SeqCst);
                return;
            }
        }
    }

    async fn attempt(&self) -> Outcome {
        *guard(&self.response) = ResponseInfo::default();
        *guard(&self.stream_id) = None;
        guard(&self.demux).reset();
        self.set_state(ReadyState::Connecting);

        let mut shutdown = self.shutdown.subscribe();
        if self.closed_locally.load(Ordering::SeqCst) {
            return Outcome::local();
        }

        let sent = tokio::select! {
            sent = self.request().send() => sent,
            _ = closed_locally(&mut shutdown) => return Outcome::local(),
        };
        let response = match sent {
            Ok(response) => response,
            Err(e) => return Outcome::failed(e.into()),
        };

        let status = response.status();
        let status_text = status.canonical_reason().unwrap_or_default().to_string();
        *guard(&self.response) = ResponseInfo {
            status: status.as_u16(),
            status_text: status_text.clone(),
            headers: response.headers().clone(),
        };

        if !status.is_success() {
            return Outcome::failed(transport_error(
                TransportErrorKind::Status(status.as_u16()),
                &status_text,
            ));
        }

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with(EVENT_STREAM));
        if !is_event_stream {
            return Outcome::failed(transport_error(
                TransportErrorKind::NotEventStream,
                "Response content type is not text/event-stream",
            ));
        }

        let stream_id = response
            .headers()
            .get(SSE_ID)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        *guard(&self.stream_id) = stream_id.clone();

        self.set_state(ReadyState::Open);
        info!(
            "Stream from {} open (id: {})",
            self.resource,
            stream_id.as_deref().unwrap_or("none")
        );
        self.fire(LifecycleKind::Open, false, None);
        if let Some(stream_id) = &stream_id {
            if !self.closed_locally.load(Ordering::SeqCst) {
                self.start_beacon(stream_id);
            }
        }

        let mut body = response.bytes_stream();
        let mut lines = LineAssembler::new();
        loop {
            let chunk = tokio::select! {
                chunk = body.next() => chunk,
                _ = closed_locally(&mut shutdown) => return Outcome::local(),
            };

            match chunk {
                Some(Ok(bytes)) => {
                    for line in lines.push(&bytes) {
                        self.handle_line(&line);
                    }
                }
                Some(Err(e)) => return Outcome::failed(e.into()),
                None => {
                    lines.finish();
                    debug!("Stream from {} ended by the server", self.resource);
                    return Outcome::ended();
                }
            }
        }
    }

    fn request(&self) -> reqwest::RequestBuilder {
        let mut request = self
            .http
            .request(self.options.method.clone(), &self.resource)
            .header(ACCEPT, EVENT_STREAM);
        for (name, value) in &self.options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(last_event_id) = self.last_event_id() {
            request = request.header(LAST_EVENT_ID, last_event_id);
        }
        if let Some(body) = &self.options.body {
            request = request.body(body.clone());
        }
        request
    }

    fn handle_line(&self, line: &str) {
        let event = {
            let mut demux = guard(&self.demux);
            let event = demux.feed(line);
            if let Some(retry) = demux.take_retry() {
                debug!("Server set reconnect delay to {:?}", retry);
                *guard(&self.retry) = Some(retry);
            }
            event
        };

        if let Some(event) = event {
            let listeners = guard(&self.listeners).matching(&event.event);
            if listeners.is_empty() {
                trace!("No listener for event {:?}", event.event);
            }
            for listener in listeners {
                listener(&event);
            }
        }
    }

    fn fire(&self, kind: LifecycleKind, is_local: bool, error: Option<Arc<Error>>) {
        let hooks = guard(&self.hooks).of(kind);
        let info = guard(&self.response).clone();
        let event = LifecycleEvent {
            kind,
            status: info.status,
            status_text: info.status_text,
            headers: info.headers,
            is_local,
            stream_id: self.stream_id(),
            error,
        };
        for hook in hooks {
            hook(&event);
        }
    }

    fn reconnect_delay(&self) -> Duration {
        guard(&self.retry).unwrap_or(self.options.reconnect.delay)
    }

    fn start_beacon(&self, stream_id: &str) {
        let interval = *guard(&self.beacon_interval);
        let sender = BeaconSender::start(
            self.http.clone(),
            self.options.method.clone(),
            &self.resource,
            stream_id,
            interval,
        );
        *guard(&self.beacon) = sender;
    }

    fn stop_beacon(&self) {
        guard(&self.beacon).take();
    }

    fn set_state(&self, state: ReadyState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

impl Transport for EventSource {
    fn is_closed(&self) -> bool {
        self.closed_locally.load(Ordering::SeqCst)
            || (!self.is_running() && self.ready_state() == ReadyState::Closed)
    }

    /// Final teardown: closes the stream and drops every listener, which ends
    /// any selection still reading from it.
    fn close(&self) {
        EventSource::close(self);
        guard(&self.listeners).clear();
    }
}

async fn closed_locally(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    #[test]
    fn test_default_options() {
        let options = SourceOptions::default();
        assert_eq!(options.method, Method::POST);
        assert_eq!(options.beacon, Duration::from_millis(5000));
        assert!(options.reconnect.enabled);
        assert_eq!(options.reconnect.delay, Duration::from_millis(1000));
        assert!(options.cache);
    }

    #[test]
    fn test_request_carries_headers_and_last_event_id() {
        let options = SourceOptions::default()
            .header("x-lang", "it")
            .body("{\"room\":1}");
        let source = EventSource::new(reqwest::Client::new(), "http://127.0.0.1:1/events", options);
        source.handle_line("id: 41");
        source.handle_line("");

        let request = source.request().build().unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.headers()["accept"], "text/event-stream");
        assert_eq!(request.headers()["x-lang"], "it");
        assert_eq!(request.headers()["last-event-id"], "41");
        assert!(request.body().is_some());
    }

    #[test]
    fn test_retry_field_overrides_reconnect_delay() {
        let source = EventSource::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1/events",
            SourceOptions::default(),
        );
        assert_eq!(source.reconnect_delay(), DEFAULT_RECONNECT_DELAY);
        source.handle_line("retry: 20");
        assert_eq!(source.reconnect_delay(), Duration::from_millis(20));
    }

    #[test]
    fn test_events_reach_listeners_by_name() {
        let source = EventSource::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1/events",
            SourceOptions::default(),
        );
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = source.add_listener("cat", move |event| {
            assert_eq!(event.data, "a b");
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for line in ["event: cat", "data: a%20b", "", "event: dog", "data: x", ""] {
            source.handle_line(line);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(source.remove_listener(id));
        source.handle_line("event: cat");
        source.handle_line("data: again");
        source.handle_line("");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_before_connect_marks_closed() {
        let source = EventSource::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1/events",
            SourceOptions::default(),
        );
        assert_eq!(source.ready_state(), ReadyState::Connecting);
        assert!(!source.is_closed());
        source.close();
        assert_eq!(source.ready_state(), ReadyState::Closed);
        assert!(source.is_closed());
    }

    #[tokio::test]
    async fn test_refused_connection_reports_error_then_close() {
        let source = Arc::new(EventSource::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1/events",
            SourceOptions::default().reconnect(false),
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let errors = tx.clone();
        source.on_error(move |event| {
            let _ = errors.send((event.kind, event.is_local, event.status, event.error.is_some()));
        });
        source.on_close(move |event| {
            let _ = tx.send((event.kind, event.is_local, event.status, event.error.is_some()));
        });

        assert!(source.connect());
        assert!(!source.connect());

        assert_eq!(
            rx.recv().await,
            Some((LifecycleKind::Error, false, 500, true))
        );
        assert_eq!(
            rx.recv().await,
            Some((LifecycleKind::Close, false, 500, false))
        );
        assert_eq!(source.ready_state(), ReadyState::Closed);
        assert!(!source.is_running());
        assert!(source.is_closed());
    }

    #[tokio::test]
    async fn test_local_close_cancels_pending_reconnect() {
        let source = Arc::new(EventSource::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1/events",
            SourceOptions::default().reconnect_delay(Duration::from_secs(60)),
        ));
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        source.on_close(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        });

        source.connect();
        rx.recv().await;
        assert!(source.is_running());

        source.close();
        tokio::time::timeout(Duration::from_secs(5), async {
            while source.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
