use crate::beacon::{find_beacon, SSE_ID_HEADER};
use crate::codec;
use crate::emitter::{Emitter, Sink};
use crate::error::Error;
use crate::id::StreamId;
use crate::liveness::LivenessTracker;
use crate::lock::{CloseReason, Lock};
use axum::body::{Body, Bytes};
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::stream::Stream;
use log::*;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Deferred teardown returned by a producer, run once after the stream closes.
pub type Cleanup = Box<dyn FnOnce() + Send + 'static>;

/// Route-level hook run once per stream as soon as it closes.
pub type StopHook = Arc<dyn Fn(&StreamId) + Send + Sync + 'static>;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(7_000);
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Per-route stream settings.
#[derive(Clone)]
pub struct StreamOptions {
    /// Beacon deadline. Zero keeps the stream open until it is closed explicitly.
    pub timeout: Duration,
    /// Period of `: ping` comment frames, `None` to disable.
    pub keep_alive: Option<Duration>,
    /// Extra response headers. The four stream headers always take precedence.
    pub headers: HeaderMap,
    /// Runs when the stream closes, whether or not `start` has returned.
    pub stop: Option<StopHook>,
}

impl StreamOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn keep_alive(mut self, keep_alive: Option<Duration>) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn stop<F>(mut self, stop: F) -> Self
    where
        F: Fn(&StreamId) + Send + Sync + 'static,
    {
        self.stop = Some(Arc::new(stop));
        self
    }
}

impl fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOptions")
            .field("timeout", &self.timeout)
            .field("keep_alive", &self.keep_alive)
            .field("headers", &self.headers)
            .field("stop", &self.stop.is_some())
            .finish()
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            keep_alive: Some(DEFAULT_KEEP_ALIVE),
            headers: HeaderMap::new(),
            stop: None,
        }
    }
}

/// What a producer gets to work with: the emitter, the lock and the raw sink.
#[derive(Clone)]
pub struct Connection {
    id: StreamId,
    emitter: Emitter,
    lock: Lock,
}

impl Connection {
    pub fn id(&self) -> &StreamId {
        &self.id
    }

    /// See [`Emitter::emit`]. Producers must stop on `StreamClosed`.
    pub fn emit(&self, event: &str, data: &str) -> Result<(), Error> {
        self.emitter.emit(event, data)
    }

    pub fn emit_json<T: Serialize + ?Sized>(&self, event: &str, value: &T) -> Result<(), Error> {
        self.emitter.emit_json(event, value)
    }

    pub fn emit_bytes(&self, event: &str, data: &[u8]) -> Result<(), Error> {
        self.emitter.emit_bytes(event, data)
    }

    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    pub fn sink(&self) -> &Sink {
        self.emitter.sink()
    }

    /// Ends the stream from the producer side. Same as `lock().set(false)`.
    pub fn close(&self) -> bool {
        self.lock.release(CloseReason::Producer)
    }

    pub fn is_open(&self) -> bool {
        self.lock.is_open()
    }
}

/// Registry of every stream open in this process, plus the beacon timers.
///
/// Share one instance (in an `Arc`) across all stream routes so beacons reach
/// the stream they belong to regardless of which route answers them.
pub struct Streams {
    tracker: Arc<LivenessTracker>,
    open: DashMap<StreamId, Lock>,
}

impl Streams {
    pub fn new() -> Self {
        Self {
            tracker: Arc::new(LivenessTracker::new()),
            open: DashMap::new(),
        }
    }

    /// Entry point for a stream route.
    ///
    /// A request whose query carries a non-empty `x-sse-id` is a beacon: the
    /// matching deadline is reset and an empty `200` comes back. Anything else
    /// opens a new stream, runs `start` on it and returns the streaming response.
    pub fn serve<F, Fut>(
        self: &Arc<Self>,
        query: Option<&str>,
        options: &StreamOptions,
        start: F,
    ) -> Response
    where
        F: FnOnce(Connection) -> Fut + Send + 'static,
        Fut: Future<Output = Option<Cleanup>> + Send + 'static,
    {
        match find_beacon(query) {
            Some(id) => {
                self.beacon(&id);
                StatusCode::OK.into_response()
            }
            None => self.open_stream(options, start),
        }
    }

    /// Resets the deadline of `id`. Unknown ids are ignored and return `false`.
    pub fn beacon(&self, id: &StreamId) -> bool {
        self.tracker.beacon(id)
    }

    /// Opens a stream unconditionally.
    ///
    /// `start` runs on its own task and may return long before the stream
    /// ends; only the lock decides when the stream closes. A returned cleanup
    /// runs after both `start` has finished and the stream has closed, while
    /// the options' stop hook runs as soon as the stream closes.
    pub fn open_stream<F, Fut>(self: &Arc<Self>, options: &StreamOptions, start: F) -> Response
    where
        F: FnOnce(Connection) -> Fut + Send + 'static,
        Fut: Future<Output = Option<Cleanup>> + Send + 'static,
    {
        let lock = Lock::new();
        let id = self.register(&lock);
        let (sender, receiver) = mpsc::unbounded_channel();
        let emitter = Emitter::new(Sink::new(sender.clone(), lock.clone()));
        let connection = Connection {
            id: id.clone(),
            emitter,
            lock: lock.clone(),
        };

        self.tracker.arm(&id, options.timeout, &lock);
        lock.open();
        info!("Opened stream {id}");

        let producer_lock = lock.clone();
        let producer_id = id.clone();
        tokio::spawn(async move {
            let cleanup = start(connection).await;
            producer_lock.closed().await;
            if let Some(cleanup) = cleanup {
                debug!("Running cleanup for stream {producer_id}");
                cleanup();
            }
        });

        let streams = Arc::clone(self);
        let watched_lock = lock.clone();
        let watched_id = id.clone();
        let stop = options.stop.clone();
        tokio::spawn(async move {
            watched_lock.closed().await;
            streams
                .open
                .remove_if(&watched_id, |_, open| open.ptr_eq(&watched_lock));
            if let Some(stop) = stop {
                stop(&watched_id);
            }
            info!(
                "Closed stream {watched_id} ({})",
                watched_lock
                    .reason()
                    .map(|reason| reason.to_string())
                    .unwrap_or_default()
            );
        });

        let body = body_stream(id.clone(), receiver, sender, lock, options.keep_alive);
        let mut response = Body::from_stream(body).into_response();
        let headers = response.headers_mut();
        for (name, value) in options.headers.iter() {
            headers.insert(name.clone(), value.clone());
        }
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        match HeaderValue::from_str(id.as_str()) {
            Ok(value) => {
                headers.insert(HeaderName::from_static(SSE_ID_HEADER), value);
            }
            Err(e) => warn!("Stream id {id} is not a valid header value: {e}"),
        }
        response
    }

    /// Number of streams currently open.
    pub fn active(&self) -> usize {
        self.open.len()
    }

    pub fn is_open(&self, id: &StreamId) -> bool {
        self.open.contains_key(id)
    }

    /// Closes a stream by id. Returns `false` if no such stream was open.
    pub fn close(&self, id: &StreamId) -> bool {
        let lock = self.open.get(id).map(|open| open.value().clone());
        match lock {
            Some(lock) => lock.release(CloseReason::Server),
            None => false,
        }
    }

    pub fn tracker(&self) -> &Arc<LivenessTracker> {
        &self.tracker
    }

    /// Mints an id no open stream currently holds and records it.
    fn register(&self, lock: &Lock) -> StreamId {
        loop {
            let id = StreamId::new();
            match self.open.entry(id.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(lock.clone());
                    return id;
                }
                Entry::Occupied(_) => {
                    warn!("Stream id collision on {id}, generating another");
                }
            }
        }
    }
}

impl Default for Streams {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the lock when the response body is dropped before the stream
/// closed, which is how a client disconnect surfaces on the server.
struct ReleaseOnDrop {
    lock: Lock,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        if self.lock.release(CloseReason::ClientAborted) {
            debug!("Stream body dropped while open, client went away");
        }
    }
}

enum Step {
    Frame(Option<Bytes>),
    Closed,
    KeepAlive,
}

fn body_stream(
    id: StreamId,
    mut receiver: UnboundedReceiver<Bytes>,
    // Keeps the channel open after the producer drops its connection.
    sender: mpsc::UnboundedSender<Bytes>,
    lock: Lock,
    keep_alive: Option<Duration>,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    // Captured rather than created inside the generator, so a body that is
    // dropped before its first poll still releases the lock.
    let guard = ReleaseOnDrop { lock: lock.clone() };
    async_stream::stream! {
        let _sender = sender;
        let _guard = guard;
        let mut ticker = keep_alive.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            let step = tokio::select! {
                biased;
                frame = receiver.recv() => Step::Frame(frame),
                _ = lock.closed() => Step::Closed,
                _ = tick(&mut ticker) => Step::KeepAlive,
            };

            match step {
                Step::Frame(Some(frame)) => yield Ok(frame),
                Step::Frame(None) => break,
                Step::KeepAlive => yield Ok(codec::comment("ping")),
                Step::Closed => {
                    // Later sends fail and surface as `StreamClosed`; frames
                    // already queued still go out.
                    receiver.close();
                    while let Ok(frame) = receiver.try_recv() {
                        yield Ok(frame);
                    }
                    break;
                }
            }
        }
        debug!("Body of stream {id} finished");
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::extract::{RawQuery, State};
    use axum::http::Request;
    use axum::routing::post;
    use axum::Router;
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tower::ServiceExt;

    fn sse_id(response: &Response) -> StreamId {
        StreamId::from(
            response.headers()[SSE_ID_HEADER]
                .to_str()
                .unwrap()
                .to_string(),
        )
    }

    async fn body_text(response: Response) -> String {
        let bytes = tokio::time::timeout(
            Duration::from_secs(2),
            to_bytes(response.into_body(), usize::MAX),
        )
        .await
        .expect("stream should end")
        .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_emits_then_closes_on_release() {
        let streams = Arc::new(Streams::new());
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cleaned);

        let response = streams.open_stream(&StreamOptions::default(), move |conn| async move {
            for n in 1..=3 {
                conn.emit("msg", &n.to_string()).unwrap();
            }
            conn.lock().set(false);
            assert!(conn.emit("msg", "4").unwrap_err().is_stream_closed());
            Some(Box::new(move || flag.store(true, Ordering::SeqCst)) as Cleanup)
        });

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[CACHE_CONTROL], "no-store");
        assert_eq!(headers[CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[CONNECTION], "keep-alive");
        let id = sse_id(&response);

        assert_eq!(
            body_text(response).await,
            "id: 1\nevent: msg\ndata: 1\n\n\
             id: 2\nevent: msg\ndata: 2\n\n\
             id: 3\nevent: msg\ndata: 3\n\n"
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cleaned.load(Ordering::SeqCst));
        assert!(!streams.is_open(&id));
        assert_eq!(streams.active(), 0);
    }

    #[tokio::test]
    async fn test_returning_from_start_does_not_close_the_stream() {
        let streams = Arc::new(Streams::new());
        let options = StreamOptions::default().timeout(Duration::ZERO);
        let response = streams.open_stream(&options, |_conn| async { None });
        let id = sse_id(&response);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(streams.is_open(&id));

        assert!(streams.close(&id));
        assert!(!streams.close(&id));
        assert_eq!(body_text(response).await, "");
    }

    #[tokio::test]
    async fn test_cleanup_waits_for_close_and_runs_once() {
        let streams = Arc::new(Streams::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let options = StreamOptions::default().timeout(Duration::ZERO);

        let response = streams.open_stream(&options, move |_conn| async move {
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }) as Cleanup)
        });
        let id = sse_id(&response);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        streams.close(&id);
        drop(response);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_hook_runs_while_start_is_still_pending() {
        let streams = Arc::new(Streams::new());
        let stopped = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&stopped);
        let options = StreamOptions::default()
            .timeout(Duration::ZERO)
            .stop(move |id| seen.lock().unwrap().push(id.clone()));

        // Never returns, so any cleanup it might hand back never runs.
        let response = streams.open_stream(&options, |_conn| std::future::pending());
        let id = sse_id(&response);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(stopped.lock().unwrap().is_empty());

        streams.close(&id);
        assert_eq!(body_text(response).await, "");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*stopped.lock().unwrap(), vec![id]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_emit_racing_close_is_either_delivered_or_rejected() {
        for _ in 0..200 {
            let lock = Lock::new();
            lock.open();
            let (sender, receiver) = mpsc::unbounded_channel();
            let emitter = Emitter::new(Sink::new(sender.clone(), lock.clone()));
            let body = body_stream(StreamId::new(), receiver, sender, lock.clone(), None);

            let producer = std::thread::spawn(move || {
                let mut accepted = 0;
                while emitter.emit("msg", "x").is_ok() {
                    accepted += 1;
                }
                accepted
            });
            tokio::task::yield_now().await;
            lock.release(CloseReason::Server);

            let delivered = body.collect::<Vec<_>>().await.len();
            let accepted = producer.join().unwrap();
            assert_eq!(delivered, accepted);
        }
    }

    #[tokio::test]
    async fn test_dropping_the_response_releases_the_lock() {
        let streams = Arc::new(Streams::new());
        let (tx, rx) = tokio::sync::oneshot::channel();
        let options = StreamOptions::default().timeout(Duration::ZERO);

        let response = streams.open_stream(&options, move |conn| async move {
            let _ = tx.send(conn.clone());
            None
        });
        let conn = rx.await.unwrap();
        drop(response);

        tokio::time::timeout(Duration::from_secs(1), conn.lock().closed())
            .await
            .unwrap();
        assert_eq!(conn.lock().reason(), Some(CloseReason::ClientAborted));
        assert!(conn.emit("msg", "gone").unwrap_err().is_stream_closed());
    }

    #[tokio::test]
    async fn test_beacon_timeout_closes_stream() {
        let streams = Arc::new(Streams::new());
        let options = StreamOptions::default().timeout(Duration::from_millis(50));
        let response = streams.open_stream(&options, |_conn| async { None });
        let id = sse_id(&response);
        assert!(streams.tracker().is_armed(&id));

        assert_eq!(body_text(response).await, "");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!streams.is_open(&id));
        assert!(!streams.beacon(&id));
    }

    #[tokio::test]
    async fn test_keep_alive_comments() {
        let streams = Arc::new(Streams::new());
        let options = StreamOptions::default()
            .timeout(Duration::ZERO)
            .keep_alive(Some(Duration::from_millis(20)));
        let response = streams.open_stream(&options, |conn| async move {
            tokio::time::sleep(Duration::from_millis(70)).await;
            conn.close();
            None
        });

        let text = body_text(response).await;
        assert!(text.starts_with(": ping\n\n"), "got {text:?}");
    }

    #[tokio::test]
    async fn test_custom_headers_never_override_stream_headers() {
        let streams = Arc::new(Streams::new());
        let options = StreamOptions::default()
            .timeout(Duration::ZERO)
            .header(HeaderName::from_static("x-room"), HeaderValue::from_static("lobby"))
            .header(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let response = streams.open_stream(&options, |conn| async move {
            conn.close();
            None
        });

        assert_eq!(response.headers()["x-room"], "lobby");
        assert_eq!(response.headers()[CONTENT_TYPE], "text/event-stream");
    }

    async fn route(State(streams): State<Arc<Streams>>, RawQuery(query): RawQuery) -> Response {
        let options = StreamOptions::default().timeout(Duration::from_millis(200));
        streams.serve(query.as_deref(), &options, |conn| async move {
            let _ = conn.emit("hello", "world");
            None
        })
    }

    fn app(streams: Arc<Streams>) -> Router {
        Router::new().route("/events", post(route)).with_state(streams)
    }

    fn post_to(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_beacon_for_known_stream_is_acknowledged_without_new_stream() {
        let streams = Arc::new(Streams::new());
        let opened = app(Arc::clone(&streams))
            .oneshot(post_to("/events"))
            .await
            .unwrap();
        let id = sse_id(&opened);
        assert_eq!(streams.active(), 1);

        let ack = app(Arc::clone(&streams))
            .oneshot(post_to(&format!("/events?x-sse-id={id}")))
            .await
            .unwrap();

        assert_eq!(ack.status(), StatusCode::OK);
        assert!(ack.headers().get(SSE_ID_HEADER).is_none());
        assert_eq!(body_text(ack).await, "");
        assert_eq!(streams.active(), 1);
        drop(opened);
    }

    #[tokio::test]
    async fn test_beacon_for_unknown_stream_is_acknowledged() {
        let streams = Arc::new(Streams::new());
        let ack = app(Arc::clone(&streams))
            .oneshot(post_to("/events?x-sse-id=expired-long-ago"))
            .await
            .unwrap();

        assert_eq!(ack.status(), StatusCode::OK);
        assert!(ack.headers().get(SSE_ID_HEADER).is_none());
        assert_eq!(streams.active(), 0);
    }

    #[tokio::test]
    async fn test_empty_beacon_id_opens_a_new_stream() {
        let streams = Arc::new(Streams::new());
        let response = app(Arc::clone(&streams))
            .oneshot(post_to("/events?x-sse-id="))
            .await
            .unwrap();

        assert_eq!(response.headers()[CONTENT_TYPE], "text/event-stream");
        let id = sse_id(&response);
        assert!(!id.as_str().is_empty());
        assert!(streams.is_open(&id));
        streams.close(&id);
    }
}
