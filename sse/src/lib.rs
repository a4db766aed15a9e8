//! Server half of the beacon-tracked Server-Sent Events transport.
//!
//! One HTTP response carries one stream. Application code supplies a `start`
//! producer that receives a [`Connection`] and emits events through it; the
//! crate frames them, keeps the response open and decides when it ends.
//!
//! # Architecture
//!
//! - **Frame codec** (`codec`): `id` / `event` / percent-encoded `data` lines
//!   terminated by a blank line.
//! - **Emitter** (`emitter`): numbers events per stream and writes frames to the
//!   response body. Emitting after closure fails with `StreamClosed` instead of
//!   dropping data silently.
//! - **Lock** (`lock`): the "keep open" flag. Producer, beacon timer, failed
//!   writes and client disconnects all race to release it; one compare-and-set
//!   picks the winner and everything else is a no-op.
//! - **Liveness tracker** (`liveness`): per-stream beacon deadline. Clients
//!   beacon with the id from the `x-sse-id` response header; a stream whose
//!   client stops beaconing is closed once the deadline lapses.
//! - **Streams** (`stream`): process-wide registry that answers beacons and
//!   opens new streams, wiring the pieces above together.
//!
//! # Example: a stream route
//!
//! ```rust,ignore
//! use axum::extract::{RawQuery, State};
//! use sse::{Streams, StreamOptions};
//!
//! async fn clock(State(streams): State<Arc<Streams>>, RawQuery(query): RawQuery) -> Response {
//!     streams.serve(query.as_deref(), &StreamOptions::default(), |conn| async move {
//!         while conn.emit("message", &now()).is_ok() {
//!             tokio::time::sleep(Duration::from_secs(1)).await;
//!         }
//!         None
//!     })
//! }
//! ```
//!
//! # Modules
//!
//! - `beacon`: beacon query parsing and header names
//! - `codec`: event records and wire framing
//! - `emitter`: `Emitter` and the raw `Sink`
//! - `error`: error kinds returned by emission
//! - `id`: `StreamId`
//! - `liveness`: `LivenessTracker`
//! - `lock`: `Lock`, `StreamState`, `CloseReason`
//! - `stream`: `Streams`, `StreamOptions`, `Connection`

pub mod beacon;
pub mod codec;
pub mod emitter;
pub mod error;
pub mod id;
pub mod liveness;
pub mod lock;
pub mod stream;

pub use codec::EventRecord;
pub use error::Error;
pub use id::StreamId;
pub use lock::{CloseReason, Lock, StreamState};
pub use stream::{Cleanup, Connection, StopHook, StreamOptions, Streams};
