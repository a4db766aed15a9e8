//! Client half of the beacon-tracked Server-Sent Events transport.
//!
//! A [`Client`] hands out [`Source`]s. Each source subscribes to a stream
//! resource; sources with the same resource and options share one
//! [`EventSource`] through the connection cache. Named events are read
//! through [`Selection`]s:
//!
//! ```rust,ignore
//! let client = sse_client::Client::new();
//! let source = client.source("http://localhost:4000/events", SourceOptions::default())?;
//! let mut quotes = source.select("cat-quote")?;
//! while let Some(quote) = quotes.recv().await {
//!     println!("{quote}");
//! }
//! ```
//!
//! While a stream is open the client beacons `resource?x-sse-id=<id>` so the
//! server knows someone is still reading. Streams closed by the server or
//! the network reopen after a delay; streams closed locally stay closed.

pub mod beacon;
pub mod cache;
pub mod client;
pub mod demux;
pub mod error;
pub mod line;
pub mod source;

pub use client::{Client, JsonFallback, JsonSelection, Selection, Source, Transformed};
pub use demux::MessageEvent;
pub use error::Error;
pub use source::{
    EventSource, LifecycleEvent, LifecycleKind, ReadyState, ReconnectOptions, SourceOptions,
};
