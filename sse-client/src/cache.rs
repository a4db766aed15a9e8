use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::*;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::error::Error;

/// What the cache needs to know about a shared connection.
pub trait Transport: Send + Sync + 'static {
    /// True once the transport will never deliver events again.
    fn is_closed(&self) -> bool;
    /// Closes the transport locally.
    fn close(&self);
}

/// Deterministic key derived from a resource and the request options used to
/// open it. Equal inputs give equal keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new<O: Serialize>(resource: &str, options: &O) -> Result<Self, Error> {
        let encoded = serde_json::to_vec(&(resource, options))?;
        Ok(Self(URL_SAFE_NO_PAD.encode(encoded)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

enum Release {
    Last,
    Shared,
    Stale,
}

struct CacheEntry<T> {
    transport: Arc<T>,
    subscribers: usize,
}

/// Shares one transport among every subscriber asking for the same key.
///
/// Each `acquire` must be paired with one `release` of the handle it returned.
/// The last release closes the transport and forgets the key. A closed
/// transport is never handed out again; the next `acquire` replaces it.
pub struct ConnectionCache<T: Transport> {
    entries: DashMap<CacheKey, CacheEntry<T>>,
}

impl<T: Transport> Default for ConnectionCache<T> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<T: Transport> ConnectionCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the transport for `key`, building it with `build` when there is
    /// no usable one. The flag is true when `build` ran.
    pub fn acquire<F>(&self, key: &CacheKey, build: F) -> (Arc<T>, bool)
    where
        F: FnOnce() -> T,
    {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.transport.is_closed() {
                    debug!("Replacing closed transport for key {}", key);
                    let transport = Arc::new(build());
                    *entry = CacheEntry {
                        transport: transport.clone(),
                        subscribers: 1,
                    };
                    (transport, true)
                } else {
                    entry.subscribers += 1;
                    trace!(
                        "Sharing transport for key {} ({} subscribers)",
                        key,
                        entry.subscribers
                    );
                    (entry.transport.clone(), false)
                }
            }
            Entry::Vacant(vacant) => {
                let transport = Arc::new(build());
                vacant.insert(CacheEntry {
                    transport: transport.clone(),
                    subscribers: 1,
                });
                (transport, true)
            }
        }
    }

    /// Drops one subscription to `transport`. Returns true when this was the
    /// last one and the transport was closed.
    ///
    /// Releasing a handle that has since been replaced in the cache only
    /// closes that stale handle.
    pub fn release(&self, key: &CacheKey, transport: &Arc<T>) -> bool {
        // Decided under the entry guard so exactly one release sees zero.
        let outcome = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) if Arc::ptr_eq(&occupied.get().transport, transport) => {
                let entry = occupied.get_mut();
                entry.subscribers = entry.subscribers.saturating_sub(1);
                if entry.subscribers == 0 {
                    occupied.remove();
                    Release::Last
                } else {
                    Release::Shared
                }
            }
            _ => Release::Stale,
        };

        match outcome {
            Release::Last => {
                debug!("Last subscriber released key {}, closing transport", key);
                transport.close();
                true
            }
            Release::Stale => {
                transport.close();
                false
            }
            Release::Shared => false,
        }
    }

    pub fn subscribers(&self, key: &CacheKey) -> usize {
        self.entries.get(key).map_or(0, |entry| entry.subscribers)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
