//! The "keep open" lock shared by everything that may end a stream.
//!
//! Up to four actors race to close a stream: the producer finishing, the
//! beacon deadline lapsing, the transport failing on write, and the client
//! dropping the response. All of them call [`Lock::release`]; a single
//! compare-and-set on the stream state picks the one winner, and only the
//! winner's call returns `true`. Everything that must happen once per stream
//! (ending the body, running the producer's cleanup, disarming the beacon
//! timer) waits on [`Lock::closed`] instead of being triggered by a caller, so
//! re-entrant or concurrent releases are no-ops by construction.

use log::*;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;

const CONNECTING: u8 = 0;
const OPEN: u8 = 1;
const CLOSED: u8 = 2;

/// Lifecycle of one stream. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Open,
    Closed,
}

/// Which actor closed the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Application code released the lock.
    Producer,
    /// No beacon arrived before the deadline.
    BeaconTimeout,
    /// A write found the response body already gone.
    TransportGone,
    /// The HTTP response was dropped by the server because the client went away.
    ClientAborted,
    /// Closed through the stream registry.
    Server,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            CloseReason::Producer => "producer released the lock",
            CloseReason::BeaconTimeout => "beacon timeout",
            CloseReason::TransportGone => "transport gone",
            CloseReason::ClientAborted => "client aborted",
            CloseReason::Server => "closed by server",
        };
        f.write_str(reason)
    }
}

struct Inner {
    state: AtomicU8,
    reason: OnceLock<CloseReason>,
    keep_open: watch::Sender<bool>,
}

/// Cloneable handle to one stream's lock.
#[derive(Clone)]
pub struct Lock {
    inner: Arc<Inner>,
}

impl Lock {
    pub fn new() -> Self {
        let (keep_open, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(CONNECTING),
                reason: OnceLock::new(),
                keep_open,
            }),
        }
    }

    pub fn state(&self) -> StreamState {
        match self.inner.state.load(Ordering::Acquire) {
            CONNECTING => StreamState::Connecting,
            OPEN => StreamState::Open,
            _ => StreamState::Closed,
        }
    }

    /// `true` until the stream has closed.
    pub fn is_open(&self) -> bool {
        self.state() != StreamState::Closed
    }

    /// Moves `Connecting` to `Open`. Returns `false` if the stream was not connecting.
    pub fn open(&self) -> bool {
        self.inner
            .state
            .compare_exchange(CONNECTING, OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Requests closure. Returns `true` only for the call that performed the
    /// transition; every later call is a no-op returning `false`.
    pub fn release(&self, reason: CloseReason) -> bool {
        let mut current = self.inner.state.load(Ordering::Acquire);
        loop {
            if current == CLOSED {
                return false;
            }
            match self.inner.state.compare_exchange(
                current,
                CLOSED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let _ = self.inner.reason.set(reason);
        self.inner.keep_open.send_replace(false);
        debug!("Stream lock released: {reason}");
        true
    }

    /// Writable-style setter: `set(false)` releases the lock on behalf of the
    /// producer. A closed stream can never be reopened, so `set(true)` after
    /// closure is ignored.
    pub fn set(&self, keep_open: bool) {
        if !keep_open {
            self.release(CloseReason::Producer);
        } else if !self.is_open() {
            debug!("Ignoring attempt to reopen a closed stream");
        }
    }

    /// The winning close reason, once closed.
    pub fn reason(&self) -> Option<CloseReason> {
        self.inner.reason.get().copied()
    }

    /// Change notifications of the "keep open" flag. The flag starts `true`
    /// and flips to `false` exactly once.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.keep_open.subscribe()
    }

    /// Resolves once the stream has closed (immediately if it already has).
    pub async fn closed(&self) {
        let mut keep_open = self.subscribe();
        let _ = keep_open.wait_for(|open| !*open).await;
    }

    pub fn ptr_eq(&self, other: &Lock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("state", &self.state())
            .field("reason", &self.reason())
            .finish()
    }
}
