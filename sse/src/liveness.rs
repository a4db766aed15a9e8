use crate::id::StreamId;
use crate::lock::{CloseReason, Lock};
use dashmap::DashMap;
use log::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

/// Handle used to push one stream's beacon deadline forward.
struct BeaconTimer {
    reset: Arc<Notify>,
}

/// Process-wide table of beacon deadlines, keyed by stream id.
///
/// Every armed stream gets one timer task. The task sleeps until the deadline,
/// restarts the wait whenever a beacon notifies it, and releases the stream's
/// lock if the deadline passes. The entry removes itself when the stream
/// closes through any path, so beacons for closed or unknown streams find
/// nothing and are ignored.
pub struct LivenessTracker {
    timers: DashMap<StreamId, BeaconTimer>,
}

impl LivenessTracker {
    pub fn new() -> Self {
        Self {
            timers: DashMap::new(),
        }
    }

    /// Starts tracking `id`. A zero `timeout` disables tracking for the stream.
    pub fn arm(self: &Arc<Self>, id: &StreamId, timeout: Duration, lock: &Lock) {
        if timeout.is_zero() {
            debug!("Beacon tracking disabled for stream {id}");
            return;
        }

        let reset = Arc::new(Notify::new());
        self.timers.insert(
            id.clone(),
            BeaconTimer {
                reset: Arc::clone(&reset),
            },
        );

        let tracker = Arc::clone(self);
        let id = id.clone();
        let lock = lock.clone();
        tokio::spawn(async move {
            let mut deadline = Instant::now() + timeout;
            loop {
                tokio::select! {
                    _ = sleep_until(deadline) => {
                        if lock.release(CloseReason::BeaconTimeout) {
                            info!("No beacon for stream {id} within {timeout:?}, closing it");
                        }
                        break;
                    }
                    _ = reset.notified() => {
                        deadline = Instant::now() + timeout;
                    }
                    _ = lock.closed() => break,
                }
            }
            tracker.disarm(&id, &reset);
        });
    }

    /// Registers a beacon. Returns `false` when `id` is not tracked, which is
    /// normal for streams that already closed.
    pub fn beacon(&self, id: &StreamId) -> bool {
        match self.timers.get(id) {
            Some(timer) => {
                timer.reset.notify_one();
                trace!("Beacon received for stream {id}");
                true
            }
            None => {
                debug!("Beacon for unknown stream {id}, ignoring");
                false
            }
        }
    }

    pub fn is_armed(&self, id: &StreamId) -> bool {
        self.timers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    fn disarm(&self, id: &StreamId, reset: &Arc<Notify>) {
        // Only remove the entry this task inserted.
        self.timers
            .remove_if(id, |_, timer| Arc::ptr_eq(&timer.reset, reset));
    }
}

impl Default for LivenessTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn armed(timeout: Duration) -> (Arc<LivenessTracker>, StreamId, Lock) {
        let tracker = Arc::new(LivenessTracker::new());
        let id = StreamId::new();
        let lock = Lock::new();
        lock.open();
        tracker.arm(&id, timeout, &lock);
        (tracker, id, lock)
    }

    #[tokio::test]
    async fn test_deadline_without_beacon_closes_stream() {
        let (tracker, id, lock) = armed(Duration::from_millis(40));
        assert!(tracker.is_armed(&id));

        tokio::time::timeout(Duration::from_secs(1), lock.closed())
            .await
            .expect("stream should close on beacon timeout");
        assert_eq!(lock.reason(), Some(CloseReason::BeaconTimeout));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!tracker.is_armed(&id));
    }

    #[tokio::test]
    async fn test_regular_beacons_keep_stream_open() {
        let (tracker, id, lock) = armed(Duration::from_millis(80));

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(tracker.beacon(&id));
        }
        assert!(lock.is_open());

        // Stop beaconing: closes within one timeout of the last beacon.
        tokio::time::timeout(Duration::from_millis(500), lock.closed())
            .await
            .expect("stream should close once beacons stop");
    }

    #[tokio::test]
    async fn test_zero_timeout_disables_tracking() {
        let (tracker, id, lock) = armed(Duration::ZERO);
        assert!(!tracker.is_armed(&id));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(lock.is_open());
    }

    #[tokio::test]
    async fn test_beacon_for_unknown_or_closed_stream_is_noop() {
        let (tracker, id, lock) = armed(Duration::from_secs(10));
        assert!(!tracker.beacon(&StreamId::new()));

        lock.release(CloseReason::Producer);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(tracker.is_empty());
        assert!(!tracker.beacon(&id));
    }
}
