use log::*;
use reqwest::Method;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Query parameter and response header naming the stream being kept alive.
pub const SSE_ID: &str = "x-sse-id";

/// Appends the beacon parameter to `resource`, keeping any existing query.
pub fn beacon_url(resource: &str, stream_id: &str) -> String {
    let separator = if resource.contains('?') { '&' } else { '?' };
    format!(
        "{}{}{}={}",
        resource,
        separator,
        SSE_ID,
        urlencoding::encode(stream_id)
    )
}

/// Periodically tells the server a stream's consumer is still alive.
///
/// Runs on its own task; failures are logged and the next tick tries again.
/// Dropping the sender stops it.
#[derive(Debug)]
pub struct BeaconSender {
    handle: JoinHandle<()>,
}

impl BeaconSender {
    /// Starts beaconing every `interval`. A zero interval disables beacons.
    pub fn start(
        http: reqwest::Client,
        method: Method,
        resource: &str,
        stream_id: &str,
        interval: Duration,
    ) -> Option<Self> {
        if interval.is_zero() {
            debug!("Beacon disabled for stream {}", stream_id);
            return None;
        }

        let url = beacon_url(resource, stream_id);
        let stream_id = stream_id.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let request = http.request(method.clone(), &url).send();
                match tokio::time::timeout(interval, request).await {
                    Ok(Ok(response)) if response.status().is_success() => {
                        trace!("Beacon sent for stream {}", stream_id);
                    }
                    Ok(Ok(response)) => {
                        debug!(
                            "Beacon for stream {} answered {}",
                            stream_id,
                            response.status()
                        );
                    }
                    Ok(Err(e)) => debug!("Beacon for stream {} failed: {}", stream_id, e),
                    Err(_) => debug!("Beacon for stream {} timed out", stream_id),
                }
            }
        });

        Some(Self { handle })
    }

    /// Stops beaconing. The task is aborted when `self` drops.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for BeaconSender {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beacon_url_appends_query() {
        assert_eq!(beacon_url("http://h/events", "abc"), "http://h/events?x-sse-id=abc");
        assert_eq!(
            beacon_url("http://h/events?lang=en", "a b"),
            "http://h/events?lang=en&x-sse-id=a%20b"
        );
    }

    #[tokio::test]
    async fn test_zero_interval_disables_beacon() {
        let sender = BeaconSender::start(
            reqwest::Client::new(),
            Method::POST,
            "http://127.0.0.1:9/events",
            "abc",
            Duration::ZERO,
        );
        assert!(sender.is_none());
    }
}
