//! Rate-limited line channel.
//!
//! Wraps a receiver of client lines with a token bucket. The bucket starts
//! absent (unlimited) because IRC clients legitimately burst during
//! registration; when the upstream confirms registration with 001 the session
//! installs the configured rate with a burst of 1. Lines are never dropped
//! across the switch, only delayed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const QUEUE_CAPACITY: usize = 50;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last: Instant,
    rate: f64,
    burst: f64,
}

/// Handle for installing or replacing the limiter on a running channel.
#[derive(Clone, Default)]
pub struct ThrottleHandle {
    bucket: Arc<Mutex<Option<TokenBucket>>>,
}

impl ThrottleHandle {
    /// Install a limiter of `rate` lines per second with a burst of 1.
    /// A rate of zero leaves the channel unlimited.
    pub fn set_rate(&self, rate: u32) {
        let mut bucket = self.bucket.lock();
        if rate == 0 {
            *bucket = None;
            return;
        }
        *bucket = Some(TokenBucket {
            tokens: 1.0,
            last: Instant::now(),
            rate: f64::from(rate),
            burst: 1.0,
        });
    }

    async fn wait(&self) {
        loop {
            let delay = {
                let mut guard = self.bucket.lock();
                let Some(bucket) = guard.as_mut() else { return };
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * bucket.rate).min(bucket.burst);
                bucket.last = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / bucket.rate)
            };
            tokio::time::sleep(delay).await;
        }
    }
}

/// Join `input` to a new output channel through a worker that waits for a
/// token before forwarding. Closing the input closes the output.
pub fn throttled(mut input: mpsc::Receiver<String>) -> (mpsc::Receiver<String>, ThrottleHandle) {
    let (out_tx, out_rx) = mpsc::channel(QUEUE_CAPACITY);
    let handle = ThrottleHandle::default();

    let worker_handle = handle.clone();
    tokio::spawn(async move {
        while let Some(line) = input.recv().await {
            worker_handle.wait().await;
            if out_tx.send(line).await.is_err() {
                break;
            }
        }
    });

    (out_rx, handle)
}
