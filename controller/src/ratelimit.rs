//! Ratelimit implements the token bucket pacing reconcile work.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// TokenBucket refills at `qps` tokens per second up to `burst`. Acquiring
/// waits until a token is available; waiting does not busy-spin.
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    refilled: Instant,
}

impl TokenBucket {
    /// New builds a bucket starting full.
    pub fn new(qps: f64, burst: u32) -> TokenBucket {
        let burst = f64::from(burst.max(1)).max(1.0);
        TokenBucket {
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                refilled: Instant::now(),
            }),
        }
    }

    /// Acquire takes one token, sleeping until one is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut s = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(s.refilled).as_secs_f64();
                s.tokens = (s.tokens + elapsed * self.qps).min(self.burst);
                s.refilled = now;
                if s.tokens >= 1.0 {
                    s.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - s.tokens) / self.qps)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_then_paced() {
        let b = TokenBucket::new(1000.0, 3);
        let start = Instant::now();
        for _ in 0..3 {
            b.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50), "burst was delayed");

        b.acquire().await;
        // The fourth token had to be minted at ~1ms; mostly checking we did
        // not deadlock.
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn waits_for_refill() {
        let b = TokenBucket::new(50.0, 1);
        b.acquire().await;
        let start = Instant::now();
        b.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
