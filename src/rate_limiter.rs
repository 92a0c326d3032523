//! Upstream call throttling. Every adapter RPC flows through one
//! [`UpstreamLimiter`]: a governor token bucket for request rate plus a
//! semaphore bounding in-flight calls, so a burst of subscribers can never
//! stampede a public endpoint.

use crate::config::RateLimiterSettings;
use crate::errors::AdapterError;
use futures::Future;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, trace};

const LIMITER_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct UpstreamLimiter {
    chain: String,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
    concurrency: Arc<Semaphore>,
}

impl UpstreamLimiter {
    pub fn new(chain: &str, settings: &RateLimiterSettings) -> Self {
        let rps = NonZeroU32::new(settings.rps_limit.max(1)).expect("non-zero rps");
        let quota = Quota::per_second(rps).allow_burst(rps);
        Self {
            chain: chain.to_string(),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            concurrency: Arc::new(Semaphore::new(settings.max_concurrent_requests.max(1) as usize)),
        }
    }

    /// Runs `call` once the rate and concurrency budgets allow it.
    pub async fn execute<F, Fut, T>(&self, method: &str, call: F) -> Result<T, AdapterError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        let wait_start = Instant::now();
        timeout(LIMITER_WAIT_TIMEOUT, self.rate_limiter.until_ready())
            .await
            .map_err(|_| AdapterError::RateLimited(format!("{}: limiter wait timed out", method)))?;

        let _permit = self
            .concurrency
            .acquire()
            .await
            .map_err(|_| AdapterError::RateLimited("concurrency limiter closed".to_string()))?;

        let waited = wait_start.elapsed();
        if waited > Duration::from_secs(1) {
            debug!(target: "rate_limiter", chain = %self.chain, method, wait_ms = waited.as_millis() as u64, "long rate limit wait");
        } else {
            trace!(target: "rate_limiter", chain = %self.chain, method, "rate limit check passed");
        }

        call().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passes_result_through() {
        let limiter = UpstreamLimiter::new(
            "test",
            &RateLimiterSettings {
                rps_limit: 100,
                max_concurrent_requests: 2,
            },
        );
        let out = limiter.execute("m", || async { Ok::<_, AdapterError>(41 + 1) }).await;
        assert_eq!(out.unwrap(), 42);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let limiter = Arc::new(UpstreamLimiter::new(
            "test",
            &RateLimiterSettings {
                rps_limit: 1_000,
                max_concurrent_requests: 1,
            },
        ));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = limiter.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .execute("m", || async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, AdapterError>(())
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
