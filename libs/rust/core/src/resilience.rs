//! Retry with exponential backoff and jitter, used by the participant runtime
//! when it talks to the coordinator.

use rand::{thread_rng, Rng};
use std::fmt::Display;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64, // 0.0 - 1.0
}

impl Default for RetryConfig {
    fn default() -> Self { Self { max_retries: 5, base_delay: Duration::from_millis(200), max_delay: Duration::from_secs(5), jitter: 0.25 } }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based), before jitter.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exp = self.base_delay.mul_f64(2f64.powi(attempt.min(30) as i32));
        exp.min(self.max_delay)
    }

    fn jittered(&self, attempt: usize) -> Duration {
        let delay = self.backoff(attempt);
        if self.jitter <= 0.0 { return delay; }
        let jitter_ms = (delay.as_millis() as f64 * self.jitter.min(1.0)) as i64;
        let offset = thread_rng().gen_range(-jitter_ms..=jitter_ms);
        Duration::from_millis((delay.as_millis() as i64 + offset).max(0) as u64)
    }
}

/// Runs `op` until it succeeds or `max_retries` retries have failed.
/// `op` receives the attempt number. The last error is returned.
pub async fn retry_async<F, Fut, T, E>(what: &str, cfg: &RetryConfig, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= cfg.max_retries => return Err(e),
            Err(e) => {
                let delay = cfg.jittered(attempt);
                warn!(op=%what, attempt, delay_ms=delay.as_millis() as u64, error=%e, "retrying");
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig { max_retries: 3, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(10), jitter: 0.0 }
    }

    #[tokio::test]
    async fn eventual_success() {
        let attempts = AtomicUsize::new(0);
        let res: Result<usize, &str> = retry_async("test", &fast(), |_| {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move { if n < 3 { Err("fail") } else { Ok(42) } }
        })
        .await;
        assert_eq!(res.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let attempts = AtomicUsize::new(0);
        let res: Result<(), String> = retry_async("test", &fast(), |i| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("attempt {i}")) }
        })
        .await;
        assert_eq!(res.unwrap_err(), "attempt 3");
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn backoff_is_capped() {
        let cfg = fast();
        assert_eq!(cfg.backoff(0), Duration::from_millis(1));
        assert_eq!(cfg.backoff(2), Duration::from_millis(4));
        assert_eq!(cfg.backoff(20), Duration::from_millis(10));
    }
}
