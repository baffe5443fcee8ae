use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Exponential backoff for transient infrastructure failures.
///
/// Delays start at `factor` and double per attempt, capped at `max_delay`. Once `window`
/// has elapsed since the first failure `next_delay` yields `None` and the caller should
/// give up.
#[derive(Debug, Clone)]
pub struct Backoff {
    factor: Duration,
    max_delay: Duration,
    window: Duration,
    attempt: u32,
    started: Option<Instant>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(4), Duration::from_secs(120), Duration::from_secs(10 * 60))
    }
}

impl Backoff {
    pub fn new(factor: Duration, max_delay: Duration, window: Duration) -> Self {
        Self {
            factor,
            max_delay,
            window,
            attempt: 0,
            started: None,
        }
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        let started = *self.started.get_or_insert_with(Instant::now);
        if started.elapsed() >= self.window {
            return None;
        }
        let delay = self
            .factor
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.max_delay);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Forget previous failures after a successful unit of work
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.started = None;
    }
}

/// Retry an async operation with exponential backoff.
pub async fn retry_async<F, Fut, T, E>(mut op: F, attempts: usize, initial_delay: Duration) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay = initial_delay;
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(_) if attempt < attempts => {
                sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
