//! Exponenciální backoff pro feed i doručování notifikací.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Celkový počet pokusů včetně prvního
    pub attempts:   u32,
    pub base_delay: Duration,
    pub max_delay:  Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts:   3,
            base_delay: Duration::from_millis(500),
            max_delay:  Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self { attempts: attempts.max(1), base_delay, ..Self::default() }
    }

    /// Pauza před `retry`-tým opakováním (1 = první retry): base, 2×base, 4×base… max `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Spouští `op`, dokud neuspěje, chyba není retryable nebo nedojdou pokusy.
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        op: F,
        is_retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.run_hinted(label, op, is_retryable, |_| None).await
    }

    /// Jako `run`, ale chyba si může říct o delší pauzu (např. 429 + `retry_after`).
    /// Čeká se max(backoff, hint), hint se neořezává na `max_delay`.
    pub async fn run_hinted<T, E, F, Fut>(
        &self,
        label: &str,
        mut op: F,
        is_retryable: impl Fn(&E) -> bool,
        min_delay: impl Fn(&E) -> Option<Duration>,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.attempts && is_retryable(&e) => {
                    let backoff = self.delay_for(attempt);
                    let delay = min_delay(&e).map_or(backoff, |hint| hint.max(backoff));
                    debug!("{label}: attempt {attempt}/{} failed ({e}), retry in {}ms",
                        self.attempts, delay.as_millis());
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
