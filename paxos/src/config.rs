//! Retry configuration

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Configuration for exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial backoff duration
    pub initial: Duration,
    /// Maximum backoff duration
    pub max: Duration,
    /// Multiplier for each retry (typically 2.0)
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Calculate backoff duration for a given retry count with jitter
    #[must_use]
    pub fn duration(&self, retries: u32, rng: &mut impl Rng) -> Duration {
        let exp = i32::try_from(retries).unwrap_or(i32::MAX);
        let base = self.initial.as_secs_f64() * self.multiplier.powi(exp);
        let capped = base.min(self.max.as_secs_f64());
        // 50% to 150% of the capped duration
        let jitter_factor = rng.random_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter_factor)
    }

    /// Sleep for the `retries`th backoff, or until `cancel` fires.
    ///
    /// Returns `false` if cancelled.
    pub async fn sleep(&self, retries: u32, cancel: &CancellationToken) -> bool {
        let delay = self.duration(retries, &mut rand::rng());
        tokio::select! {
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    /// Run `op` until it succeeds, backing off between failures.
    ///
    /// Returns `None` only if `cancel` fires first. Failures are logged at
    /// debug level as `what`.
    pub(crate) async fn retry<T, E, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Option<T>
    where
        E: std::fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut retries = 0;
        loop {
            let res = tokio::select! {
                () = cancel.cancelled() => return None,
                res = op() => res,
            };
            match res {
                Ok(value) => return Some(value),
                Err(error) => {
                    tracing::debug!(what, retries, ?error, "retrying");
                }
            }
            if !self.sleep(retries, cancel).await {
                return None;
            }
            retries = retries.saturating_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tokio_util::sync::CancellationToken;

    use super::BackoffConfig;

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = BackoffConfig::default();
        let mut rng = StdRng::seed_from_u64(7);

        let first = backoff.duration(0, &mut rng);
        assert!(first >= Duration::from_millis(5));
        assert!(first <= Duration::from_millis(15));

        let third = backoff.duration(2, &mut rng);
        assert!(third >= Duration::from_millis(20));
        assert!(third <= Duration::from_millis(60));

        let late = backoff.duration(u32::MAX, &mut rng);
        assert!(late <= Duration::from_millis(1500));
        assert!(late >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_until_success() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let value = BackoffConfig::default()
            .retry("test", &cancel, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err("not yet")
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(value, Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                BackoffConfig::default()
                    .retry("test", &cancel, || async { Err::<(), _>("never") })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        assert_eq!(task.await.unwrap(), None);
    }
}
