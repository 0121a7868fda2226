use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ProviderError;

const INITIAL_DELAY: Duration = Duration::from_millis(500);
const MULTIPLIER: f64 = 2.0;
const MAX_DELAY: Duration = Duration::from_secs(10);
const MAX_RETRIES: u32 = 3;

/// Retries `op` on transport errors and 5xx/429 responses with exponential
/// backoff (initial 500ms, multiplier 2.0, cap 10s, max 3 retries). 4xx
/// responses other than 429 are non-retryable. Honors `cancellation`: a
/// cancelled token aborts the wait and returns the last error immediately.
pub async fn retry_with_backoff<F, Fut, T>(
    mut op: F,
    cancellation: &CancellationToken,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut delay = INITIAL_DELAY;
    let mut attempt = 0u32;

    loop {
        if cancellation.is_cancelled() {
            return Err(ProviderError::RequestFailed("cancelled".to_string()));
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < MAX_RETRIES => {
                attempt += 1;
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying provider call");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancellation.cancelled() => {
                        return Err(ProviderError::RequestFailed("cancelled".to_string()));
                    }
                }
                delay = std::cmp::min(delay.mul_f64(MULTIPLIER), MAX_DELAY);
            }
            Err(err) => return Err(err),
        }
    }
}
