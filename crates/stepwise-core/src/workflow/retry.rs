//! Retry delay calculation.

use stepwise_types::step::{Backoff, InvalidDuration, RetryConfig};

// ---------------------------------------------------------------------------
// calc_retry_duration
// ---------------------------------------------------------------------------

/// Milliseconds to wait before the attempt following `attempted_count`.
///
/// - **Constant**: `delay`
/// - **Linear**: `delay * attempted_count`
/// - **Exponential**: `delay * 2^(attempted_count - 1)`
///
/// `attempted_count` is 1-based; saturates instead of overflowing.
pub fn calc_retry_duration(retries: &RetryConfig, attempted_count: u32) -> Result<u64, InvalidDuration> {
    let delay = retries.delay.to_millis()?;
    let attempts = attempted_count.max(1);

    let duration = match retries.backoff {
        Backoff::Constant => delay,
        Backoff::Linear => delay.saturating_mul(u64::from(attempts)),
        Backoff::Exponential => {
            let factor = 1u64.checked_shl(attempts - 1).unwrap_or(u64::MAX);
            delay.saturating_mul(factor)
        }
    };
    Ok(duration)
}
