// =============================================================================
// Retry backoff — exponential with full jitter, per spec.md §4.6
// =============================================================================

use rand::Rng;

/// `base * 2^(attempt-1)` capped at `max_backoff`, then scaled by a uniform
/// random factor in `[0, 1)` ("full jitter"), so many simultaneously-failing
/// tasks don't all retry in lockstep.
pub fn backoff(attempt: u32, base_secs: u64, max_backoff_secs: u64) -> chrono::Duration {
    let exp = attempt.saturating_sub(1).min(32);
    let capped = (base_secs as f64 * 2f64.powi(exp as i32)).min(max_backoff_secs as f64);
    let jittered = rand::rng().random_range(0.0..=capped.max(0.0));
    chrono::Duration::milliseconds((jittered * 1000.0) as i64)
}
