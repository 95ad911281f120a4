//! Bounded retries of isolation requests.

use mutex_api::Mutex;
use page_isolation_params::ISOLATE_RETRIES;

use crate::{
    error::IsolationError,
    isolate::IsolationRange,
    zone::{Zone, ZoneState},
};

/// How often [`isolate_with_retry`] tries a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero behaves like one.
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: ISOLATE_RETRIES,
        }
    }
}

/// Isolates `range`, retrying while the failure is one that may clear up
/// ([`IsolationError::is_retryable`]).
///
/// `wait` runs between attempts with the number of the attempt that just
/// failed; callers use it to migrate pages, drain caches or back off. The
/// last error is returned once the attempts are used up.
pub fn isolate_with_retry<M, F>(
    zone: &Zone<M>,
    range: &IsolationRange,
    policy: RetryPolicy,
    mut wait: F,
) -> Result<(), IsolationError>
where
    M: Mutex<Data = ZoneState>,
    F: FnMut(u32),
{
    let mut attempt = 1;
    loop {
        match zone.isolate_range(range) {
            Err(err) if err.is_retryable() && attempt < policy.attempts => {
                log::trace!("isolation attempt {attempt} failed: {err}");
                wait(attempt);
                attempt += 1;
            }
            result => return result,
        }
    }
}
