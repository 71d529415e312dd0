//! Optimistic-concurrency retry loop
//!
//! Writes replace objects carrying the `resourceVersion` they were read at.
//! When another writer got there first the store answers with a conflict;
//! the operation is re-run (re-reading the object) a bounded number of times
//! with a short jittered pause before the conflict is surfaced.
//!
//! ```ignore
//! use oneclick_common::retry::{retry_on_conflict, ConflictRetry};
//!
//! retry_on_conflict(&ConflictRetry::default(), "update Deployment web", || async {
//!     let live = store.get::<Deployment>(&key).await?;
//!     store.replace(&patched(live)).await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Attempt budget for conflicting writes
#[derive(Clone, Debug)]
pub struct ConflictRetry {
    /// Total attempts including the first (minimum 1)
    pub max_attempts: u32,
    /// Base pause between attempts
    pub delay: Duration,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(10),
        }
    }
}

impl ConflictRetry {
    /// Budget with the given attempt count and the default pause
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Run `operation` until it succeeds, fails with something other than a
/// conflict, or the attempt budget is spent.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &ConflictRetry,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e @ Error::Conflict { .. }) => {
                if attempt >= max_attempts {
                    warn!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "Conflict persisted after max attempts"
                    );
                    return Err(e);
                }

                // Jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let pause = Duration::from_secs_f64(config.delay.as_secs_f64() * jitter);

                debug!(
                    operation = %operation_name,
                    attempt,
                    delay_ms = pause.as_millis(),
                    "Write conflicted, retrying"
                );

                tokio::time::sleep(pause).await;
            }
            Err(e) => return Err(e),
        }
    }
}
