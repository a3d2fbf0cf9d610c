//! Deadline races
//!
//! Every blocking call on a process handle is a race between the operation
//! and a timer. Whichever finishes first decides the outcome; the loser is
//! dropped on the spot, so a late completion has nowhere to deliver to and a
//! late timer never fires.

use std::future::Future;
use std::time::Duration;
use tether_util::as_millis;
use tokio::time::Instant;
use tracing::debug;

use crate::TimeoutError;

/// Pick the deadline for a call.
///
/// `None` and a zero duration both mean "use the handle's default". Neither
/// disables the deadline and neither times out immediately.
pub fn resolve_timeout(requested: Option<Duration>, default: Duration) -> Duration {
    match requested {
        Some(timeout) if !timeout.is_zero() => timeout,
        _ => default,
    }
}

/// Race `operation` against `deadline`.
///
/// Resolves with the operation's output if it completes first, or with a
/// [`TimeoutError`] carrying `label` once the deadline elapses.
pub async fn race<F>(label: &'static str, deadline: Duration, operation: F) -> Result<F::Output, TimeoutError>
where
    F: Future,
{
    let started = Instant::now();
    match tokio::time::timeout(deadline, operation).await {
        Ok(output) => Ok(output),
        Err(_) => {
            let elapsed = started.elapsed();
            debug!(label, deadline_ms = as_millis(deadline), "Deadline elapsed");
            Err(TimeoutError {
                label,
                deadline,
                elapsed,
            })
        }
    }
}
