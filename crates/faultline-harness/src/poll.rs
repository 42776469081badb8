//! Bounded polling shared by every wait in the harness.
//!
//! Device state, rebuild, verify and quiescence waits all reduce to "probe
//! until satisfied, sleep, give up at a ceiling". A ceiling hit is a
//! [`HarnessError::Timeout`] carrying the last value the probe saw; callers
//! never treat it as a retry signal.

use std::fmt::Debug;
use std::thread;
use std::time::{Duration, Instant};

use faultline_error::{HarnessError, Result};
use tracing::{debug, warn};

/// Interval and ceiling for one kind of wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub ceiling: Duration,
}

impl PollPolicy {
    #[must_use]
    pub const fn new(interval: Duration, ceiling: Duration) -> Self {
        Self { interval, ceiling }
    }
}

/// What one probe call observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStep<T, O> {
    Done(T),
    /// Not there yet; the observation is kept for the timeout diagnostic.
    Pending(O),
}

/// Probe until it reports [`PollStep::Done`] or `policy.ceiling` elapses.
///
/// The probe always runs at least once, even with a zero ceiling. Probe
/// errors propagate immediately.
pub fn poll_until<T, O, F>(what: &str, policy: PollPolicy, mut probe: F) -> Result<T>
where
    O: Debug,
    F: FnMut() -> Result<PollStep<T, O>>,
{
    let started = Instant::now();
    let mut attempts: u64 = 0;
    loop {
        attempts += 1;
        let observed = match probe()? {
            PollStep::Done(value) => {
                debug!(
                    what,
                    attempts,
                    elapsed_ms = started.elapsed().as_millis(),
                    "wait satisfied"
                );
                return Ok(value);
            }
            PollStep::Pending(observed) => observed,
        };

        let elapsed = started.elapsed();
        if elapsed >= policy.ceiling {
            warn!(what, attempts, ?observed, "wait exceeded ceiling");
            return Err(HarnessError::timeout(
                what,
                elapsed,
                format!("{observed:?}"),
            ));
        }
        thread::sleep(policy.interval.min(policy.ceiling - elapsed));
    }
}
