//! Bounded wait for the captioning worker.
//!
//! The worker writes its caption some time after the object lands in the
//! bucket. [`wait_for_caption`] looks the key up on a fixed interval until a
//! caption appears, the deadline passes, the lookup fails, or the wait is
//! cancelled. Nothing blocks a runtime thread while waiting.

use crate::caption_store::CaptionStore;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// What to do when a lookup fails mid-wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollErrorPolicy {
    /// Give up on the first failed lookup
    Abort,
    /// Treat a failed lookup like a miss and keep polling
    Retry,
}

/// Timing of the caption wait
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
    pub on_error: PollErrorPolicy,
}

impl PollPolicy {
    /// Upper bound on lookups: one per interval inside the timeout
    pub fn max_attempts(&self) -> u32 {
        let interval = self.interval.as_millis().max(1);
        u32::try_from(self.timeout.as_millis().div_ceil(interval)).unwrap_or(u32::MAX)
    }
}

/// How a caption wait ended
#[derive(Debug, Clone, PartialEq)]
pub enum CaptionOutcome {
    /// The worker produced a caption
    Ready(String),
    /// No caption before the deadline
    TimedOut,
    /// A lookup failed and the policy said to stop
    Failed(String),
    /// The wait was cancelled (shutdown)
    Cancelled,
}

impl CaptionOutcome {
    /// Label used in responses and metrics
    pub fn status(&self) -> &'static str {
        match self {
            CaptionOutcome::Ready(_) => "ready",
            CaptionOutcome::TimedOut | CaptionOutcome::Cancelled => "pending",
            CaptionOutcome::Failed(_) => "unavailable",
        }
    }
}

/// Result of [`wait_for_caption`]
#[derive(Debug, Clone)]
pub struct CaptionWait {
    pub outcome: CaptionOutcome,
    /// Number of lookups issued
    pub attempts: u32,
    pub elapsed: Duration,
}

impl CaptionWait {
    /// Caption text, or `placeholder` when none is available
    pub fn caption_or<'a>(&'a self, placeholder: &'a str) -> &'a str {
        match &self.outcome {
            CaptionOutcome::Ready(caption) => caption,
            _ => placeholder,
        }
    }
}

/// Poll `store` for the caption of `image_key`
///
/// Lookups start immediately and repeat every `policy.interval`. A lookup is
/// never started at or after the deadline, and one still in flight when the
/// deadline passes is abandoned.
#[instrument(skip(store, policy, cancel), fields(max_attempts = policy.max_attempts()))]
pub async fn wait_for_caption(
    store: &dyn CaptionStore,
    image_key: &str,
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> CaptionWait {
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut ticker = tokio::time::interval(policy.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut attempts = 0;

    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => break CaptionOutcome::Cancelled,
            _ = ticker.tick() => {}
        }

        if Instant::now() >= deadline {
            break CaptionOutcome::TimedOut;
        }

        attempts += 1;
        let lookup = tokio::select! {
            _ = cancel.cancelled() => break CaptionOutcome::Cancelled,
            lookup = tokio::time::timeout_at(deadline, store.get_caption(image_key)) => lookup,
        };

        match lookup {
            Err(_) => break CaptionOutcome::TimedOut,
            Ok(Ok(Some(caption))) => break CaptionOutcome::Ready(caption),
            Ok(Ok(None)) => debug!(attempts, "Caption not ready yet"),
            Ok(Err(e)) => match policy.on_error {
                PollErrorPolicy::Abort => {
                    warn!(error = %e, attempts, "Caption lookup failed, giving up");
                    break CaptionOutcome::Failed(e.to_string());
                }
                PollErrorPolicy::Retry => {
                    warn!(error = %e, attempts, "Caption lookup failed, retrying");
                }
            },
        }
    };

    let elapsed = started.elapsed();
    debug!(
        status = outcome.status(),
        attempts,
        elapsed_ms = elapsed.as_millis() as u64,
        "Caption wait finished"
    );

    CaptionWait {
        outcome,
        attempts,
        elapsed,
    }
}
