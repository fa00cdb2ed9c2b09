//! Cancellation and poll-until-condition primitives
//!
//! UI settling is asynchronous and its duration depends on the hardware, so
//! nothing here sleeps for a fixed time without also watching the cancel flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{FleetError, Result};

/// Longest uninterrupted sleep while waiting
const CANCEL_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    parent: Option<CancelToken>,
}

/// Shared cancellation flag. A child token is cancelled when it or any of its
/// ancestors is.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that is cancelled with `self` but can also be cancelled alone
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
            || self.inner.parent.as_ref().map_or(false, |p| p.is_cancelled())
    }

    /// `Err(Cancelled)` once cancelled
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(FleetError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Sleep for `duration`, waking early with `Err(Cancelled)` if `cancel` is raised
pub fn pause(duration: Duration, cancel: &CancelToken) -> Result<()> {
    let deadline = deadline_after(duration);
    loop {
        cancel.check()?;
        let remaining = match deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => CANCEL_SLICE,
        };
        if remaining.is_zero() {
            return Ok(());
        }
        thread::sleep(remaining.min(CANCEL_SLICE));
    }
}

/// `None` when the deadline is too far out to represent, i.e. never
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// Exponential backoff between probes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, factor: f32) -> Self {
        Self {
            initial,
            max: max.max(initial),
            factor: if factor.is_finite() { factor.max(1.0) } else { 1.0 },
        }
    }

    fn next(&self, current: Duration) -> Duration {
        // Overflowing or non-finite products saturate at the cap
        Duration::try_from_secs_f64(current.as_secs_f64() * f64::from(self.factor))
            .map_or(self.max, |d| d.min(self.max))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_millis(1000), 1.5)
    }
}

/// Run `probe` until it yields a value or `timeout` elapses.
///
/// The probe always runs at least once, so a zero timeout is a single check.
/// Returns `Ok(None)` on timeout; probe errors and cancellation end the wait
/// immediately.
pub fn poll_until<T>(
    timeout: Duration,
    backoff: &Backoff,
    cancel: &CancelToken,
    mut probe: impl FnMut() -> Result<Option<T>>,
) -> Result<Option<T>> {
    let deadline = deadline_after(timeout);
    let mut delay = backoff.initial;
    loop {
        cancel.check()?;
        if let Some(value) = probe()? {
            return Ok(Some(value));
        }
        let wait = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(None);
                }
                delay.min(remaining)
            }
            None => delay,
        };
        pause(wait, cancel)?;
        delay = backoff.next(delay);
    }
}
