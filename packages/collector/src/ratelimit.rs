//! Adaptive rate limiting for outbound protocol calls.
//!
//! A governor token bucket enforces the steady budget. On top of it sits a
//! cooldown deadline installed whenever the server answers with a backoff
//! signal: until the deadline passes no call is let through, whatever the
//! bucket says.

use governor::{Quota, RateLimiter as GovernorLimiter};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RateLimitSettings;
use crate::error::{CollectorError, Result};

type DefaultRateLimiter = GovernorLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Token bucket with an overriding cooldown window.
pub struct RateLimiter {
    limiter: DefaultRateLimiter,
    cooldown_until: Mutex<Option<Instant>>,
}

impl Default for RateLimiter {
    /// Two requests per second, burst of one.
    fn default() -> Self {
        Self::with_quota(Quota::per_second(nonzero!(2u32)).allow_burst(nonzero!(1u32)))
    }
}

impl RateLimiter {
    /// Create a limiter for `requests_per_second` with the given burst.
    pub fn new(requests_per_second: f64, burst: u32) -> Result<Self> {
        let invalid = || {
            CollectorError::Config(format!(
                "invalid rate limit: {requests_per_second} rps, burst {burst}"
            ))
        };
        if requests_per_second.is_nan() || requests_per_second <= 0.0 {
            return Err(invalid());
        }
        let period =
            Duration::try_from_secs_f64(1.0 / requests_per_second).map_err(|_| invalid())?;
        let quota = Quota::with_period(period)
            .ok_or_else(invalid)?
            .allow_burst(NonZeroU32::new(burst).ok_or_else(invalid)?);
        Ok(Self::with_quota(quota))
    }

    pub fn from_settings(settings: &RateLimitSettings) -> Result<Self> {
        Self::new(settings.requests_per_second, settings.burst)
    }

    /// Create with a custom quota.
    pub fn with_quota(quota: Quota) -> Self {
        Self {
            limiter: GovernorLimiter::direct(quota),
            cooldown_until: Mutex::new(None),
        }
    }

    /// Wait until a call may proceed.
    ///
    /// Sleeps out any active cooldown, then takes a token. Fails only with
    /// [`CollectorError::Cancelled`]. Wrap in `tokio::time::timeout` for a
    /// deadline.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        // The deadline can move while we sleep.
        while let Some(deadline) = self.active_cooldown() {
            debug!(
                wait_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
                "Waiting out rate-limit cooldown"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CollectorError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CollectorError::Cancelled),
            _ = self.limiter.until_ready() => Ok(()),
        }
    }

    /// Block all calls for `seconds` from now.
    pub fn set_cooldown(&self, seconds: u64) {
        self.set_cooldown_for(Duration::from_secs(seconds));
    }

    /// Block all calls for `duration` from now.
    ///
    /// An already active cooldown that ends later is kept.
    pub fn set_cooldown_for(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut guard = self
            .cooldown_until
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match *guard {
            Some(current) if current >= deadline => {}
            _ => {
                *guard = Some(deadline);
                info!(wait_seconds = duration.as_secs(), "Rate-limit cooldown set");
            }
        }
    }

    /// Time left on the active cooldown.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        self.active_cooldown()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn active_cooldown(&self) -> Option<Instant> {
        let guard = self
            .cooldown_until
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        (*guard).filter(|deadline| *deadline > Instant::now())
    }
}
