use std::time::Duration;

/// Backoff curve applied between retry attempts after a network error.
///
/// The default is exponential: `base * 2^attempt`, clamped to `cap`. A
/// fixed delay is available for callers that want a flat retry cadence.
#[derive(Debug, Clone)]
pub enum RetryBackoff {
    /// `base * factor^attempt`, clamped to `cap`.
    Exponential {
        /// Delay before the first retry.
        base: Duration,
        /// Upper bound on any computed delay.
        cap: Duration,
        /// Growth factor per attempt.
        factor: f64,
    },
    /// The same delay before every retry.
    Fixed {
        /// Flat delay duration.
        delay: Duration,
    },
}

impl RetryBackoff {
    /// Delay before the retry following the given zero-based failed
    /// `attempt`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::Exponential { base, cap, factor } => {
                // Retry counts are tiny; the cast cannot wrap in practice.
                #[allow(clippy::cast_possible_wrap)]
                let raw = base.as_secs_f64() * factor.powi(attempt as i32);
                Duration::from_secs_f64(raw.min(cap.as_secs_f64()))
            }
            Self::Fixed { delay } => *delay,
        }
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}
