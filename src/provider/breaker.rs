//! Per-provider circuit breaker.

use std::time::{Duration, Instant};

/// Rolling-window circuit breaker guarding a single provider.
///
/// Closed until `failure_threshold` failures land inside `timeout_window`,
/// then open until the window elapses. The first probe after that is allowed
/// through (half-open); success closes the breaker, another failure reopens
/// it for a full window.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: usize,
    timeout_window: Duration,
    failures: Vec<Instant>,
    open_until: Option<Instant>,
    half_open: bool,
    last_success: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: usize, timeout_window: Duration) -> Self {
        Self {
            failure_threshold,
            timeout_window,
            failures: Vec::new(),
            open_until: None,
            half_open: false,
            last_success: None,
        }
    }

    /// Whether the next call should be rejected. Transitions to half-open
    /// once the open window has elapsed, allowing a single probe through.
    pub fn is_open(&mut self) -> bool {
        if let Some(until) = self.open_until {
            if Instant::now() < until {
                return true;
            }
            self.open_until = None;
            self.half_open = true;
            tracing::debug!("circuit breaker window elapsed, allowing probe");
        }
        false
    }

    pub fn record_success(&mut self) {
        if self.half_open || self.open_until.is_some() {
            tracing::info!("circuit breaker closed after successful call");
        }
        self.failures.clear();
        self.open_until = None;
        self.half_open = false;
        self.last_success = Some(Instant::now());
    }

    pub fn record_failure(&mut self) {
        let now = Instant::now();

        // A failed probe reopens immediately regardless of the window count.
        if self.half_open {
            self.half_open = false;
            self.failures.push(now);
            self.open_until = Some(now + self.timeout_window);
            tracing::warn!("circuit breaker reopened after failed probe");
            return;
        }

        self.failures.push(now);
        self.failures
            .retain(|f| now.duration_since(*f) <= self.timeout_window);

        if self.failures.len() >= self.failure_threshold {
            self.open_until = Some(now + self.timeout_window);
            tracing::warn!(
                failures = self.failures.len(),
                window_secs = self.timeout_window.as_secs(),
                "circuit breaker opened"
            );
        }
    }

    /// Non-transitioning open check, for status reporting.
    pub fn currently_open(&self) -> bool {
        self.open_until.is_some_and(|until| Instant::now() < until)
    }

    pub fn state_name(&self) -> &'static str {
        if self.currently_open() {
            "open"
        } else if self.half_open {
            "half_open"
        } else {
            "closed"
        }
    }

    pub fn recent_failures(&self) -> usize {
        self.failures.len()
    }

    pub fn open_remaining(&self) -> Option<Duration> {
        self.open_until
            .and_then(|until| until.checked_duration_since(Instant::now()))
    }

    pub fn last_success_age(&self) -> Option<Duration> {
        self.last_success.map(|at| at.elapsed())
    }
}
