//! Time-window accounting for the rate limiter.
//!
//! Every window sees time as milliseconds elapsed since the limiter started. Only admitted
//! calls consume capacity; a rejection leaves the window untouched.

use super::Decision;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// Admission bookkeeping for one rate limiter.
pub trait TimeWindow: Send + fmt::Debug {
    /// Decide on one call arriving at `now` (ms since start), recording it when admitted.
    fn record(&mut self, now: u64) -> Decision;
}

fn remaining(limit: u32, used: usize) -> u32 {
    limit.saturating_sub(u32::try_from(used).unwrap_or(u32::MAX))
}

/// Rejects a call that arrives less than `spacing` after the previous admission.
#[derive(Debug, Clone, Copy)]
struct Spacing {
    spacing: u64,
    last: Option<u64>,
}

impl Spacing {
    fn new(spacing: u64) -> Self {
        Self { spacing, last: None }
    }

    fn wait(&self, now: u64) -> Option<u64> {
        match self.last {
            Some(last) if self.spacing > 0 && now.saturating_sub(last) < self.spacing => {
                Some(self.spacing - now.saturating_sub(last))
            }
            _ => None,
        }
    }
}

/// `limit` permits that all come back at once every `window`.
#[derive(Debug)]
pub struct FixedWindow {
    limit: u32,
    window: u64,
    permits: u32,
    next_refresh: u64,
    spacing: Spacing,
}

impl FixedWindow {
    pub fn new(limit: u32, window: u64, min_spacing: u64) -> Self {
        Self { limit, window, permits: limit, next_refresh: window, spacing: Spacing::new(min_spacing) }
    }
}

impl TimeWindow for FixedWindow {
    fn record(&mut self, now: u64) -> Decision {
        if now >= self.next_refresh {
            self.permits = self.limit;
            // skip every window that passed without a call
            let passed = (now - self.next_refresh) / self.window;
            self.next_refresh += self.window * (1 + passed);
        }
        if self.permits == 0 {
            return Decision::Denied { wait: Duration::from_millis(self.next_refresh - now) };
        }
        if let Some(wait) = self.spacing.wait(now) {
            return Decision::Denied { wait: Duration::from_millis(wait) };
        }
        self.permits -= 1;
        self.spacing.last = Some(now);
        Decision::Allowed { remaining: self.permits }
    }
}

/// At most `limit` admissions within any `window`-long interval.
#[derive(Debug)]
pub struct RollingWindow {
    limit: u32,
    window: u64,
    admitted: VecDeque<u64>,
    spacing: Spacing,
}

impl RollingWindow {
    pub fn new(limit: u32, window: u64, min_spacing: u64) -> Self {
        let capacity = usize::try_from(limit).unwrap_or(usize::MAX).min(4096);
        Self { limit, window, admitted: VecDeque::with_capacity(capacity), spacing: Spacing::new(min_spacing) }
    }
}

impl TimeWindow for RollingWindow {
    fn record(&mut self, now: u64) -> Decision {
        while let Some(&oldest) = self.admitted.front() {
            if oldest.saturating_add(self.window) <= now {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
        if remaining(self.limit, self.admitted.len()) == 0 {
            let oldest = self.admitted.front().copied().unwrap_or(now);
            let wait = oldest.saturating_add(self.window).saturating_sub(now);
            return Decision::Denied { wait: Duration::from_millis(wait) };
        }
        if let Some(wait) = self.spacing.wait(now) {
            return Decision::Denied { wait: Duration::from_millis(wait) };
        }
        self.admitted.push_back(now);
        self.spacing.last = Some(now);
        Decision::Allowed { remaining: remaining(self.limit, self.admitted.len()) }
    }
}

/// Permits accrue continuously at `limit / window`; the bucket starts with one permit and
/// holds at most `limit`.
#[derive(Debug)]
pub struct SmoothWindow {
    limit: f64,
    per_milli: f64,
    permits: f64,
    last_refresh: u64,
    spacing: Spacing,
}

impl SmoothWindow {
    pub fn new(limit: u32, window: u64, min_spacing: u64) -> Self {
        let limit = f64::from(limit);
        Self {
            limit,
            per_milli: limit / window.max(1) as f64,
            permits: 1.0,
            last_refresh: 0,
            spacing: Spacing::new(min_spacing),
        }
    }
}

impl TimeWindow for SmoothWindow {
    fn record(&mut self, now: u64) -> Decision {
        let accrued = now.saturating_sub(self.last_refresh) as f64 * self.per_milli;
        if accrued > 0.01 {
            self.permits = (self.permits + accrued).min(self.limit);
            self.last_refresh = now;
        }
        if self.permits < 1.0 {
            let wait = ((1.0 - self.permits) / self.per_milli).ceil().max(1.0);
            return Decision::Denied { wait: Duration::from_millis(wait as u64) };
        }
        if let Some(wait) = self.spacing.wait(now) {
            return Decision::Denied { wait: Duration::from_millis(wait) };
        }
        self.permits -= 1.0;
        self.spacing.last = Some(now);
        Decision::Allowed { remaining: self.permits.floor() as u32 }
    }
}
