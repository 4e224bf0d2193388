//! Per-subject admission control with a sliding window and escalation to a
//! temporary hard block for abusive bursts.

use crate::config::Tunables;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Who a request is counted against. Authenticated users never share a
/// counter with the anonymous session they logged in from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubjectKey {
    User(String),
    Session(String),
    Peer(String),
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Session(id) => write!(f, "session:{id}"),
            Self::Peer(addr) => write!(f, "peer:{addr}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// When a rejected subject may try again
    pub retry_after: Option<Duration>,
    /// Rejected because of an escalated hard block
    pub blocked: bool,
}

#[derive(Debug)]
struct Window {
    hits: VecDeque<Instant>,
    blocked_until: Option<Instant>,
    last_seen: Instant,
}

impl Window {
    fn new(now: Instant) -> Self {
        Self {
            hits: VecDeque::new(),
            blocked_until: None,
            last_seen: now,
        }
    }

    fn evict_older_than(&mut self, window: Duration, now: Instant) {
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct RateLimiter {
    windows: DashMap<SubjectKey, Window>,
    tunables: watch::Receiver<Tunables>,
}

impl RateLimiter {
    pub fn new(tunables: watch::Receiver<Tunables>) -> Self {
        Self {
            windows: DashMap::new(),
            tunables,
        }
    }

    /// Check `subject` against the currently configured limits.
    pub fn admit(&self, subject: &SubjectKey) -> RateLimitDecision {
        let limits = self.tunables.borrow().rate_limit.clone();
        self.check(subject, limits.max_requests, limits.window())
    }

    /// Count one request for `subject` and decide whether it is admitted.
    ///
    /// Rejected requests still count, so a subject exceeding the escalation
    /// threshold within `window` is blocked until its current window drains
    /// and for one further window after that.
    pub fn check(
        &self,
        subject: &SubjectKey,
        max_requests: u32,
        window: Duration,
    ) -> RateLimitDecision {
        let escalation_factor = self.tunables.borrow().rate_limit.escalation_factor;
        let now = Instant::now();

        let mut entry = self
            .windows
            .entry(subject.clone())
            .or_insert_with(|| Window::new(now));
        let state = entry.value_mut();
        state.last_seen = now;

        if let Some(until) = state.blocked_until {
            if now < until {
                metrics::counter!("rate_limiter.rejected", "reason" => "blocked").increment(1);
                return RateLimitDecision {
                    allowed: false,
                    remaining: 0,
                    retry_after: Some(until - now),
                    blocked: true,
                };
            }
            state.blocked_until = None;
        }

        state.evict_older_than(window, now);
        state.hits.push_back(now);
        let count = state.hits.len();
        let oldest = state.hits.front().copied().unwrap_or(now);

        if count as f64 > f64::from(max_requests) * escalation_factor {
            let until = oldest + window * 2;
            state.blocked_until = Some(until);
            state.hits.clear();
            warn!(subject = %subject, count, max_requests, "Rate limit escalated to a temporary block");
            metrics::counter!("rate_limiter.blocked").increment(1);
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                retry_after: Some(until.saturating_duration_since(now)),
                blocked: true,
            };
        }

        if count > max_requests as usize {
            metrics::counter!("rate_limiter.rejected", "reason" => "window").increment(1);
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                retry_after: Some((oldest + window).saturating_duration_since(now)),
                blocked: false,
            };
        }

        RateLimitDecision {
            allowed: true,
            remaining: max_requests - count as u32,
            retry_after: None,
            blocked: false,
        }
    }

    /// Forget the anonymous counters of a session that just authenticated.
    pub fn on_login(&self, session_id: &str, user_id: &str) {
        let cleared = self
            .windows
            .remove(&SubjectKey::Session(session_id.to_string()))
            .is_some();
        info!(user_id = %user_id, cleared, "Session authenticated, anonymous counters cleared");
    }

    /// Drop windows idle for longer than `idle` that are not blocked.
    pub fn sweep_idle(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, w| {
            w.blocked_until.map_or(false, |until| until > now)
                || now.saturating_duration_since(w.last_seen) < idle
        });
        before.saturating_sub(self.windows.len())
    }

    /// Sweep idle windows once per configured window until `shutdown`.
    pub async fn run_sweeper(&self, shutdown: CancellationToken) {
        loop {
            let window = self.tunables.borrow().rate_limit.window().max(Duration::from_secs(1));
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(window) => {}
            }

            let removed = self.sweep_idle(window * 2);
            if removed > 0 {
                debug!(removed, "Dropped idle rate limit windows");
            }
        }
    }

    pub fn tracked_subjects(&self) -> usize {
        self.windows.len()
    }
}
