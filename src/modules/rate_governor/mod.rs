//! Per-host request governance.
//!
//! Combines three sliding request windows (second / minute / hour) with an
//! adaptive baseline delay and a temporary block that is armed by HTTP 429
//! feedback. Governors are handed out by a [`RateGovernorRegistry`] owned by
//! the crawl context, one instance per target host.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};

use super::delay_from_secs;

/// Statuses that make the governor slow down.
const THROTTLE_STATUSES: [u16; 6] = [429, 503, 521, 522, 523, 524];

/// Block length added per consecutive error when a 429 arrives.
const BLOCK_STEP: Duration = Duration::from_secs(30);

/// Limits and adaptive behaviour of a governor. Delays are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub requests_per_minute: f64,
    pub requests_per_hour: f64,
    pub adaptive: bool,
    pub backoff_factor: f64,
    pub recovery_time: f64,
    pub min_delay: f64,
    pub max_delay: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 1.0,
            requests_per_minute: 30.0,
            requests_per_hour: 1000.0,
            adaptive: true,
            backoff_factor: 2.0,
            recovery_time: 300.0,
            min_delay: 0.5,
            max_delay: 60.0,
        }
    }
}

impl RateLimitConfig {
    pub fn conservative() -> Self {
        Self {
            requests_per_second: 0.5,
            requests_per_minute: 20.0,
            requests_per_hour: 500.0,
            min_delay: 2.0,
            max_delay: 120.0,
            ..Self::default()
        }
    }

    pub fn standard() -> Self {
        Self {
            min_delay: 1.0,
            ..Self::default()
        }
    }

    pub fn aggressive() -> Self {
        Self {
            requests_per_second: 2.0,
            requests_per_minute: 60.0,
            requests_per_hour: 2000.0,
            min_delay: 0.5,
            max_delay: 30.0,
            ..Self::default()
        }
    }

    fn min_delay(&self) -> Duration {
        delay_from_secs(self.min_delay)
    }

    fn max_delay(&self) -> Duration {
        delay_from_secs(self.max_delay.max(self.min_delay))
    }

    fn recovery_time(&self) -> Duration {
        delay_from_secs(self.recovery_time)
    }
}

/// Point-in-time view of one governor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateGovernorSnapshot {
    pub host: String,
    pub requests_last_second: usize,
    pub requests_last_minute: usize,
    pub requests_last_hour: usize,
    pub current_delay: Duration,
    pub consecutive_errors: u32,
    pub blocked: bool,
    pub block_remaining: Duration,
}

#[derive(Debug)]
struct RateWindow {
    horizon: Duration,
    limit: f64,
    stamps: VecDeque<Instant>,
}

impl RateWindow {
    fn new(horizon: Duration, limit: f64) -> Self {
        Self {
            horizon,
            limit,
            stamps: VecDeque::new(),
        }
    }

    fn purge(&mut self, now: Instant) {
        while let Some(front) = self.stamps.front().copied() {
            if now.saturating_duration_since(front) >= self.horizon {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time until the oldest entry leaves the window, if the window is full.
    fn wait_needed(&self, now: Instant) -> Option<Duration> {
        if (self.stamps.len() as f64) < self.limit {
            return None;
        }
        let oldest = self.stamps.front()?;
        let wait = self
            .horizon
            .saturating_sub(now.saturating_duration_since(*oldest));
        (!wait.is_zero()).then_some(wait)
    }

    fn record(&mut self, now: Instant) {
        self.stamps.push_back(now);
    }
}

#[derive(Debug)]
struct GovernorState {
    windows: [RateWindow; 3],
    current_delay: Duration,
    consecutive_errors: u32,
    block_until: Option<Instant>,
}

impl GovernorState {
    fn new(config: &RateLimitConfig) -> Self {
        Self {
            windows: [
                RateWindow::new(Duration::from_secs(1), config.requests_per_second),
                RateWindow::new(Duration::from_secs(60), config.requests_per_minute),
                RateWindow::new(Duration::from_secs(3600), config.requests_per_hour),
            ],
            current_delay: config.min_delay(),
            consecutive_errors: 0,
            block_until: None,
        }
    }

    /// Remaining time before a request may be recorded, or `None` when the
    /// caller may proceed right away.
    fn pending_wait(&mut self, now: Instant) -> Option<Duration> {
        let blocked = match self.block_until {
            Some(until) if until > now => Some(until - now),
            Some(_) => {
                self.block_until = None;
                None
            }
            None => None,
        };

        let window_wait = self
            .windows
            .iter_mut()
            .filter_map(|window| {
                window.purge(now);
                window.wait_needed(now)
            })
            .max();

        match (blocked, window_wait) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Adaptive limiter for a single host.
///
/// `acquire` callers are serialised by an async turn lock held across the
/// whole wait-then-record sequence, so no two callers can both observe
/// "under limit" before the windows are updated. The state itself sits
/// behind a short-lived lock so feedback and snapshots never wait on a
/// sleeping acquirer.
#[derive(Debug)]
pub struct RateGovernor {
    host: String,
    config: RateLimitConfig,
    turn: tokio::sync::Mutex<()>,
    state: Mutex<GovernorState>,
}

impl RateGovernor {
    pub fn new(host: impl Into<String>, config: RateLimitConfig) -> Self {
        let state = GovernorState::new(&config);
        Self {
            host: host.into(),
            config,
            turn: tokio::sync::Mutex::new(()),
            state: Mutex::new(state),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Suspend until one more request is allowed, then record it and apply
    /// the baseline delay.
    pub async fn acquire(&self) {
        let _turn = self.turn.lock().await;

        loop {
            let wait = {
                let mut state = self.state();
                let now = Instant::now();
                match state.pending_wait(now) {
                    Some(wait) => wait,
                    None => {
                        for window in state.windows.iter_mut() {
                            window.record(now);
                        }
                        break;
                    }
                }
            };
            log::info!(
                "rate limit reached for {}, waiting {:.2}s",
                self.host,
                wait.as_secs_f64()
            );
            sleep(wait).await;
        }

        let delay = self.state().current_delay;
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }

    /// Feed back a failed request. `None` means the transport failed before a
    /// status was received.
    pub fn report_error(&self, status: Option<u16>) {
        if !self.config.adaptive {
            return;
        }

        let mut state = self.state();
        state.consecutive_errors = state.consecutive_errors.saturating_add(1);

        let throttled = status.is_none_or(|code| THROTTLE_STATUSES.contains(&code));
        if throttled {
            let previous = state.current_delay;
            let increased =
                delay_from_secs(previous.as_secs_f64() * self.config.backoff_factor.max(1.0));
            state.current_delay = increased.min(self.config.max_delay());
            log::info!(
                "{}: delay raised {:.2}s -> {:.2}s (status {:?})",
                self.host,
                previous.as_secs_f64(),
                state.current_delay.as_secs_f64(),
                status
            );
        }

        if status == Some(429) {
            let block = BLOCK_STEP
                .saturating_mul(state.consecutive_errors)
                .min(self.config.recovery_time());
            state.block_until = Some(Instant::now() + block);
            log::warn!(
                "{}: temporary block for {:.0}s after HTTP 429",
                self.host,
                block.as_secs_f64()
            );
        }
    }

    /// Feed back a successful request.
    pub fn report_success(&self) {
        if !self.config.adaptive {
            return;
        }

        let mut state = self.state();
        state.consecutive_errors = state.consecutive_errors.saturating_sub(1);
        if state.consecutive_errors == 0 && state.current_delay > self.config.min_delay() {
            let previous = state.current_delay;
            let decreased =
                delay_from_secs(previous.as_secs_f64() / self.config.backoff_factor.max(1.0));
            state.current_delay = decreased.max(self.config.min_delay());
            log::info!(
                "{}: delay lowered {:.2}s -> {:.2}s",
                self.host,
                previous.as_secs_f64(),
                state.current_delay.as_secs_f64()
            );
        }
    }

    pub fn snapshot(&self) -> RateGovernorSnapshot {
        let mut state = self.state();
        let now = Instant::now();
        for window in state.windows.iter_mut() {
            window.purge(now);
        }
        let block_remaining = state
            .block_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default();

        RateGovernorSnapshot {
            host: self.host.clone(),
            requests_last_second: state.windows[0].stamps.len(),
            requests_last_minute: state.windows[1].stamps.len(),
            requests_last_hour: state.windows[2].stamps.len(),
            current_delay: state.current_delay,
            consecutive_errors: state.consecutive_errors,
            blocked: !block_remaining.is_zero(),
            block_remaining,
        }
    }

    pub fn reset(&self) {
        *self.state() = GovernorState::new(&self.config);
        log::info!("{}: rate governor reset", self.host);
    }
}

/// Explicit host -> governor registry owned by the crawl context.
#[derive(Debug, Clone)]
pub struct RateGovernorRegistry {
    config: RateLimitConfig,
    governors: Arc<Mutex<HashMap<String, Arc<RateGovernor>>>>,
}

impl RateGovernorRegistry {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            governors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<RateGovernor>>> {
        self.governors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Governor for `host`, created on first use.
    pub fn governor(&self, host: &str) -> Arc<RateGovernor> {
        let key = host.to_ascii_lowercase();
        self.map()
            .entry(key)
            .or_insert_with_key(|host| {
                log::info!("rate governor created for {host}");
                Arc::new(RateGovernor::new(host.clone(), self.config.clone()))
            })
            .clone()
    }

    pub fn snapshot(&self) -> Vec<RateGovernorSnapshot> {
        let governors: Vec<_> = self.map().values().cloned().collect();
        let mut snapshots: Vec<_> = governors.iter().map(|g| g.snapshot()).collect();
        snapshots.sort_by(|a, b| a.host.cmp(&b.host));
        snapshots
    }

    pub fn reset_all(&self) {
        let governors: Vec<_> = self.map().values().cloned().collect();
        for governor in governors {
            governor.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::MAX_DELAY;

    fn unpaced(rps: f64) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_second: rps,
            requests_per_minute: 1000.0,
            requests_per_hour: 10_000.0,
            min_delay: 0.0,
            ..RateLimitConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn calls_within_the_per_second_limit_are_not_delayed() {
        let governor = RateGovernor::new("example.com", unpaced(3.0));
        let started = Instant::now();
        for _ in 0..3 {
            governor.acquire().await;
        }
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(governor.snapshot().requests_last_second, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn call_over_the_limit_waits_for_the_oldest_entry_to_expire() {
        let governor = RateGovernor::new("example.com", unpaced(2.0));
        let started = Instant::now();
        governor.acquire().await;
        sleep(Duration::from_millis(300)).await;
        governor.acquire().await;

        governor.acquire().await;
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn baseline_delay_is_applied_after_recording() {
        let config = RateLimitConfig {
            min_delay: 0.5,
            ..unpaced(10.0)
        };
        let governor = RateGovernor::new("example.com", config);
        let started = Instant::now();
        governor.acquire().await;
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_status_arms_block_and_backoff() {
        let config = RateLimitConfig {
            min_delay: 1.0,
            ..unpaced(10.0)
        };
        let governor = RateGovernor::new("example.com", config);
        governor.report_error(Some(429));

        let snapshot = governor.snapshot();
        assert_eq!(snapshot.consecutive_errors, 1);
        assert_eq!(snapshot.current_delay, Duration::from_secs(2));
        assert!(snapshot.blocked);
        assert_eq!(snapshot.block_remaining, Duration::from_secs(30));

        let started = Instant::now();
        governor.acquire().await;
        assert!(started.elapsed() >= Duration::from_secs(32));
        assert!(!governor.snapshot().blocked);
    }

    #[tokio::test(start_paused = true)]
    async fn block_length_is_capped_by_recovery_time() {
        let config = RateLimitConfig {
            recovery_time: 45.0,
            ..unpaced(10.0)
        };
        let governor = RateGovernor::new("example.com", config);
        governor.report_error(Some(429));
        governor.report_error(Some(429));
        assert_eq!(governor.snapshot().block_remaining, Duration::from_secs(45));
    }

    #[test]
    fn client_errors_do_not_raise_delay() {
        let governor = RateGovernor::new("example.com", RateLimitConfig::default());
        governor.report_error(Some(404));
        let snapshot = governor.snapshot();
        assert_eq!(snapshot.consecutive_errors, 1);
        assert_eq!(snapshot.current_delay, Duration::from_millis(500));
        assert!(!snapshot.blocked);
    }

    #[test]
    fn transport_failures_raise_delay_up_to_ceiling() {
        let config = RateLimitConfig {
            min_delay: 1.0,
            max_delay: 3.0,
            ..RateLimitConfig::default()
        };
        let governor = RateGovernor::new("example.com", config);
        for _ in 0..5 {
            governor.report_error(None);
        }
        assert_eq!(governor.snapshot().current_delay, Duration::from_secs(3));
    }

    #[test]
    fn successes_decay_delay_once_errors_clear() {
        let config = RateLimitConfig {
            min_delay: 1.0,
            ..RateLimitConfig::default()
        };
        let governor = RateGovernor::new("example.com", config);
        governor.report_error(Some(503));
        governor.report_error(Some(503));
        assert_eq!(governor.snapshot().current_delay, Duration::from_secs(4));

        governor.report_success();
        assert_eq!(governor.snapshot().current_delay, Duration::from_secs(4));
        governor.report_success();
        assert_eq!(governor.snapshot().current_delay, Duration::from_secs(2));
        governor.report_success();
        assert_eq!(governor.snapshot().current_delay, Duration::from_secs(1));
        governor.report_success();
        assert_eq!(governor.snapshot().current_delay, Duration::from_secs(1));
    }

    #[test]
    fn extreme_backoff_saturates_instead_of_overflowing() {
        let config = RateLimitConfig {
            min_delay: 1.0,
            max_delay: 1e30,
            recovery_time: 1e30,
            backoff_factor: 1e300,
            ..RateLimitConfig::default()
        };
        let governor = RateGovernor::new("example.com", config);
        governor.report_error(Some(503));
        governor.report_error(Some(429));
        let snapshot = governor.snapshot();
        assert_eq!(snapshot.current_delay, MAX_DELAY);
        assert!(snapshot.blocked);

        governor.report_success();
        governor.report_success();
        assert_eq!(governor.snapshot().current_delay, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_never_share_a_slot() {
        let governor = Arc::new(RateGovernor::new("example.com", unpaced(2.0)));
        let started = Instant::now();
        let calls = (0..6).map(|_| {
            let governor = governor.clone();
            async move {
                governor.acquire().await;
                (started.elapsed(), governor.snapshot().requests_last_second)
            }
        });
        let mut done = futures::future::join_all(calls).await;
        done.sort();

        for (index, (elapsed, in_window)) in done.iter().enumerate() {
            assert!(*in_window <= 2, "call {index} saw {in_window} requests in the window");
            assert!(
                *elapsed >= Duration::from_secs(index as u64 / 2),
                "call {index} finished after {elapsed:?}"
            );
        }
        assert!(done[5].0 < Duration::from_secs(3));
    }

    #[test]
    fn non_adaptive_governor_ignores_feedback() {
        let config = RateLimitConfig {
            adaptive: false,
            ..RateLimitConfig::default()
        };
        let governor = RateGovernor::new("example.com", config);
        governor.report_error(Some(429));
        let snapshot = governor.snapshot();
        assert_eq!(snapshot.consecutive_errors, 0);
        assert!(!snapshot.blocked);
    }

    #[test]
    fn registry_hands_out_one_governor_per_host() {
        let registry = RateGovernorRegistry::new(RateLimitConfig::default());
        let a = registry.governor("Kwork.ru");
        let b = registry.governor("kwork.ru");
        let c = registry.governor("example.com");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        let hosts: Vec<_> = registry.snapshot().into_iter().map(|s| s.host).collect();
        assert_eq!(hosts, vec!["example.com".to_string(), "kwork.ru".to_string()]);
    }
}
