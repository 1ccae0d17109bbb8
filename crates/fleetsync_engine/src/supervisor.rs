//! Connection state machine, reconnect backoff and heartbeat tracking.

use crate::config::{BackoffConfig, HeartbeatConfig};
use crate::error::{SyncError, SyncResult};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No channel and no attempt in flight.
    #[default]
    Disconnected,
    /// An open attempt is in flight.
    Connecting,
    /// A channel is open and healthy.
    Connected,
    /// A channel is open but has missed a heartbeat.
    Degraded,
}

impl ConnectionState {
    /// Returns the state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
        }
    }

    /// Returns true while a channel is open.
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }

    /// Returns true if moving to `next` is allowed.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connected, Degraded)
                | (Degraded, Connected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do after a failed or lost connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPlan {
    /// Wait before the next open.
    pub delay: Duration,
    /// Consecutive failed opens so far.
    pub attempt: u32,
    /// True the first time the streak reaches the failure budget.
    pub persistent: bool,
}

/// Drives the connection state machine.
///
/// Every state change goes through [`transition`](Self::transition), which
/// rejects moves the machine does not allow and publishes the new state on a
/// watch channel.
#[derive(Debug)]
pub struct ReconnectSupervisor {
    backoff: BackoffConfig,
    state: ConnectionState,
    consecutive_failures: u32,
    persistent_reported: bool,
    /// Set once the backend serves the current session.
    healthy: bool,
    rng: StdRng,
    state_tx: watch::Sender<ConnectionState>,
}

impl ReconnectSupervisor {
    /// Creates a supervisor in the disconnected state.
    pub fn new(backoff: BackoffConfig) -> Self {
        Self::with_rng(backoff, StdRng::from_entropy())
    }

    /// Creates a supervisor with a deterministic jitter source.
    pub fn with_seed(backoff: BackoffConfig, seed: u64) -> Self {
        Self::with_rng(backoff, StdRng::seed_from_u64(seed))
    }

    fn with_rng(backoff: BackoffConfig, rng: StdRng) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            backoff,
            state: ConnectionState::Disconnected,
            consecutive_failures: 0,
            persistent_reported: false,
            healthy: false,
            rng,
            state_tx,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Failed attempts since the backend last served a session.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Receiver that observes every state change.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Moves to `next`, rejecting disallowed transitions.
    pub fn transition(&mut self, next: ConnectionState) -> SyncResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(SyncError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        if self.state != next {
            info!(from = %self.state, to = %next, "connection state change");
            self.state = next;
            self.state_tx.send_replace(next);
        }
        Ok(())
    }

    /// Starts an open attempt.
    pub fn begin_connect(&mut self) -> SyncResult<()> {
        self.transition(ConnectionState::Connecting)
    }

    /// Records a successful open.
    ///
    /// The failure streak survives until the backend actually serves the
    /// session; see [`on_session_healthy`](Self::on_session_healthy).
    pub fn on_open_succeeded(&mut self) -> SyncResult<()> {
        self.transition(ConnectionState::Connected)?;
        self.healthy = false;
        Ok(())
    }

    /// Records that the backend answered on the current session, ending
    /// the failure streak.
    pub fn on_session_healthy(&mut self) {
        if self.healthy {
            return;
        }
        self.healthy = true;
        if self.consecutive_failures > 0 {
            info!(
                failures = self.consecutive_failures,
                "connected after failed attempts"
            );
        }
        self.consecutive_failures = 0;
        self.persistent_reported = false;
    }

    /// Records a failed open and plans the next attempt.
    pub fn on_open_failed(&mut self, cause: &SyncError) -> SyncResult<RetryPlan> {
        self.transition(ConnectionState::Disconnected)?;
        Ok(self.plan_retry(cause))
    }

    /// Records the loss of a live channel.
    ///
    /// Losing a session the backend had served reconnects immediately.
    /// Losing one it never served counts as a failed attempt, so a backend
    /// that accepts and then hangs up is retried with backoff.
    pub fn on_session_lost(&mut self) -> SyncResult<RetryPlan> {
        self.transition(ConnectionState::Disconnected)?;
        if std::mem::take(&mut self.healthy) {
            debug!("scheduling immediate reconnect");
            return Ok(RetryPlan {
                delay: Duration::ZERO,
                attempt: 0,
                persistent: false,
            });
        }
        Ok(self.plan_retry(&SyncError::ConnectionClosed))
    }

    fn plan_retry(&mut self, cause: &SyncError) -> RetryPlan {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        let base = self.backoff.delay_for_attempt(self.consecutive_failures);
        let delay = self.backoff.jittered(base, &mut self.rng);

        let persistent = !self.persistent_reported
            && self.consecutive_failures >= self.backoff.max_consecutive_failures;
        if persistent {
            self.persistent_reported = true;
            let error = SyncError::PersistentFailure {
                attempts: self.consecutive_failures,
            };
            error!(%error, %cause, "backend unreachable, still retrying");
        } else {
            warn!(
                %cause,
                attempt = self.consecutive_failures,
                delay_ms = delay.as_millis() as u64,
                "connection attempt failed"
            );
        }

        RetryPlan {
            delay,
            attempt: self.consecutive_failures,
            persistent,
        }
    }

    /// Marks a live channel as having missed a heartbeat.
    pub fn mark_degraded(&mut self) -> SyncResult<()> {
        self.transition(ConnectionState::Degraded)?;
        warn!("heartbeat missed, connection degraded");
        Ok(())
    }

    /// Marks a degraded channel healthy again.
    pub fn mark_recovered(&mut self) -> SyncResult<()> {
        self.transition(ConnectionState::Connected)?;
        info!("connection recovered");
        Ok(())
    }

    /// Returns to disconnected and clears the failure streak.
    pub fn close(&mut self) {
        if self.state != ConnectionState::Disconnected {
            self.state = ConnectionState::Disconnected;
            self.state_tx.send_replace(ConnectionState::Disconnected);
        }
        self.consecutive_failures = 0;
        self.persistent_reported = false;
        self.healthy = false;
    }
}

/// Action requested by a [`HeartbeatMonitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Nothing due.
    Idle,
    /// Send a ping with this nonce.
    SendPing(u64),
    /// The last ping went unanswered.
    Degrade,
    /// Degraded for too long; drop the channel.
    Drop,
}

/// Tracks liveness of one channel.
///
/// Any inbound frame counts as liveness, not just pongs.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    last_inbound: Instant,
    last_ping: Option<Instant>,
    awaiting: bool,
    degraded_since: Option<Instant>,
    next_nonce: u64,
}

impl HeartbeatMonitor {
    /// Starts monitoring a channel opened at `now`.
    pub fn new(config: HeartbeatConfig, now: Instant) -> Self {
        Self {
            config,
            last_inbound: now,
            last_ping: None,
            awaiting: false,
            degraded_since: None,
            next_nonce: 1,
        }
    }

    /// Records an inbound frame. Returns true if the channel was degraded.
    pub fn record_inbound(&mut self, now: Instant) -> bool {
        self.last_inbound = now;
        self.awaiting = false;
        self.degraded_since.take().is_some()
    }

    /// Returns true while a ping is unanswered past its timeout.
    pub fn is_degraded(&self) -> bool {
        self.degraded_since.is_some()
    }

    /// Decides what is due at `now`.
    pub fn poll(&mut self, now: Instant) -> HeartbeatAction {
        if let Some(since) = self.degraded_since {
            if now >= since + self.config.degraded_timeout {
                return HeartbeatAction::Drop;
            }
        } else if let (true, Some(ping)) = (self.awaiting, self.last_ping) {
            if now >= ping + self.config.timeout {
                self.degraded_since = Some(now);
                return HeartbeatAction::Degrade;
            }
        }

        if now >= self.next_ping_at() {
            let nonce = self.next_nonce;
            self.next_nonce += 1;
            self.last_ping = Some(now);
            self.awaiting = true;
            return HeartbeatAction::SendPing(nonce);
        }
        HeartbeatAction::Idle
    }

    /// Earliest instant at which [`poll`](Self::poll) may act.
    pub fn next_deadline(&self) -> Instant {
        let mut deadline = self.next_ping_at();
        if let Some(since) = self.degraded_since {
            deadline = deadline.min(since + self.config.degraded_timeout);
        } else if let (true, Some(ping)) = (self.awaiting, self.last_ping) {
            deadline = deadline.min(ping + self.config.timeout);
        }
        deadline
    }

    fn next_ping_at(&self) -> Instant {
        let last_activity = match self.last_ping {
            Some(ping) => ping.max(self.last_inbound),
            None => self.last_inbound,
        };
        last_activity + self.config.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> BackoffConfig {
        BackoffConfig::new(Duration::from_secs(1), 2.0, Duration::from_secs(8))
            .with_max_consecutive_failures(5)
    }

    fn failure() -> SyncError {
        SyncError::transport_retryable("connection refused")
    }

    #[test]
    fn allowed_transitions() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Connected));
        assert!(Degraded.can_transition_to(Disconnected));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connecting.can_transition_to(Degraded));
        assert!(!Connected.can_transition_to(Connecting));
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut supervisor = ReconnectSupervisor::with_seed(backoff(), 7);
        let err = supervisor.transition(ConnectionState::Connected).unwrap_err();
        assert_eq!(
            err,
            SyncError::InvalidStateTransition {
                from: "disconnected".into(),
                to: "connected".into()
            }
        );
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn backoff_schedule_without_jitter() {
        let mut supervisor = ReconnectSupervisor::with_seed(backoff(), 7);
        let mut delays = Vec::new();
        for _ in 0..6 {
            supervisor.begin_connect().unwrap();
            delays.push(supervisor.on_open_failed(&failure()).unwrap().delay.as_secs());
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 8, 8]);
    }

    #[test]
    fn persistent_failure_reported_once_per_streak() {
        let mut supervisor = ReconnectSupervisor::with_seed(backoff(), 7);
        let mut flags = Vec::new();
        for _ in 0..7 {
            supervisor.begin_connect().unwrap();
            flags.push(supervisor.on_open_failed(&failure()).unwrap().persistent);
        }
        assert_eq!(flags, vec![false, false, false, false, true, false, false]);

        supervisor.begin_connect().unwrap();
        supervisor.on_open_succeeded().unwrap();
        assert_eq!(supervisor.consecutive_failures(), 7);
        supervisor.on_session_healthy();
        assert_eq!(supervisor.consecutive_failures(), 0);

        supervisor.on_session_lost().unwrap();
        for i in 0..5 {
            supervisor.begin_connect().unwrap();
            let plan = supervisor.on_open_failed(&failure()).unwrap();
            assert_eq!(plan.persistent, i == 4);
        }
    }

    #[test]
    fn lost_session_reconnects_immediately() {
        let mut supervisor = ReconnectSupervisor::with_seed(backoff(), 7);
        supervisor.begin_connect().unwrap();
        supervisor.on_open_succeeded().unwrap();
        supervisor.on_session_healthy();

        let plan = supervisor.on_session_lost().unwrap();
        assert_eq!(plan.delay, Duration::ZERO);
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);

        // The next failure starts the schedule from the beginning.
        supervisor.begin_connect().unwrap();
        let plan = supervisor.on_open_failed(&failure()).unwrap();
        assert_eq!(plan.delay, Duration::from_secs(1));
    }

    #[test]
    fn session_lost_before_backend_answers_backs_off() {
        let mut supervisor = ReconnectSupervisor::with_seed(backoff(), 7);
        let mut delays = Vec::new();
        for _ in 0..4 {
            supervisor.begin_connect().unwrap();
            supervisor.on_open_succeeded().unwrap();
            delays.push(supervisor.on_session_lost().unwrap().delay.as_secs());
        }
        assert_eq!(delays, vec![1, 2, 4, 8]);
        assert_eq!(supervisor.consecutive_failures(), 4);
    }

    #[test]
    fn jittered_delays_stay_in_bounds() {
        let config = backoff().with_jitter(0.2);
        let mut supervisor = ReconnectSupervisor::with_seed(config, 99);
        for attempt in 1..=6u32 {
            supervisor.begin_connect().unwrap();
            let plan = supervisor.on_open_failed(&failure()).unwrap();
            let base = config.delay_for_attempt(attempt).as_secs_f64();
            let delay = plan.delay.as_secs_f64();
            assert!(delay >= base * 0.8 - 1e-9 && delay <= base * 1.2 + 1e-9);
        }
    }

    #[tokio::test]
    async fn watch_observes_changes() {
        let mut supervisor = ReconnectSupervisor::with_seed(backoff(), 7);
        let mut rx = supervisor.watch();
        supervisor.begin_connect().unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Connecting);

        supervisor.on_open_succeeded().unwrap();
        supervisor.mark_degraded().unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Degraded);

        supervisor.close();
        assert_eq!(*rx.borrow(), ConnectionState::Disconnected);
    }

    fn heartbeat() -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(10),
            degraded_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn heartbeat_pings_after_quiet_interval() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(heartbeat(), start);
        assert_eq!(monitor.poll(start + Duration::from_secs(14)), HeartbeatAction::Idle);
        assert_eq!(monitor.next_deadline(), start + Duration::from_secs(15));

        // Inbound traffic pushes the ping back.
        monitor.record_inbound(start + Duration::from_secs(10));
        assert_eq!(monitor.poll(start + Duration::from_secs(15)), HeartbeatAction::Idle);
        assert_eq!(
            monitor.poll(start + Duration::from_secs(25)),
            HeartbeatAction::SendPing(1)
        );
    }

    #[test]
    fn unanswered_ping_degrades_then_drops() {
        let start = Instant::now();
        let at = |secs| start + Duration::from_secs(secs);
        let mut monitor = HeartbeatMonitor::new(heartbeat(), start);

        assert_eq!(monitor.poll(at(15)), HeartbeatAction::SendPing(1));
        assert_eq!(monitor.next_deadline(), at(25));
        assert_eq!(monitor.poll(at(25)), HeartbeatAction::Degrade);
        assert!(monitor.is_degraded());
        assert_eq!(monitor.poll(at(30)), HeartbeatAction::SendPing(2));
        assert_eq!(monitor.poll(at(55)), HeartbeatAction::Drop);
    }

    #[test]
    fn inbound_frame_recovers_degraded_channel() {
        let start = Instant::now();
        let at = |secs| start + Duration::from_secs(secs);
        let mut monitor = HeartbeatMonitor::new(heartbeat(), start);

        monitor.poll(at(15));
        assert_eq!(monitor.poll(at(25)), HeartbeatAction::Degrade);
        assert!(monitor.record_inbound(at(26)));
        assert!(!monitor.is_degraded());
        assert!(!monitor.record_inbound(at(27)));
        assert_eq!(monitor.poll(at(40)), HeartbeatAction::Idle);
    }
}
