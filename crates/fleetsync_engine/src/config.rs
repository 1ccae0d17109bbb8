//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use fleetsync_protocol::{EntityKind, WireFormat, PROTOCOL_VERSION};
use rand::Rng;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Backend endpoint (e.g. `wss://api.example.com/v1/stream`).
    pub endpoint: String,
    /// Credentials presented on every open.
    pub credentials: Credentials,
    /// Kinds subscribed on every (re)connect.
    pub kinds: Vec<EntityKind>,
    /// Protocol version.
    pub protocol_version: u16,
    /// Encoding of outbound frames.
    pub wire_format: WireFormat,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
    /// Keepalive settings; `None` disables heartbeats.
    pub heartbeat: Option<HeartbeatConfig>,
    /// How long an optimistic mutation may stay unconfirmed.
    pub optimistic_timeout: Duration,
    /// How long after issue an uncorrelated event may confirm a mutation.
    pub confirm_window: Duration,
    /// Capacity of each opened channel's message queues and of the command
    /// queue. A full inbound queue stops the connector reading the network.
    pub queue_capacity: usize,
}

impl EngineConfig {
    /// Creates a new engine configuration.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            credentials: Credentials::none(),
            kinds: EntityKind::ALL.to_vec(),
            protocol_version: PROTOCOL_VERSION,
            wire_format: WireFormat::Binary,
            backoff: BackoffConfig::default(),
            heartbeat: Some(HeartbeatConfig::default()),
            optimistic_timeout: Duration::from_secs(10),
            confirm_window: Duration::from_secs(10),
            queue_capacity: 256,
        }
    }

    /// Sets the credentials.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Sets the subscribed kinds.
    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = EntityKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    /// Sets the outbound wire format.
    pub fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.wire_format = format;
        self
    }

    /// Sets the backoff configuration.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the heartbeat configuration.
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    /// Disables heartbeats.
    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat = None;
        self
    }

    /// Sets the optimistic mutation timeout.
    pub fn with_optimistic_timeout(mut self, timeout: Duration) -> Self {
        self.optimistic_timeout = timeout;
        self
    }

    /// Sets the uncorrelated confirmation window.
    pub fn with_confirm_window(mut self, window: Duration) -> Self {
        self.confirm_window = window;
        self
    }

    /// Sets the queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Checks that the configuration is usable.
    pub fn validate(&self) -> SyncResult<()> {
        if self.endpoint.trim().is_empty() {
            return Err(SyncError::Config("endpoint is empty".into()));
        }
        if self.queue_capacity == 0 {
            return Err(SyncError::Config("queue_capacity must be positive".into()));
        }
        if self.optimistic_timeout.is_zero() {
            return Err(SyncError::Config(
                "optimistic_timeout must be positive".into(),
            ));
        }
        self.backoff.validate()?;
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.validate()?;
        }
        Ok(())
    }

    /// Parses a JSON configuration document.
    ///
    /// Only `endpoint` is required; durations are in milliseconds.
    ///
    /// ```
    /// use fleetsync_engine::EngineConfig;
    ///
    /// let config = EngineConfig::from_json_str(r#"{
    ///     "endpoint": "wss://api.example.com/stream",
    ///     "backoff": { "base_delay_ms": 1000, "factor": 2.0, "max_delay_ms": 8000 },
    ///     "optimistic_timeout_ms": 5000
    /// }"#).unwrap();
    /// assert_eq!(config.backoff.max_delay.as_secs(), 8);
    /// ```
    pub fn from_json_str(json: &str) -> SyncResult<Self> {
        let file: ConfigFile =
            serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))?;
        let config = file.into_config();
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Configuration for reconnect backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for the un-jittered delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay; 0.25 spreads delays over ±25%.
    pub jitter: f64,
    /// Consecutive failures before a persistent-failure notification.
    pub max_consecutive_failures: u32,
}

impl BackoffConfig {
    /// Creates a backoff configuration without jitter.
    pub fn new(initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            jitter: 0.0,
            max_consecutive_failures: 5,
        }
    }

    /// Sets the jitter fraction.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets the persistent-failure threshold.
    pub fn with_max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = failures;
        self
    }

    /// Calculates the un-jittered delay for a given attempt (1-indexed).
    ///
    /// Attempt 0 has no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(delay_secs.max(0.0))
    }

    /// Spreads a delay uniformly over `[1 - jitter, 1 + jitter]` of its value.
    pub fn jittered<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }

    /// Checks that the schedule is usable.
    pub fn validate(&self) -> SyncResult<()> {
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err(SyncError::Config(format!(
                "backoff factor must be >= 1, got {}",
                self.multiplier
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(SyncError::Config(
                "backoff base delay exceeds max delay".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(SyncError::Config(format!(
                "backoff jitter must be in [0, 1), got {}",
                self.jitter
            )));
        }
        if self.max_consecutive_failures == 0 {
            return Err(SyncError::Config(
                "max_consecutive_failures must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 2.0, Duration::from_secs(30)).with_jitter(0.2)
    }
}

/// Keepalive configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between pings.
    pub interval: Duration,
    /// Silence after a ping before the connection counts as degraded.
    pub timeout: Duration,
    /// Time spent degraded before the session is dropped.
    pub degraded_timeout: Duration,
}

impl HeartbeatConfig {
    fn validate(&self) -> SyncResult<()> {
        if self.interval.is_zero() || self.timeout.is_zero() {
            return Err(SyncError::Config(
                "heartbeat interval and timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(10),
            degraded_timeout: Duration::from_secs(30),
        }
    }
}

/// Source of bearer tokens.
///
/// Token refresh lives outside the engine; the provider is asked for the
/// current token on every open.
pub trait TokenProvider: Send + Sync {
    /// Returns the current token, if any.
    fn token(&self) -> Option<String>;
}

impl<F> TokenProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn token(&self) -> Option<String> {
        self()
    }
}

struct StaticToken(String);

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Credentials presented to the backend.
#[derive(Clone, Default)]
pub struct Credentials {
    provider: Option<Arc<dyn TokenProvider>>,
}

impl Credentials {
    /// No credentials.
    pub fn none() -> Self {
        Self { provider: None }
    }

    /// A fixed bearer token.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::from_provider(StaticToken(token.into()))
    }

    /// Tokens fetched from a provider on every open.
    pub fn from_provider(provider: impl TokenProvider + 'static) -> Self {
        Self {
            provider: Some(Arc::new(provider)),
        }
    }

    /// Returns the current token.
    pub fn token(&self) -> Option<String> {
        self.provider.as_ref().and_then(|p| p.token())
    }

    /// Returns the `Authorization` header value, if a token is available.
    pub fn authorization_header(&self) -> Option<String> {
        self.token().map(|token| format!("Bearer {token}"))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = if self.provider.is_some() {
            "<redacted>"
        } else {
            "<none>"
        };
        f.debug_struct("Credentials")
            .field("token", &shown)
            .finish()
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    endpoint: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    kinds: Option<Vec<EntityKind>>,
    #[serde(default)]
    wire_format: Option<WireFormat>,
    #[serde(default)]
    backoff: Option<BackoffFile>,
    #[serde(default)]
    heartbeat: Option<HeartbeatFile>,
    #[serde(default)]
    optimistic_timeout_ms: Option<u64>,
    #[serde(default)]
    confirm_window_ms: Option<u64>,
    #[serde(default)]
    queue_capacity: Option<usize>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct BackoffFile {
    base_delay_ms: Option<u64>,
    factor: Option<f64>,
    max_delay_ms: Option<u64>,
    jitter: Option<f64>,
    max_consecutive_failures: Option<u32>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct HeartbeatFile {
    enabled: Option<bool>,
    interval_ms: Option<u64>,
    timeout_ms: Option<u64>,
    degraded_timeout_ms: Option<u64>,
}

impl ConfigFile {
    fn into_config(self) -> EngineConfig {
        let mut config = EngineConfig::new(self.endpoint);
        if let Some(token) = self.token {
            config.credentials = Credentials::bearer(token);
        }
        if let Some(kinds) = self.kinds {
            config.kinds = kinds;
        }
        if let Some(format) = self.wire_format {
            config.wire_format = format;
        }

        let backoff = self.backoff.unwrap_or_default();
        let defaults = BackoffConfig::default();
        config.backoff = BackoffConfig {
            initial_delay: backoff
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_delay),
            max_delay: backoff
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            multiplier: backoff.factor.unwrap_or(defaults.multiplier),
            jitter: backoff.jitter.unwrap_or(defaults.jitter),
            max_consecutive_failures: backoff
                .max_consecutive_failures
                .unwrap_or(defaults.max_consecutive_failures),
        };

        let heartbeat = self.heartbeat.unwrap_or_default();
        config.heartbeat = if heartbeat.enabled.unwrap_or(true) {
            let defaults = HeartbeatConfig::default();
            Some(HeartbeatConfig {
                interval: heartbeat
                    .interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.interval),
                timeout: heartbeat
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.timeout),
                degraded_timeout: heartbeat
                    .degraded_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.degraded_timeout),
            })
        } else {
            None
        };

        if let Some(ms) = self.optimistic_timeout_ms {
            config.optimistic_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.confirm_window_ms {
            config.confirm_window = Duration::from_millis(ms);
        }
        if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = capacity;
        }
        config
    }
}
