// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Per-client configuration.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Environment variable naming the cluster address.
pub const PROXY_ENV: &str = "YT_PROXY";

/// Environment variable selecting the backend (`http` or `rpc`).
pub const BACKEND_ENV: &str = "YT_BACKEND";

/// Transport variant used to reach the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Http,
    Rpc,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Http => "http",
            Backend::Rpc => "rpc",
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Backend::Http),
            "rpc" => Ok(Backend::Rpc),
            other => Err(Error::InvalidArgument(format!("unknown backend {:?}", other))),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read consistency preference for lookups and selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadFrom {
    #[default]
    Leader,
    Follower,
}

impl ReadFrom {
    pub fn as_str(self) -> &'static str {
        match self {
            ReadFrom::Leader => "leader",
            ReadFrom::Follower => "follower",
        }
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Relative jitter in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Returns the un-jittered delay before retry number `attempt` (0-based).
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Returns the delay before retry number `attempt` with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter <= 0.0 || nominal.is_zero() {
            return nominal;
        }
        let jitter = self.jitter.min(1.0);
        let scale = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        nominal.mul_f64(scale).min(self.max_delay)
    }
}

/// Configuration of one client instance.
///
/// There is no process-wide configuration; every client carries its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Target service address (`host:port`).
    pub cluster: String,
    pub backend: Backend,
    /// Deadline of a single call, retries included.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// Default tablet-transaction lease.
    #[serde(with = "duration_ms")]
    pub transaction_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub read_from: ReadFrom,
    /// Upper bound on open HTTP connections.
    pub max_connections: usize,
    /// Total wait for `sync` mount and unmount.
    #[serde(with = "duration_ms")]
    pub mount_wait_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub tablet_state_poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cluster: "localhost:80".to_string(),
            backend: Backend::Http,
            request_timeout: Duration::from_secs(20),
            transaction_timeout: Duration::from_secs(15),
            retry_policy: RetryPolicy::default(),
            read_from: ReadFrom::Leader,
            max_connections: 16,
            mount_wait_timeout: Duration::from_secs(60),
            tablet_state_poll_interval: Duration::from_millis(100),
        }
    }
}

impl ClientConfig {
    /// Creates a configuration for the given cluster with defaults elsewhere.
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            ..Self::default()
        }
    }

    /// Overlays `YT_PROXY` and `YT_BACKEND` from the environment.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();
        if let Ok(proxy) = std::env::var(PROXY_ENV) {
            config.cluster = proxy;
        }
        if let Ok(backend) = std::env::var(BACKEND_ENV) {
            config.backend = backend.parse()?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_read_from(mut self, read_from: ReadFrom) -> Self {
        self.read_from = read_from;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_mount_wait_timeout(mut self, timeout: Duration) -> Self {
        self.mount_wait_timeout = timeout;
        self
    }

    pub fn with_tablet_state_poll_interval(mut self, interval: Duration) -> Self {
        self.tablet_state_poll_interval = interval;
        self
    }

    /// Checks option ranges.
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |msg: &str| Err(Error::InvalidArgument(msg.to_string()));

        if self.cluster.trim().is_empty() {
            return invalid("cluster address must not be empty");
        }
        if self.request_timeout.is_zero() {
            return invalid("request_timeout must be positive");
        }
        if self.transaction_timeout.is_zero() {
            return invalid("transaction_timeout must be positive");
        }
        if self.retry_policy.max_attempts == 0 {
            return invalid("retry_policy.max_attempts must be at least 1");
        }
        if self.retry_policy.base_delay > self.retry_policy.max_delay {
            return invalid("retry_policy.base_delay must not exceed max_delay");
        }
        if !(0.0..=1.0).contains(&self.retry_policy.jitter) {
            return invalid("retry_policy.jitter must be within [0, 1]");
        }
        if self.max_connections == 0 {
            return invalid("max_connections must be at least 1");
        }
        if self.tablet_state_poll_interval.is_zero() {
            return invalid("tablet_state_poll_interval must be positive");
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
