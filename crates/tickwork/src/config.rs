//! Engine configuration
//!
//! The embedder constructs a [`Config`] (loading it from wherever it
//! likes) and hands it to the supervisor. Validation happens once, at
//! startup.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dlq::DeadLetterConfig;

/// Errors from configuration validation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("poll_interval must be non-zero")]
    ZeroPollInterval,

    #[error("shutdown_timeout must be non-zero")]
    ZeroShutdownTimeout,

    #[error("queue {0:?} has a zero concurrency cap")]
    ZeroQueueConcurrency(String),

    #[error("failure_trip_threshold must be at least 1")]
    ZeroFailureThreshold,
}

/// Cluster strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerMode {
    /// One process; in-memory locks, trivially the leader.
    #[default]
    Single,
    /// Many processes sharing the store; locks and leadership live there.
    Distributed,
}

/// Store adapter selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreChoice {
    /// In-process store; single-node deployments and tests.
    #[default]
    Memory,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Master switch; when false the scheduler never polls (the
    /// dispatcher and workflow engine still run).
    pub enabled: bool,

    /// Store adapter.
    pub store: StoreChoice,

    /// Queue name to concurrency cap.
    pub queues: HashMap<String, usize>,

    /// Scheduler tick period.
    #[serde(with = "crate::util::duration_millis")]
    pub poll_interval: Duration,

    /// Graceful drain budget at shutdown.
    #[serde(with = "crate::util::duration_millis")]
    pub shutdown_timeout: Duration,

    /// Cluster strategy.
    pub peer: PeerMode,

    /// Dead-letter bounds and callback.
    pub dead_letter: DeadLetterConfig,

    /// Added to job timeouts when sizing unique-lock TTLs.
    #[serde(with = "crate::util::duration_millis")]
    pub lock_safety_margin: Duration,

    /// Consecutive dead-lettered firings before a job trips to `Failed`.
    pub failure_trip_threshold: u32,

    /// Optional bound on waiting runs per queue.
    #[serde(default)]
    pub max_pending: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            store: StoreChoice::Memory,
            queues: HashMap::new(),
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            peer: PeerMode::Single,
            dead_letter: DeadLetterConfig::default(),
            lock_safety_margin: Duration::from_secs(30),
            failure_trip_threshold: 10,
            max_pending: None,
        }
    }
}

impl Config {
    pub fn with_queue(mut self, name: impl Into<String>, concurrency: usize) -> Self {
        self.queues.insert(name.into(), concurrency);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_peer(mut self, peer: PeerMode) -> Self {
        self.peer = peer;
        self
    }

    pub fn with_dead_letter(mut self, dead_letter: DeadLetterConfig) -> Self {
        self.dead_letter = dead_letter;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Check invariants; called by the supervisor before starting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.shutdown_timeout.is_zero() {
            return Err(ConfigError::ZeroShutdownTimeout);
        }
        for (name, concurrency) in &self.queues {
            if *concurrency == 0 {
                return Err(ConfigError::ZeroQueueConcurrency(name.clone()));
            }
        }
        if self.failure_trip_threshold == 0 {
            return Err(ConfigError::ZeroFailureThreshold);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let config = Config::default().with_poll_interval(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroPollInterval)
        ));
    }

    #[test]
    fn zero_queue_cap_rejected() {
        let config = Config::default().with_queue("emails", 0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroQueueConcurrency(name)) if name == "emails"
        ));
    }

    #[test]
    fn serde_round_trip() {
        let config = Config::default()
            .with_queue("emails", 4)
            .with_peer(PeerMode::Distributed)
            .with_dead_letter(
                DeadLetterConfig::default()
                    .with_max_entries(500)
                    .with_max_age(Duration::from_secs(86_400)),
            );
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.queues["emails"], 4);
        assert_eq!(parsed.peer, PeerMode::Distributed);
        assert_eq!(parsed.dead_letter.max_entries, Some(500));
    }
}
