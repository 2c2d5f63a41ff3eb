//! Typed configuration for conduits and checkpointing.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::{ConfigError, SxResult};

/// Which compute substrate runs the samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConduitKind {
    /// Worker threads inside this process.
    Local,
    /// One worker per rank; rank 0 is the engine's home rank.
    Distributed,
}

/// Configuration for a conduit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConduitConfig {
    pub kind: ConduitKind,

    /// Pool size: worker threads (local) or worker ranks (distributed).
    pub workers: usize,

    /// Workers cooperating on one sample. The first worker of each group is
    /// the leader and the only one that reports results.
    pub workers_per_sample: usize,

    /// Stack size for each coroutine execution context.
    pub coroutine_stack_bytes: usize,

    /// Upper bound on how long the engine blocks waiting for progress before
    /// re-checking its backlog.
    pub poll_interval_ms: u64,
}

impl Default for ConduitConfig {
    fn default() -> Self {
        Self {
            kind: ConduitKind::Local,
            workers: 1,
            workers_per_sample: 1,
            coroutine_stack_bytes: 8 * 1024 * 1024,
            poll_interval_ms: 50,
        }
    }
}

impl ConduitConfig {
    pub fn local(workers: usize) -> Self {
        Self {
            kind: ConduitKind::Local,
            workers,
            ..Default::default()
        }
    }

    pub fn distributed(worker_ranks: usize) -> Self {
        Self {
            kind: ConduitKind::Distributed,
            workers: worker_ranks,
            ..Default::default()
        }
    }

    pub fn with_workers_per_sample(mut self, n: usize) -> Self {
        self.workers_per_sample = n;
        self
    }

    pub fn with_stack_bytes(mut self, bytes: usize) -> Self {
        self.coroutine_stack_bytes = bytes;
        self
    }

    /// Number of independent worker groups.
    pub fn teams(&self) -> usize {
        self.workers / self.workers_per_sample.max(1)
    }

    pub fn validate(&self) -> SxResult<()> {
        if self.workers == 0 {
            return Err(invalid("Conduit", "Workers", "must be at least one (is 0)"));
        }
        if self.workers_per_sample == 0 {
            return Err(invalid(
                "Conduit",
                "Workers Per Sample",
                "must be at least one (is 0)",
            ));
        }
        if self.workers % self.workers_per_sample != 0 {
            return Err(invalid(
                "Conduit",
                "Workers Per Sample",
                &format!(
                    "pool of {} workers cannot be split into groups of {}",
                    self.workers, self.workers_per_sample
                ),
            ));
        }
        if self.coroutine_stack_bytes < 64 * 1024 {
            return Err(invalid(
                "Conduit",
                "Coroutine Stack Bytes",
                &format!("must be at least 64 KiB (is {})", self.coroutine_stack_bytes),
            ));
        }
        Ok(())
    }
}

/// Checkpoint output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckpointConfig {
    pub enabled: bool,
    pub directory: PathBuf,
    /// Generations between checkpoints; the final generation is always saved.
    pub frequency: usize,
    /// Number of per-generation files to keep (0 = keep all).
    pub keep_last: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from("_samplex"),
            frequency: 1,
            keep_last: 5,
        }
    }
}

impl CheckpointConfig {
    pub fn in_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            directory: directory.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> SxResult<()> {
        if self.enabled && self.frequency == 0 {
            return Err(invalid(
                "Checkpoint",
                "Frequency",
                "must be at least one generation (is 0)",
            ));
        }
        Ok(())
    }
}

fn invalid(component: &str, setting: &str, message: &str) -> crate::SxError {
    ConfigError::Invalid {
        component: component.to_string(),
        setting: setting.to_string(),
        message: message.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SxError;

    #[test]
    fn default_conduit_config() {
        let config = ConduitConfig::default();
        assert_eq!(config.kind, ConduitKind::Local);
        assert_eq!(config.workers, 1);
        assert_eq!(config.teams(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn uneven_worker_groups_are_rejected() {
        let config = ConduitConfig::local(5).with_workers_per_sample(2);
        match config.validate() {
            Err(SxError::Config(ConfigError::Invalid { setting, .. })) => {
                assert_eq!(setting, "Workers Per Sample")
            }
            other => panic!("expected invalid setting, got {other:?}"),
        }
    }

    #[test]
    fn unknown_settings_are_rejected() {
        let json = r#"{"kind": "Local", "workers": 2, "threads": 4}"#;
        assert!(serde_json::from_str::<ConduitConfig>(json).is_err());
    }

    #[test]
    fn missing_settings_take_defaults() {
        let config: ConduitConfig = serde_json::from_str(r#"{"workers": 4}"#).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.workers_per_sample, 1);
        assert_eq!(config.kind, ConduitKind::Local);
    }

    #[test]
    fn checkpoint_frequency_must_be_positive() {
        let mut config = CheckpointConfig::in_directory("/tmp/x");
        config.frequency = 0;
        assert!(config.validate().is_err());
    }
}
