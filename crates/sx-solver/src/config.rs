//! Experiment configuration, loaded from JSON.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use sx_types::{config_error, CheckpointConfig, ConduitConfig, ConfigError, SxResult};

use crate::agent::AgentConfig;
use crate::evolution::EvolutionConfig;
use crate::mcmc::McmcConfig;

/// Which solver drives the experiment, with its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SolverConfig {
    Mcmc(McmcConfig),
    Evolution(EvolutionConfig),
    Agent(AgentConfig),
}

impl SolverConfig {
    pub fn validate(&self) -> SxResult<()> {
        match self {
            SolverConfig::Mcmc(c) => c.validate(),
            SolverConfig::Evolution(c) => c.validate(),
            SolverConfig::Agent(c) => c.validate(),
        }
    }

    /// Registered model the solver submits samples to.
    pub fn model(&self) -> &str {
        match self {
            SolverConfig::Mcmc(c) => &c.model,
            SolverConfig::Evolution(c) => &c.model,
            SolverConfig::Agent(c) => &c.environment_model,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    pub name: String,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub conduit: ConduitConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    pub solver: SolverConfig,
}

impl ExperimentConfig {
    pub fn new(name: impl Into<String>, solver: SolverConfig) -> Self {
        Self {
            name: name.into(),
            seed: 0,
            conduit: ConduitConfig::default(),
            checkpoint: CheckpointConfig::default(),
            solver,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_conduit(mut self, conduit: ConduitConfig) -> Self {
        self.conduit = conduit;
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: CheckpointConfig) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn from_json(text: &str) -> SxResult<Self> {
        let config: ExperimentConfig = serde_json::from_str(text).map_err(|e| {
            config_error!("Experiment", "Configuration", "{e}")
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> SxResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading experiment configuration");
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Check every section before any sample runs.
    pub fn validate(&self) -> SxResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Missing {
                component: "Experiment".to_string(),
                setting: "Name".to_string(),
            }
            .into());
        }
        self.conduit.validate()?;
        self.checkpoint.validate()?;
        self.solver.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sx_types::{ConduitKind, SxError};

    const MCMC_JSON: &str = r#"{
        "name": "posterior",
        "seed": 42,
        "conduit": { "kind": "Local", "workers": 4 },
        "solver": {
            "Mcmc": {
                "model": "gaussian",
                "chain_length": 500,
                "rejection_levels": 2,
                "variables": [
                    {
                        "name": "x",
                        "prior": { "Uniform": { "minimum": -5.0, "maximum": 5.0 } },
                        "initial_mean": 0.0,
                        "standard_deviation": 1.0
                    }
                ]
            }
        }
    }"#;

    #[test]
    fn parses_with_defaults() {
        let config = ExperimentConfig::from_json(MCMC_JSON).unwrap();
        assert_eq!(config.seed, 42);
        assert_eq!(config.conduit.kind, ConduitKind::Local);
        assert_eq!(config.conduit.workers_per_sample, 1);
        assert!(!config.checkpoint.enabled);
        match &config.solver {
            SolverConfig::Mcmc(mcmc) => {
                assert_eq!(mcmc.chain_length, Some(500));
                assert_eq!(mcmc.burn_in, 0);
                assert_eq!(mcmc.chain_covariance_increment, 0.001);
            }
            other => panic!("expected MCMC, got {other:?}"),
        }
        assert_eq!(config.solver.model(), "gaussian");
    }

    #[test]
    fn unknown_settings_are_rejected() {
        let text = MCMC_JSON.replace(
            "\"rejection_levels\": 2",
            "\"rejection_levels\": 2, \"rejection_level\": 3",
        );
        assert!(matches!(
            ExperimentConfig::from_json(&text),
            Err(SxError::Config(_))
        ));
    }

    #[test]
    fn solver_settings_are_validated_on_load() {
        let text = MCMC_JSON.replace("\"chain_length\": 500,", "");
        let err = ExperimentConfig::from_json(&text).unwrap_err();
        assert!(err.to_string().contains("Chain Length"));

        let text = MCMC_JSON.replace("\"workers\": 4", "\"workers\": 4, \"workers_per_sample\": 3");
        assert!(ExperimentConfig::from_json(&text).is_err());
    }
}
