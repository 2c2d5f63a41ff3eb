//! # sx-solver
//!
//! Generation-loop solvers driven through the sample execution engine:
//! a delayed-rejection MCMC sampler, a weighted-recombination evolution
//! strategy and a policy-gradient RL agent whose episodes run as
//! suspendable rollouts. [`Experiment`] ties a solver to an engine and
//! handles checkpointing.

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod evolution;
pub mod experiment;
pub mod mcmc;
pub mod prior;
pub mod solver;

pub use agent::{register_rollout, Agent, AgentConfig, LinearGaussianPolicy, Policy, PolicyPlacement};
pub use checkpoint::CheckpointStore;
pub use config::{ExperimentConfig, SolverConfig};
pub use evolution::{EvolutionConfig, EvolutionStrategy, ObjectiveDirection, OBJECTIVE};
pub use experiment::{Experiment, RunSummary};
pub use mcmc::{Mcmc, McmcConfig, McmcVariable, LOG_LIKELIHOOD};
pub use prior::Prior;
pub use solver::{GenerationLoop, GenerationStep, Solver, SolverCore};
