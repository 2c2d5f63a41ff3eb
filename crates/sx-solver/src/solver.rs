//! The generation-loop contract shared by every solver.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use sx_types::{Message, ProtocolViolation, Sample, SampleSpec, SxResult, Termination};

use crate::agent::Agent;
use crate::config::SolverConfig;
use crate::evolution::EvolutionStrategy;
use crate::mcmc::Mcmc;

/// Whether a generation needs another batch before it is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStep {
    /// Submit another batch within the same generation.
    Continue,
    Complete,
}

/// Generation counter and termination state every solver carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolverCore {
    pub generation: usize,
    pub termination: Termination,
}

impl SolverCore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// prepare -> submit-and-wait -> update, repeated until the generation is
/// complete, then checkpoint and check termination.
pub trait GenerationLoop {
    fn name(&self) -> &'static str;

    fn core(&self) -> &SolverCore;

    fn core_mut(&mut self) -> &mut SolverCore;

    /// Next batch of the current generation. An empty batch is valid and is
    /// answered with an empty result set.
    fn prepare_generation(&mut self) -> SxResult<Vec<SampleSpec>>;

    /// A running sample sent a message; `Some` is delivered back to it.
    fn on_message(&mut self, message: &Message) -> SxResult<Option<Value>> {
        Err(ProtocolViolation::UnexpectedMessage {
            sample_id: message.sample_id,
            message: message.payload.to_string(),
        }
        .into())
    }

    /// Consume finished samples, in batch order.
    fn update_state(&mut self, results: Vec<Sample>) -> SxResult<GenerationStep>;

    /// Evaluate the termination criteria, recording the first one met.
    fn check_termination(&mut self) -> bool;

    /// Serialize the working set at a generation boundary.
    fn save_state(&self) -> SxResult<Value>;

    /// Restore a working set written by `save_state`.
    fn load_state(&mut self, state: Value) -> SxResult<()>;

    /// Short per-generation summary for logs.
    fn summary(&self) -> Value;

    fn generation(&self) -> usize {
        self.core().generation
    }

    fn termination(&self) -> &Termination {
        &self.core().termination
    }

    fn end_generation(&mut self) {
        self.core_mut().generation += 1;
    }
}

/// The solver variants.
pub enum Solver {
    Mcmc(Mcmc),
    Evolution(EvolutionStrategy),
    Agent(Agent),
}

impl Solver {
    pub fn from_config(config: &SolverConfig, seed: u64) -> SxResult<Self> {
        config.validate()?;
        Ok(match config {
            SolverConfig::Mcmc(c) => Solver::Mcmc(Mcmc::new(c.clone(), seed)?),
            SolverConfig::Evolution(c) => Solver::Evolution(EvolutionStrategy::new(c.clone(), seed)?),
            SolverConfig::Agent(c) => Solver::Agent(Agent::new(c.clone(), seed)?),
        })
    }

    fn inner(&self) -> &dyn GenerationLoop {
        match self {
            Solver::Mcmc(s) => s,
            Solver::Evolution(s) => s,
            Solver::Agent(s) => s,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn GenerationLoop {
        match self {
            Solver::Mcmc(s) => s,
            Solver::Evolution(s) => s,
            Solver::Agent(s) => s,
        }
    }
}

impl GenerationLoop for Solver {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn core(&self) -> &SolverCore {
        self.inner().core()
    }

    fn core_mut(&mut self) -> &mut SolverCore {
        self.inner_mut().core_mut()
    }

    fn prepare_generation(&mut self) -> SxResult<Vec<SampleSpec>> {
        self.inner_mut().prepare_generation()
    }

    fn on_message(&mut self, message: &Message) -> SxResult<Option<Value>> {
        self.inner_mut().on_message(message)
    }

    fn update_state(&mut self, results: Vec<Sample>) -> SxResult<GenerationStep> {
        self.inner_mut().update_state(results)
    }

    fn check_termination(&mut self) -> bool {
        self.inner_mut().check_termination()
    }

    fn save_state(&self) -> SxResult<Value> {
        self.inner().save_state()
    }

    fn load_state(&mut self, state: Value) -> SxResult<()> {
        self.inner_mut().load_state(state)
    }

    fn summary(&self) -> Value {
        self.inner().summary()
    }
}
