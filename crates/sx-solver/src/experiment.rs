// Experiment driver
// Runs a solver's generation loop against an engine and checkpoints it

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use sx_engine::{Engine, EngineStats, ModelRegistry};
use sx_types::{Checkpoint, ConfigError, SxError, SxResult};

use crate::checkpoint::CheckpointStore;
use crate::config::ExperimentConfig;
use crate::solver::{GenerationLoop, GenerationStep, Solver};

/// What a finished run reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub experiment_id: Uuid,
    pub solver: String,
    pub generations: usize,
    pub termination: Option<String>,
    pub engine: EngineStats,
    pub result: Value,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct Experiment {
    id: Uuid,
    config: ExperimentConfig,
    solver: Solver,
    engine: Engine,
    store: Option<CheckpointStore>,
    last_saved: Option<usize>,
}

impl Experiment {
    /// Validate the configuration, start the conduit and build the solver.
    /// Nothing is evaluated until [`Experiment::run`].
    pub fn new(config: ExperimentConfig, registry: Arc<ModelRegistry>) -> SxResult<Self> {
        config.validate()?;
        let model = config.solver.model();
        if !registry.contains(model) {
            return Err(ConfigError::UnknownModel {
                component: "Experiment".to_string(),
                name: model.to_string(),
            }
            .into());
        }

        let id = Uuid::new_v4();
        let solver = Solver::from_config(&config.solver, config.seed)?;
        let store = if config.checkpoint.enabled {
            Some(CheckpointStore::open(&config.checkpoint)?)
        } else {
            None
        };
        let engine = Engine::from_config(id, &config.conduit, registry)?;

        info!(
            experiment = %config.name,
            %id,
            solver = solver.name(),
            seed = config.seed,
            "experiment created"
        );
        Ok(Self {
            id,
            config,
            solver,
            engine,
            store,
            last_saved: None,
        })
    }

    /// Continue from a checkpoint record.
    pub fn resume(
        config: ExperimentConfig,
        registry: Arc<ModelRegistry>,
        checkpoint: Checkpoint,
    ) -> SxResult<Self> {
        let mut experiment = Self::new(config, registry)?;
        experiment.restore(checkpoint)?;
        Ok(experiment)
    }

    /// Continue from the newest checkpoint in the configured directory.
    pub fn resume_latest(config: ExperimentConfig, registry: Arc<ModelRegistry>) -> SxResult<Self> {
        let store = CheckpointStore::open(&config.checkpoint)?;
        let checkpoint = store.load_latest()?;
        Self::resume(config, registry, checkpoint)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn solver(&self) -> &Solver {
        &self.solver
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Generation loop until the solver terminates.
    pub fn run(&mut self) -> SxResult<RunSummary> {
        let started_at = Utc::now();
        let started = Instant::now();
        while !self.solver.check_termination() {
            self.run_generation()?;
        }

        let generation = self.solver.generation();
        if self.store.is_some() {
            self.save_checkpoint()?;
        }
        info!(
            experiment = %self.config.name,
            generations = generation,
            reason = self.solver.termination().reason().unwrap_or("none"),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "experiment finished"
        );
        Ok(RunSummary {
            experiment_id: self.id,
            solver: self.solver.name().to_string(),
            generations: generation,
            termination: self.solver.termination().reason().map(str::to_string),
            engine: self.engine.stats().clone(),
            result: self.solver.summary(),
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// One generation: prepare, submit and wait, update, repeated until the
    /// solver completes the generation.
    pub fn run_generation(&mut self) -> SxResult<()> {
        let started = Instant::now();
        let mut batches = 0;
        loop {
            let batch = self.solver.prepare_generation()?;
            batches += 1;
            let results = if batch.is_empty() {
                Vec::new()
            } else {
                let solver = &mut self.solver;
                self.engine
                    .submit_and_wait(batch, |message| solver.on_message(message))?
            };
            if self.solver.update_state(results)? == GenerationStep::Complete {
                break;
            }
        }
        self.solver.end_generation();

        let generation = self.solver.generation();
        debug!(generation, batches, "generation complete");
        info!(
            generation,
            elapsed_secs = started.elapsed().as_secs_f64(),
            summary = %self.solver.summary(),
            "generation finished"
        );

        if self.store.is_some() && generation % self.config.checkpoint.frequency == 0 {
            self.save_checkpoint()?;
        }
        Ok(())
    }

    /// Record of the current generation boundary.
    pub fn checkpoint(&self) -> SxResult<Checkpoint> {
        let state = self.solver.save_state()?;
        Ok(Checkpoint::new(
            self.id,
            self.config.name.clone(),
            self.solver.generation(),
            self.solver.termination().clone(),
            json!({ self.solver.name(): state }),
        ))
    }

    fn save_checkpoint(&mut self) -> SxResult<()> {
        let generation = self.solver.generation();
        if let Some(store) = &self.store {
            store.save(&self.checkpoint()?)?;
            self.last_saved = Some(generation);
        }
        Ok(())
    }

    /// Generation of the newest checkpoint written by this run.
    pub fn last_saved(&self) -> Option<usize> {
        self.last_saved
    }

    fn restore(&mut self, checkpoint: Checkpoint) -> SxResult<()> {
        let name = self.solver.name();
        let state = match checkpoint.solver {
            Value::Object(mut tagged) => tagged.remove(name),
            _ => None,
        }
        .ok_or_else(|| SxError::Checkpoint {
            message: format!(
                "checkpoint of '{}' holds no {name} state",
                checkpoint.experiment_name
            ),
        })?;

        self.solver.load_state(state)?;
        let core = self.solver.core_mut();
        core.generation = checkpoint.generation;
        core.termination = checkpoint.termination;
        info!(
            generation = checkpoint.generation,
            from = %checkpoint.experiment_id,
            "experiment restored from checkpoint"
        );
        Ok(())
    }
}
