//! (mu, lambda) evolution strategy with a one-fifth success rule.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;
use tracing::debug;

use sx_types::{config_error, ConfigError, Sample, SampleSpec, SxResult};

use crate::solver::{GenerationLoop, GenerationStep, SolverCore};

const COMPONENT: &str = "Evolution";

/// Field a model writes its objective value into.
pub const OBJECTIVE: &str = "objective";

/// Whether the objective is maximized or minimized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ObjectiveDirection {
    #[default]
    Maximize,
    Minimize,
}

impl ObjectiveDirection {
    /// True when `a` is strictly better than `b`.
    pub fn improves(&self, a: f64, b: f64) -> bool {
        match self {
            Self::Maximize => a > b,
            Self::Minimize => a < b,
        }
    }

    fn rank(&self, a: f64, b: f64) -> Ordering {
        let ordering = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
        match self {
            Self::Maximize => ordering.reverse(),
            Self::Minimize => ordering,
        }
    }

    fn worst(&self) -> f64 {
        match self {
            Self::Maximize => f64::NEG_INFINITY,
            Self::Minimize => f64::INFINITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvolutionVariable {
    pub name: String,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub initial_mean: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvolutionConfig {
    pub model: String,
    pub direction: ObjectiveDirection,
    /// Offspring per generation (lambda).
    pub population_size: usize,
    /// Parents recombined into the next mean (mu); defaults to half the
    /// population.
    pub parent_count: Option<usize>,
    pub initial_step_size: f64,
    pub max_generations: Option<usize>,
    pub target_objective: Option<f64>,
    pub min_step_size: f64,
    pub variables: Vec<EvolutionVariable>,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            direction: ObjectiveDirection::Maximize,
            population_size: 16,
            parent_count: None,
            initial_step_size: 0.3,
            max_generations: None,
            target_objective: None,
            min_step_size: 1e-12,
            variables: Vec::new(),
        }
    }
}

impl EvolutionConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, lower: f64, upper: f64, initial: f64) -> Self {
        self.variables.push(EvolutionVariable {
            name: name.into(),
            lower_bound: lower,
            upper_bound: upper,
            initial_mean: initial,
        });
        self
    }

    pub fn with_objective(mut self, direction: ObjectiveDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_population(mut self, lambda: usize, mu: usize) -> Self {
        self.population_size = lambda;
        self.parent_count = Some(mu);
        self
    }

    pub fn with_max_generations(mut self, n: usize) -> Self {
        self.max_generations = Some(n);
        self
    }

    pub fn with_target_objective(mut self, target: f64) -> Self {
        self.target_objective = Some(target);
        self
    }

    pub fn with_step_size(mut self, initial: f64) -> Self {
        self.initial_step_size = initial;
        self
    }

    pub fn validate(&self) -> SxResult<()> {
        if self.model.is_empty() {
            return Err(ConfigError::Missing {
                component: COMPONENT.to_string(),
                setting: "Model".to_string(),
            }
            .into());
        }
        if self.variables.is_empty() {
            return Err(ConfigError::Missing {
                component: COMPONENT.to_string(),
                setting: "Variables".to_string(),
            }
            .into());
        }
        if self.population_size < 2 {
            return Err(config_error!(
                COMPONENT,
                "Population Size",
                "must be at least two (is {})",
                self.population_size
            ));
        }
        let mu = self.mu();
        if mu == 0 || mu > self.population_size {
            return Err(config_error!(
                COMPONENT,
                "Parent Count",
                "must be between 1 and the population size {} (is {mu})",
                self.population_size
            ));
        }
        if !(self.initial_step_size > 0.0) {
            return Err(config_error!(
                COMPONENT,
                "Initial Step Size",
                "must be positive (is {})",
                self.initial_step_size
            ));
        }
        if self.max_generations == Some(0) {
            return Err(config_error!(COMPONENT, "Max Generations", "must be at least one"));
        }
        for v in &self.variables {
            if !(v.lower_bound < v.upper_bound) {
                return Err(config_error!(
                    COMPONENT,
                    format!("{}.Bounds", v.name),
                    "lower bound ({}) must be below upper bound ({})",
                    v.lower_bound,
                    v.upper_bound
                ));
            }
            if v.initial_mean < v.lower_bound || v.initial_mean > v.upper_bound {
                return Err(config_error!(
                    COMPONENT,
                    format!("{}.Initial Mean", v.name),
                    "{} lies outside [{}, {}]",
                    v.initial_mean,
                    v.lower_bound,
                    v.upper_bound
                ));
            }
        }
        Ok(())
    }

    fn mu(&self) -> usize {
        self.parent_count.unwrap_or(self.population_size / 2)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct EvolutionState {
    rng: ChaCha8Rng,
    mean: Vec<f64>,
    step_size: f64,
    best: Option<(Vec<f64>, f64)>,
    function_evaluations: u64,
    success_rate: f64,
    /// Offspring of the generation in flight.
    offspring: Vec<Vec<f64>>,
}

pub struct EvolutionStrategy {
    config: EvolutionConfig,
    core: SolverCore,
    state: EvolutionState,
    weights: Vec<f64>,
}

impl EvolutionStrategy {
    pub fn new(config: EvolutionConfig, seed: u64) -> SxResult<Self> {
        config.validate()?;
        let mu = config.mu();
        let raw: Vec<f64> = (0..mu)
            .map(|i| (mu as f64 + 0.5).ln() - ((i + 1) as f64).ln())
            .collect();
        let total: f64 = raw.iter().sum();
        let weights = raw.into_iter().map(|w| w / total).collect();

        Ok(Self {
            core: SolverCore::new(),
            state: EvolutionState {
                rng: ChaCha8Rng::seed_from_u64(seed),
                mean: config.variables.iter().map(|v| v.initial_mean).collect(),
                step_size: config.initial_step_size,
                best: None,
                function_evaluations: 0,
                success_rate: 0.0,
                offspring: Vec::new(),
            },
            config,
            weights,
        })
    }

    pub fn best(&self) -> Option<(&[f64], f64)> {
        self.state.best.as_ref().map(|(p, f)| (p.as_slice(), *f))
    }

    pub fn mean(&self) -> &[f64] {
        &self.state.mean
    }

    pub fn step_size(&self) -> f64 {
        self.state.step_size
    }

    pub fn function_evaluations(&self) -> u64 {
        self.state.function_evaluations
    }

    fn sample_offspring(&mut self) -> Vec<f64> {
        let step = self.state.step_size;
        let mean = self.state.mean.clone();
        let rng = &mut self.state.rng;
        self.config
            .variables
            .iter()
            .zip(mean)
            .map(|(v, m)| {
                let z: f64 = rng.sample(StandardNormal);
                (m + step * z).clamp(v.lower_bound, v.upper_bound)
            })
            .collect()
    }
}

impl GenerationLoop for EvolutionStrategy {
    fn name(&self) -> &'static str {
        "Evolution"
    }

    fn core(&self) -> &SolverCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SolverCore {
        &mut self.core
    }

    fn prepare_generation(&mut self) -> SxResult<Vec<SampleSpec>> {
        let offspring: Vec<Vec<f64>> = (0..self.config.population_size)
            .map(|_| self.sample_offspring())
            .collect();
        let batch = offspring
            .iter()
            .map(|x| SampleSpec::new(self.config.model.clone(), x.clone()))
            .collect();
        self.state.offspring = offspring;
        Ok(batch)
    }

    fn update_state(&mut self, results: Vec<Sample>) -> SxResult<GenerationStep> {
        let direction = self.config.direction;
        let offspring = std::mem::take(&mut self.state.offspring);
        let mut scored = Vec::with_capacity(results.len());
        for (point, sample) in offspring.into_iter().zip(&results) {
            scored.push((point, sample.get_f64(OBJECTIVE)?));
        }
        self.state.function_evaluations += scored.len() as u64;

        let previous_best = self.best().map_or(direction.worst(), |(_, f)| f);
        let successes = scored
            .iter()
            .filter(|(_, f)| direction.improves(*f, previous_best))
            .count();
        scored.sort_by(|a, b| direction.rank(a.1, b.1));

        if let Some((point, objective)) = scored.first() {
            if direction.improves(*objective, previous_best) {
                self.state.best = Some((point.clone(), *objective));
            }
        }

        let n = self.state.mean.len();
        let mut mean = vec![0.0; n];
        for ((point, _), w) in scored.iter().zip(&self.weights) {
            for d in 0..n {
                mean[d] += w * point[d];
            }
        }
        self.state.mean = mean;

        self.state.success_rate = successes as f64 / scored.len().max(1) as f64;
        if self.state.success_rate > 0.2 {
            self.state.step_size *= 1.22;
        } else if self.state.success_rate < 0.2 {
            self.state.step_size *= 0.82;
        }
        debug!(
            successes,
            step_size = self.state.step_size,
            best = ?self.best().map(|(_, f)| f),
            "evolution generation scored"
        );
        Ok(GenerationStep::Complete)
    }

    fn check_termination(&mut self) -> bool {
        if let Some(max) = self.config.max_generations {
            if self.core.generation >= max {
                self.core
                    .termination
                    .reach(format!("Max generations ({max}) reached"));
            }
        }
        let best = self.best().map(|(_, f)| f);
        if let (Some(target), Some(best)) = (self.config.target_objective, best) {
            if best == target || self.config.direction.improves(best, target) {
                self.core
                    .termination
                    .reach(format!("Target objective ({target}) reached with {best}"));
            }
        }
        if self.state.step_size < self.config.min_step_size {
            self.core.termination.reach(format!(
                "Step size {} fell below {}",
                self.state.step_size, self.config.min_step_size
            ));
        }
        self.core.termination.is_reached()
    }

    fn save_state(&self) -> SxResult<Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn load_state(&mut self, state: Value) -> SxResult<()> {
        self.state = serde_json::from_value(state)?;
        Ok(())
    }

    fn summary(&self) -> Value {
        json!({
            "best_objective": self.best().map(|(_, f)| f),
            "best_point": self.best().map(|(p, _)| p.to_vec()),
            "mean": self.state.mean,
            "step_size": self.state.step_size,
            "success_rate": self.state.success_rate,
        })
    }
}
