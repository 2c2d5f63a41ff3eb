//! Delayed-rejection Markov chain Monte Carlo with optional adaptive
//! proposals.

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector, Dyn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, trace};

use sx_types::{config_error, ConfigError, Sample, SampleSpec, SxResult};

use crate::prior::{log_prior, Prior};
use crate::solver::{GenerationLoop, GenerationStep, SolverCore};

const COMPONENT: &str = "MCMC";

/// Field a model writes its log-likelihood into.
pub const LOG_LIKELIHOOD: &str = "logLikelihood";

/// One sampled variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct McmcVariable {
    pub name: String,
    pub prior: Prior,
    pub initial_mean: f64,
    /// Proposal standard deviation before adaptation kicks in.
    pub standard_deviation: f64,
    /// The chain lives in log space; the model sees `exp(x)`.
    #[serde(default)]
    pub log_space: bool,
}

impl McmcVariable {
    pub fn new(name: impl Into<String>, prior: Prior, initial_mean: f64, standard_deviation: f64) -> Self {
        Self {
            name: name.into(),
            prior,
            initial_mean,
            standard_deviation,
            log_space: false,
        }
    }

    pub fn in_log_space(mut self) -> Self {
        self.log_space = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct McmcConfig {
    /// Registered model evaluated for each candidate.
    pub model: String,
    /// Database entries to collect. Mandatory.
    pub chain_length: Option<usize>,
    pub burn_in: usize,
    pub rejection_levels: usize,
    pub use_adaptive_sampling: bool,
    /// Entries collected with the fixed proposal; defaults to 5% of the chain.
    pub non_adaption_period: Option<f64>,
    /// Defaults to `2.4^2 / N`.
    pub chain_covariance_scaling: Option<f64>,
    pub chain_covariance_increment: f64,
    pub max_function_evaluations: Option<u64>,
    pub variables: Vec<McmcVariable>,
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            chain_length: None,
            burn_in: 0,
            rejection_levels: 1,
            use_adaptive_sampling: false,
            non_adaption_period: None,
            chain_covariance_scaling: None,
            chain_covariance_increment: 0.001,
            max_function_evaluations: None,
            variables: Vec::new(),
        }
    }
}

impl McmcConfig {
    pub fn new(model: impl Into<String>, chain_length: usize) -> Self {
        Self {
            model: model.into(),
            chain_length: Some(chain_length),
            ..Self::default()
        }
    }

    pub fn with_variable(mut self, variable: McmcVariable) -> Self {
        self.variables.push(variable);
        self
    }

    pub fn with_burn_in(mut self, burn_in: usize) -> Self {
        self.burn_in = burn_in;
        self
    }

    pub fn with_rejection_levels(mut self, levels: usize) -> Self {
        self.rejection_levels = levels;
        self
    }

    pub fn with_adaptive_sampling(mut self, enabled: bool) -> Self {
        self.use_adaptive_sampling = enabled;
        self
    }

    pub fn with_max_function_evaluations(mut self, max: u64) -> Self {
        self.max_function_evaluations = Some(max);
        self
    }

    pub fn validate(&self) -> SxResult<()> {
        if self.model.is_empty() {
            return Err(missing("Model"));
        }
        let chain_length = self.chain_length.ok_or_else(|| missing("Chain Length"))?;
        if chain_length == 0 {
            return Err(config_error!(COMPONENT, "Chain Length", "must be at least one"));
        }
        if self.rejection_levels < 1 {
            return Err(config_error!(
                COMPONENT,
                "Rejection Levels",
                "must be at least one (is {})",
                self.rejection_levels
            ));
        }
        if self.variables.is_empty() {
            return Err(missing("Variables"));
        }
        if let Some(scaling) = self.chain_covariance_scaling {
            if !(scaling >= 0.0) {
                return Err(config_error!(
                    COMPONENT,
                    "Chain Covariance Scaling",
                    "must not be negative (is {scaling})"
                ));
            }
        }
        if !(self.chain_covariance_increment >= 0.0) {
            return Err(config_error!(
                COMPONENT,
                "Chain Covariance Increment",
                "must not be negative (is {})",
                self.chain_covariance_increment
            ));
        }
        for variable in &self.variables {
            if !(variable.standard_deviation >= 0.0) {
                return Err(config_error!(
                    COMPONENT,
                    format!("{}.Standard Deviation", variable.name),
                    "must not be negative (is {})",
                    variable.standard_deviation
                ));
            }
            variable.prior.validate(COMPONENT, &variable.name)?;
        }
        Ok(())
    }

    fn dimension(&self) -> usize {
        self.variables.len()
    }

    fn resolved_chain_length(&self) -> usize {
        self.chain_length.unwrap_or(0)
    }

    fn resolved_non_adaption_period(&self) -> f64 {
        self.non_adaption_period
            .unwrap_or(0.05 * self.resolved_chain_length() as f64)
    }

    fn resolved_covariance_scaling(&self) -> f64 {
        self.chain_covariance_scaling
            .unwrap_or(2.4 * 2.4 / self.dimension() as f64)
    }
}

fn missing(setting: &str) -> sx_types::SxError {
    ConfigError::Missing {
        component: COMPONENT.to_string(),
        setting: setting.to_string(),
    }
    .into()
}

/// Acceptance probability of the last of `candidates` given the leader's
/// log posterior `leader`, by the delayed-rejection recursion.
///
/// Works in log space; returns `(alpha, log_denominator)`. The cost grows
/// exponentially with the number of candidates. With no candidates there is
/// nothing to accept: `(0, leader)`.
pub(crate) fn recursive_alpha(leader: f64, candidates: &[f64]) -> (f64, f64) {
    let Some((&last, earlier)) = candidates.split_last() else {
        return (0.0, leader);
    };
    if earlier.is_empty() {
        return (clamp_ratio(last - leader), leader);
    }

    let reversed: Vec<f64> = earlier.iter().rev().copied().collect();
    let mut log_numerator = last;
    for i in 0..earlier.len() {
        let (alpha, _) = recursive_alpha(last, &reversed[..=i]);
        log_numerator += (-alpha).ln_1p();
    }

    let (previous, previous_denominator) = recursive_alpha(leader, earlier);
    let log_denominator = previous_denominator + (-previous).ln_1p();

    let alpha = if log_numerator == f64::NEG_INFINITY {
        0.0
    } else if log_denominator == f64::NEG_INFINITY {
        1.0
    } else {
        clamp_ratio(log_numerator - log_denominator)
    };
    (alpha, log_denominator)
}

fn clamp_ratio(log_ratio: f64) -> f64 {
    if log_ratio.is_nan() {
        0.0
    } else {
        log_ratio.exp().min(1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct McmcState {
    rng: ChaCha8Rng,
    leader: Vec<f64>,
    leader_log_posterior: f64,
    chain_steps: usize,
    accepted: usize,
    proposals_generated: u64,
    function_evaluations: u64,
    acceptance_rate: f64,
    database: Vec<Vec<f64>>,
    database_log_posteriors: Vec<f64>,
    chain_mean: DVector<f64>,
    chain_covariance: DMatrix<f64>,
}

/// Candidate waiting for its model evaluation.
#[derive(Debug, Clone)]
struct Pending {
    point: Vec<f64>,
    log_prior: f64,
}

pub struct Mcmc {
    config: McmcConfig,
    core: SolverCore,
    state: McmcState,
    /// Log posteriors of this generation's candidates, one per level tried.
    candidates: Vec<f64>,
    pending: Option<Pending>,
}

impl Mcmc {
    pub fn new(config: McmcConfig, seed: u64) -> SxResult<Self> {
        config.validate()?;
        let n = config.dimension();
        let leader = config.variables.iter().map(|v| v.initial_mean).collect();
        Ok(Self {
            core: SolverCore::new(),
            state: McmcState {
                rng: ChaCha8Rng::seed_from_u64(seed),
                leader,
                leader_log_posterior: -f64::MAX,
                chain_steps: 0,
                accepted: 0,
                proposals_generated: 0,
                function_evaluations: 0,
                acceptance_rate: 1.0,
                database: Vec::new(),
                database_log_posteriors: Vec::new(),
                chain_mean: DVector::zeros(n),
                chain_covariance: DMatrix::zeros(n, n),
            },
            config,
            candidates: Vec::new(),
            pending: None,
        })
    }

    pub fn config(&self) -> &McmcConfig {
        &self.config
    }

    pub fn database_entries(&self) -> usize {
        self.state.database.len()
    }

    pub fn database(&self) -> &[Vec<f64>] {
        &self.state.database
    }

    pub fn leader(&self) -> &[f64] {
        &self.state.leader
    }

    pub fn leader_log_posterior(&self) -> f64 {
        self.state.leader_log_posterior
    }

    pub fn accepted(&self) -> usize {
        self.state.accepted
    }

    pub fn acceptance_rate(&self) -> f64 {
        self.state.acceptance_rate
    }

    pub fn function_evaluations(&self) -> u64 {
        self.state.function_evaluations
    }

    pub fn proposals_generated(&self) -> u64 {
        self.state.proposals_generated
    }

    pub fn chain_mean(&self) -> &DVector<f64> {
        &self.state.chain_mean
    }

    pub fn chain_covariance(&self) -> &DMatrix<f64> {
        &self.state.chain_covariance
    }

    fn priors(&self) -> Vec<Prior> {
        self.config.variables.iter().map(|v| v.prior.clone()).collect()
    }

    /// Cholesky factor of the chain covariance once adaptation is active.
    /// `None` keeps the fixed diagonal proposal, including when the
    /// covariance is not positive definite.
    fn adaptive_proposal(&self) -> Option<Cholesky<f64, Dyn>> {
        let threshold = self.config.resolved_non_adaption_period() + self.config.burn_in as f64;
        if !self.config.use_adaptive_sampling || (self.database_entries() as f64) <= threshold {
            return None;
        }
        let factor = Cholesky::new(self.state.chain_covariance.clone());
        if factor.is_none() {
            debug!("chain covariance is not positive definite, using the fixed proposal");
        }
        factor
    }

    fn draw_candidate(&mut self) -> Vec<f64> {
        let n = self.config.dimension();
        let rng = &mut self.state.rng;
        let z = DVector::<f64>::from_fn(n, |_, _| rng.sample(StandardNormal));
        self.state.proposals_generated += 1;

        let step = match self.adaptive_proposal() {
            Some(factor) => factor.l() * &z,
            None => DVector::from_iterator(
                n,
                self.config
                    .variables
                    .iter()
                    .zip(z.iter())
                    .map(|(v, z)| v.standard_deviation * z),
            ),
        };

        self.state
            .leader
            .iter()
            .zip(step.iter())
            .map(|(x, dx)| x + dx)
            .collect()
    }

    fn model_inputs(&self, point: &[f64]) -> Vec<f64> {
        self.config
            .variables
            .iter()
            .zip(point)
            .map(|(v, x)| if v.log_space { x.exp() } else { *x })
            .collect()
    }

    /// Weigh the newest candidate against the leader. Returns whether the
    /// generation's levels are over.
    fn accept_or_reject(&mut self, candidate: Vec<f64>, log_posterior: f64) -> bool {
        self.candidates.push(log_posterior);
        let (alpha, _) = recursive_alpha(self.state.leader_log_posterior, &self.candidates);
        let accepted = alpha >= 1.0 || self.state.rng.gen::<f64>() < alpha;
        trace!(
            level = self.candidates.len() - 1,
            log_posterior,
            alpha,
            accepted,
            "delayed-rejection step"
        );
        if accepted {
            self.state.accepted += 1;
            self.state.leader = candidate;
            self.state.leader_log_posterior = log_posterior;
        }
        accepted || self.candidates.len() >= self.config.rejection_levels
    }

    fn finish_generation(&mut self) {
        self.candidates.clear();
        self.pending = None;
        self.state.chain_steps += 1;
        if self.state.chain_steps > self.config.burn_in {
            self.state.database.push(self.state.leader.clone());
            self.state
                .database_log_posteriors
                .push(self.state.leader_log_posterior);
            self.update_chain_statistics();
        }
        self.state.acceptance_rate = self.state.accepted as f64 / self.state.chain_steps as f64;
    }

    /// Recursive chain mean and covariance (Haario et al. 2001), including
    /// the point just appended.
    ///
    /// With `N` database entries and `t = N - 1`:
    ///
    /// `C_N = (t - 1) / t * C_{N-1} + s / t * (t * m_{N-1} m_{N-1}' - N * m_N m_N' + x x' + eps * I)`
    ///
    /// so that for `N >= 2` the covariance equals
    /// `s * (S_N + eps * I)`, where `S_N` is the unbiased sample covariance of
    /// the database, `s` the covariance scaling and `eps` the increment. The
    /// covariance stays zero until the second entry.
    fn update_chain_statistics(&mut self) {
        let entries = self.database_entries() as f64;
        let scaling = self.config.resolved_covariance_scaling();
        let increment = self.config.chain_covariance_increment;
        let x = DVector::from_column_slice(&self.state.leader);
        let n = x.len();

        let old_mean = self.state.chain_mean.clone();
        let mean = &old_mean + (&x - &old_mean) / entries;

        if entries >= 2.0 {
            let t = entries - 1.0;
            let outer = &old_mean * old_mean.transpose() * t - &mean * mean.transpose() * entries
                + &x * x.transpose()
                + DMatrix::identity(n, n) * increment;
            self.state.chain_covariance =
                &self.state.chain_covariance * ((t - 1.0) / t) + outer * (scaling / t);
        }
        self.state.chain_mean = mean;
    }
}

impl GenerationLoop for Mcmc {
    fn name(&self) -> &'static str {
        "MCMC"
    }

    fn core(&self) -> &SolverCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SolverCore {
        &mut self.core
    }

    fn prepare_generation(&mut self) -> SxResult<Vec<SampleSpec>> {
        let priors = self.priors();
        while self.candidates.len() < self.config.rejection_levels {
            let point = self.draw_candidate();
            let prior = log_prior(&priors, &point);
            if prior == f64::NEG_INFINITY {
                debug!(level = self.candidates.len(), "candidate outside prior support");
                if self.accept_or_reject(point, f64::NEG_INFINITY) {
                    break;
                }
                continue;
            }

            self.state.function_evaluations += 1;
            let spec = SampleSpec::new(self.config.model.clone(), self.model_inputs(&point));
            self.pending = Some(Pending {
                point,
                log_prior: prior,
            });
            return Ok(vec![spec]);
        }
        Ok(Vec::new())
    }

    fn update_state(&mut self, results: Vec<Sample>) -> SxResult<GenerationStep> {
        let done = match (results.first(), self.pending.take()) {
            (Some(sample), Some(pending)) => {
                let log_likelihood = sample.get_f64(LOG_LIKELIHOOD)?;
                self.accept_or_reject(pending.point, log_likelihood + pending.log_prior)
            }
            // Every remaining level was rejected on its prior.
            _ => true,
        };

        if done {
            self.finish_generation();
            Ok(GenerationStep::Complete)
        } else {
            Ok(GenerationStep::Continue)
        }
    }

    fn check_termination(&mut self) -> bool {
        if let Some(max) = self.config.max_function_evaluations {
            if self.state.function_evaluations >= max {
                self.core.termination.reach(format!(
                    "Max function evaluations reached ({})",
                    self.state.function_evaluations
                ));
            }
        }
        let chain_length = self.config.resolved_chain_length();
        if self.database_entries() == chain_length {
            self.core
                .termination
                .reach(format!("Chain length ({chain_length}) reached"));
        }
        self.core.termination.is_reached()
    }

    fn save_state(&self) -> SxResult<Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn load_state(&mut self, state: Value) -> SxResult<()> {
        self.state = serde_json::from_value(state)?;
        self.candidates.clear();
        self.pending = None;
        Ok(())
    }

    fn summary(&self) -> Value {
        json!({
            "database_entries": self.database_entries(),
            "accepted": self.state.accepted,
            "acceptance_rate": self.state.acceptance_rate,
            "function_evaluations": self.state.function_evaluations,
            "leader": self.state.leader,
            "leader_log_posterior": self.state.leader_log_posterior,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sx_types::{SampleId, SxError};
    use uuid::Uuid;

    fn gaussian_config(chain_length: usize) -> McmcConfig {
        McmcConfig::new("gaussian", chain_length).with_variable(McmcVariable::new(
            "x",
            Prior::Uniform {
                minimum: -10.0,
                maximum: 10.0,
            },
            0.0,
            1.0,
        ))
    }

    /// Drive one generation without an engine, evaluating `-x^2 / 2`.
    fn run_generation(mcmc: &mut Mcmc, evaluations: &mut usize) {
        loop {
            let batch = mcmc.prepare_generation().unwrap();
            let results: Vec<Sample> = batch
                .into_iter()
                .map(|spec| {
                    *evaluations += 1;
                    let x = spec.parameters[0];
                    let mut sample = Sample::new(SampleId(*evaluations as u64), Uuid::nil(), spec);
                    sample.set_f64(LOG_LIKELIHOOD, -0.5 * x * x).unwrap();
                    sample
                })
                .collect();
            if mcmc.update_state(results).unwrap() == GenerationStep::Complete {
                break;
            }
        }
        mcmc.end_generation();
    }

    #[test]
    fn single_level_alpha_is_the_likelihood_ratio() {
        let (alpha, _) = recursive_alpha(-2.0, &[-1.0]);
        assert_eq!(alpha, 1.0);

        let (alpha, _) = recursive_alpha(-1.0, &[-2.0]);
        assert!((alpha - (-1.0f64).exp()).abs() < 1e-12);
    }

    #[test]
    fn second_level_alpha_matches_the_recursion() {
        // exp(-2) * (1 - exp(-1)) / (exp(-1) * (1 - exp(-2)))
        let expected = (-2.0f64).exp() * (1.0 - (-1.0f64).exp())
            / ((-1.0f64).exp() * (1.0 - (-2.0f64).exp()));
        let (alpha, _) = recursive_alpha(-1.0, &[-3.0, -2.0]);
        assert!((alpha - expected).abs() < 1e-12);
        assert!((alpha - 0.26894).abs() < 1e-5);
    }

    #[test]
    fn impossible_candidates_have_zero_acceptance() {
        let (alpha, _) = recursive_alpha(-1.0, &[f64::NEG_INFINITY]);
        assert_eq!(alpha, 0.0);
        let (alpha, _) = recursive_alpha(f64::NEG_INFINITY, &[f64::NEG_INFINITY]);
        assert_eq!(alpha, 0.0);
    }

    #[test]
    fn chain_terminates_exactly_at_chain_length() {
        let mut mcmc = Mcmc::new(gaussian_config(100).with_rejection_levels(2), 7).unwrap();
        let mut evaluations = 0;
        let mut generations = 0;
        while !mcmc.check_termination() {
            assert!(mcmc.database_entries() < 100);
            run_generation(&mut mcmc, &mut evaluations);
            generations += 1;
        }
        assert_eq!(mcmc.database_entries(), 100);
        assert_eq!(generations, 100);
        assert_eq!(mcmc.termination().reason(), Some("Chain length (100) reached"));
        assert!(mcmc.accepted() > 0);
        assert!(mcmc.acceptance_rate() <= 1.0);
    }

    #[test]
    fn burn_in_generations_are_not_recorded() {
        let mut mcmc = Mcmc::new(gaussian_config(10).with_burn_in(5), 1).unwrap();
        let mut evaluations = 0;
        while !mcmc.check_termination() {
            run_generation(&mut mcmc, &mut evaluations);
        }
        assert_eq!(mcmc.generation(), 15);
        assert_eq!(mcmc.database_entries(), 10);
    }

    #[test]
    fn evaluation_cap_ends_the_chain() {
        let config = gaussian_config(1_000).with_max_function_evaluations(12);
        let mut mcmc = Mcmc::new(config, 3).unwrap();
        let mut evaluations = 0;
        while !mcmc.check_termination() {
            run_generation(&mut mcmc, &mut evaluations);
        }
        assert_eq!(mcmc.function_evaluations(), 12);
        assert!(mcmc
            .termination()
            .reason()
            .unwrap()
            .starts_with("Max function evaluations"));
    }

    #[test]
    fn candidates_outside_the_prior_are_never_evaluated() {
        let config = McmcConfig::new("gaussian", 5)
            .with_rejection_levels(3)
            .with_variable(McmcVariable::new(
                "x",
                Prior::Uniform {
                    minimum: 100.0,
                    maximum: 101.0,
                },
                0.0,
                1.0,
            ));
        let mut mcmc = Mcmc::new(config, 11).unwrap();

        let batch = mcmc.prepare_generation().unwrap();
        assert!(batch.is_empty());
        assert_eq!(mcmc.function_evaluations(), 0);
        assert_eq!(mcmc.proposals_generated(), 3);
        assert_eq!(mcmc.update_state(Vec::new()).unwrap(), GenerationStep::Complete);
        assert_eq!(mcmc.leader(), &[0.0]);
    }

    #[test]
    fn log_space_variables_reach_the_model_exponentiated() {
        let config = McmcConfig::new("gaussian", 5).with_variable(
            McmcVariable::new(
                "sigma",
                Prior::Uniform {
                    minimum: -50.0,
                    maximum: 50.0,
                },
                0.0,
                0.0,
            )
            .in_log_space(),
        );
        let mut mcmc = Mcmc::new(config, 5).unwrap();
        let batch = mcmc.prepare_generation().unwrap();
        assert_eq!(batch[0].parameters, vec![1.0]);
    }

    #[test]
    fn adaptive_sampling_tracks_chain_statistics() {
        let config = gaussian_config(200).with_adaptive_sampling(true);
        let mut mcmc = Mcmc::new(config, 17).unwrap();
        let mut evaluations = 0;
        while !mcmc.check_termination() {
            run_generation(&mut mcmc, &mut evaluations);
        }
        let mean: f64 =
            mcmc.database().iter().map(|p| p[0]).sum::<f64>() / mcmc.database_entries() as f64;
        assert!((mcmc.chain_mean()[0] - mean).abs() < 1e-9);
        assert!(mcmc.chain_covariance()[(0, 0)] > 0.0);
    }

    #[test]
    fn chain_statistics_match_the_database() {
        let variable = |name: &str, sd: f64| {
            McmcVariable::new(
                name,
                Prior::Uniform {
                    minimum: -10.0,
                    maximum: 10.0,
                },
                0.0,
                sd,
            )
        };
        let mut config = McmcConfig::new("gaussian", 30)
            .with_variable(variable("x", 1.0))
            .with_variable(variable("y", 0.5))
            .with_adaptive_sampling(true);
        config.chain_covariance_scaling = Some(1.5);
        config.chain_covariance_increment = 0.01;

        let mut mcmc = Mcmc::new(config, 29).unwrap();
        let mut evaluations = 0;
        while !mcmc.check_termination() {
            run_generation(&mut mcmc, &mut evaluations);
        }

        let points: Vec<DVector<f64>> = mcmc
            .database()
            .iter()
            .map(|p| DVector::from_column_slice(p))
            .collect();
        let count = points.len() as f64;
        let mean = points
            .iter()
            .fold(DVector::zeros(2), |sum: DVector<f64>, p| sum + p)
            / count;
        let sample_covariance = points.iter().fold(DMatrix::zeros(2, 2), |sum: DMatrix<f64>, p| {
            let centred = p - &mean;
            sum + &centred * centred.transpose()
        }) / (count - 1.0);
        let expected = (sample_covariance + DMatrix::identity(2, 2) * 0.01) * 1.5;

        assert!((mcmc.chain_mean() - &mean).amax() < 1e-9);
        assert!((mcmc.chain_covariance() - &expected).amax() < 1e-9);
    }

    #[test]
    fn no_candidates_means_nothing_to_accept() {
        assert_eq!(recursive_alpha(-4.0, &[]), (0.0, -4.0));
    }

    #[test]
    fn restored_chain_continues_identically() {
        let mut original = Mcmc::new(gaussian_config(40).with_rejection_levels(2), 21).unwrap();
        let mut evaluations = 0;
        for _ in 0..10 {
            run_generation(&mut original, &mut evaluations);
        }

        let mut restored = Mcmc::new(gaussian_config(40).with_rejection_levels(2), 0).unwrap();
        restored
            .load_state(original.save_state().unwrap())
            .unwrap();
        restored.core_mut().generation = original.generation();

        let mut evaluations_restored = evaluations;
        while !original.check_termination() {
            assert!(!restored.check_termination());
            run_generation(&mut original, &mut evaluations);
            run_generation(&mut restored, &mut evaluations_restored);
        }
        assert!(restored.check_termination());
        assert_eq!(original.database(), restored.database());
        assert_eq!(original.leader_log_posterior(), restored.leader_log_posterior());
    }

    #[test]
    fn invalid_settings_are_rejected_before_sampling() {
        let err = Mcmc::new(gaussian_config(10).with_rejection_levels(0), 1)
            .err()
            .unwrap();
        assert!(err.to_string().contains("Rejection Levels"));

        let mut config = gaussian_config(10);
        config.chain_length = None;
        assert!(matches!(
            config.validate(),
            Err(SxError::Config(ConfigError::Missing { .. }))
        ));

        let mut config = gaussian_config(10);
        config.variables[0].standard_deviation = -1.0;
        assert!(config.validate().is_err());
    }
}
