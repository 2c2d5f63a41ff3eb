//! Reinforcement-learning agent: every episode is one sample running a
//! rollout, harvested into a replay memory that trains the policy.

pub mod learner;
pub mod policy;
pub mod rollout;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use tracing::{debug, info};

use sx_types::{config_error, ConfigError, Message, ModelError, ProtocolViolation, Sample, SampleSpec, SxResult};

use crate::solver::{GenerationLoop, GenerationStep, SolverCore};

pub use learner::{Learner, ReinforceLearner, ReplayEntry, ReplayMemory};
pub use policy::{LinearGaussianPolicy, Policy};
pub use rollout::{register_rollout, EnvironmentFn, EpisodeMode, Experience, PolicyPlacement};

const COMPONENT: &str = "Agent";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Registered rollout model.
    pub environment_model: String,
    pub state_vector_size: usize,
    pub action_vector_size: usize,
    pub environment_count: usize,
    pub policy_placement: PolicyPlacement,
    pub episodes_per_generation: usize,
    /// 0 disables periodic policy refreshes within an episode.
    pub actions_between_policy_updates: usize,
    pub testing_episodes: usize,
    /// Run the testing episodes every this many generations.
    pub testing_frequency: usize,
    pub discount_factor: f64,
    /// Initial exploration noise of the policy.
    pub exploration_sigma: f64,
    pub replay_start_size: usize,
    pub replay_maximum_size: usize,
    pub mini_batch_size: usize,
    pub mini_batches_per_generation: usize,
    pub learning_rate: f64,
    pub max_generations: Option<usize>,
    pub max_episodes: Option<usize>,
    /// Stop once the average training reward over `average_window` episodes
    /// reaches this value.
    pub target_average_reward: Option<f64>,
    pub average_window: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            environment_model: String::new(),
            state_vector_size: 0,
            action_vector_size: 0,
            environment_count: 1,
            policy_placement: PolicyPlacement::Worker,
            episodes_per_generation: 1,
            actions_between_policy_updates: 0,
            testing_episodes: 0,
            testing_frequency: 10,
            discount_factor: 0.99,
            exploration_sigma: 0.5,
            replay_start_size: 32,
            replay_maximum_size: 100_000,
            mini_batch_size: 32,
            mini_batches_per_generation: 1,
            learning_rate: 1e-3,
            max_generations: None,
            max_episodes: None,
            target_average_reward: None,
            average_window: 10,
        }
    }
}

impl AgentConfig {
    pub fn new(environment_model: impl Into<String>, state_size: usize, action_size: usize) -> Self {
        Self {
            environment_model: environment_model.into(),
            state_vector_size: state_size,
            action_vector_size: action_size,
            ..Self::default()
        }
    }

    pub fn with_policy_placement(mut self, placement: PolicyPlacement) -> Self {
        self.policy_placement = placement;
        self
    }

    pub fn with_episodes_per_generation(mut self, episodes: usize) -> Self {
        self.episodes_per_generation = episodes;
        self
    }

    pub fn with_testing(mut self, episodes: usize, frequency: usize) -> Self {
        self.testing_episodes = episodes;
        self.testing_frequency = frequency;
        self
    }

    pub fn with_replay(mut self, start: usize, maximum: usize, mini_batch: usize) -> Self {
        self.replay_start_size = start;
        self.replay_maximum_size = maximum;
        self.mini_batch_size = mini_batch;
        self
    }

    pub fn with_max_generations(mut self, n: usize) -> Self {
        self.max_generations = Some(n);
        self
    }

    pub fn with_max_episodes(mut self, n: usize) -> Self {
        self.max_episodes = Some(n);
        self
    }

    pub fn with_target_average_reward(mut self, target: f64, window: usize) -> Self {
        self.target_average_reward = Some(target);
        self.average_window = window;
        self
    }

    pub fn validate(&self) -> SxResult<()> {
        if self.environment_model.is_empty() {
            return Err(ConfigError::Missing {
                component: COMPONENT.to_string(),
                setting: "Environment Model".to_string(),
            }
            .into());
        }
        let positive = [
            ("State Vector Size", self.state_vector_size),
            ("Action Vector Size", self.action_vector_size),
            ("Environment Count", self.environment_count),
            ("Episodes Per Generation", self.episodes_per_generation),
            ("Testing Frequency", self.testing_frequency),
            ("Replay Maximum Size", self.replay_maximum_size),
            ("Mini Batch Size", self.mini_batch_size),
            ("Average Window", self.average_window),
        ];
        for (setting, value) in positive {
            if value == 0 {
                return Err(config_error!(COMPONENT, setting, "must be at least one"));
            }
        }
        if self.replay_start_size > self.replay_maximum_size {
            return Err(config_error!(
                COMPONENT,
                "Replay Start Size",
                "{} exceeds the replay maximum size {}",
                self.replay_start_size,
                self.replay_maximum_size
            ));
        }
        if !(0.0..=1.0).contains(&self.discount_factor) {
            return Err(config_error!(
                COMPONENT,
                "Discount Factor",
                "must lie in [0, 1] (is {})",
                self.discount_factor
            ));
        }
        if !(self.exploration_sigma > 0.0) {
            return Err(config_error!(
                COMPONENT,
                "Exploration Sigma",
                "must be positive (is {})",
                self.exploration_sigma
            ));
        }
        if !(self.learning_rate > 0.0) {
            return Err(config_error!(
                COMPONENT,
                "Learning Rate",
                "must be positive (is {})",
                self.learning_rate
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Training,
    Testing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AgentState {
    rng: ChaCha8Rng,
    policy: Value,
    replay: ReplayMemory,
    training_rewards: VecDeque<f64>,
    episodes_completed: usize,
    experiences_collected: usize,
    policy_updates: usize,
    last_testing_reward: Option<f64>,
}

pub struct Agent {
    config: AgentConfig,
    core: SolverCore,
    policy: Box<dyn Policy>,
    learner: Box<dyn Learner>,
    rng: ChaCha8Rng,
    replay: ReplayMemory,
    training_rewards: VecDeque<f64>,
    episodes_completed: usize,
    experiences_collected: usize,
    policy_updates: usize,
    last_testing_reward: Option<f64>,
    phase: Phase,
}

impl Agent {
    pub fn new(config: AgentConfig, seed: u64) -> SxResult<Self> {
        let policy = LinearGaussianPolicy::new(
            config.state_vector_size,
            config.action_vector_size,
            config.exploration_sigma,
        );
        let learner = ReinforceLearner::new(config.learning_rate);
        Self::with_collaborators(config, seed, Box::new(policy), Box::new(learner))
    }

    pub fn with_collaborators(
        config: AgentConfig,
        seed: u64,
        policy: Box<dyn Policy>,
        learner: Box<dyn Learner>,
    ) -> SxResult<Self> {
        config.validate()?;
        info!(
            policy = policy.name(),
            learner = learner.name(),
            placement = ?config.policy_placement,
            "agent created"
        );
        Ok(Self {
            replay: ReplayMemory::new(config.replay_maximum_size),
            config,
            core: SolverCore::new(),
            policy,
            learner,
            rng: ChaCha8Rng::seed_from_u64(seed),
            training_rewards: VecDeque::new(),
            episodes_completed: 0,
            experiences_collected: 0,
            policy_updates: 0,
            last_testing_reward: None,
            phase: Phase::Training,
        })
    }

    pub fn policy(&self) -> &dyn Policy {
        self.policy.as_ref()
    }

    pub fn episodes_completed(&self) -> usize {
        self.episodes_completed
    }

    pub fn replay_size(&self) -> usize {
        self.replay.len()
    }

    pub fn policy_updates(&self) -> usize {
        self.policy_updates
    }

    pub fn last_testing_reward(&self) -> Option<f64> {
        self.last_testing_reward
    }

    /// Mean training reward over the last `average_window` episodes.
    pub fn average_training_reward(&self) -> Option<f64> {
        if self.training_rewards.is_empty() {
            return None;
        }
        Some(self.training_rewards.iter().sum::<f64>() / self.training_rewards.len() as f64)
    }

    fn episode_spec(&mut self, mode: EpisodeMode) -> SampleSpec {
        SampleSpec::new(self.config.environment_model.clone(), Vec::new())
            .with_field(rollout::MODE, json!(mode))
            .with_field(rollout::POLICY_PLACEMENT, json!(self.config.policy_placement))
            .with_field(rollout::POLICY_HYPERPARAMETERS, self.policy.get_policy())
            .with_field(rollout::ENVIRONMENT_COUNT, json!(self.config.environment_count))
            .with_field(
                rollout::ACTIONS_BETWEEN_POLICY_UPDATES,
                json!(self.config.actions_between_policy_updates),
            )
            .with_field(rollout::SEED, json!(self.rng.gen::<u64>()))
    }

    fn testing_due(&self) -> bool {
        self.config.testing_episodes > 0
            && (self.core.generation + 1) % self.config.testing_frequency == 0
    }

    fn harvest(&mut self, sample: &Sample) -> SxResult<()> {
        let episode: Vec<Experience> = sample.get(rollout::EPISODE)?;
        for experience in &episode {
            check_arity(sample, "State", self.config.state_vector_size, experience.state.len())?;
            check_arity(sample, "Action", self.config.action_vector_size, experience.action.len())?;
        }
        let reward = sample.get_f64(rollout::TRAINING_REWARD)?;

        self.experiences_collected += episode.len();
        self.replay.push_episode(episode, self.config.discount_factor);
        self.episodes_completed += 1;
        self.training_rewards.push_back(reward);
        if self.training_rewards.len() > self.config.average_window {
            self.training_rewards.pop_front();
        }
        Ok(())
    }

    fn train(&mut self) {
        if self.replay.len() < self.config.replay_start_size.max(1) {
            return;
        }
        for _ in 0..self.config.mini_batches_per_generation {
            let batch = self.replay.mini_batch(self.config.mini_batch_size, &mut self.rng);
            let norm = self.learner.train(self.policy.as_mut(), &batch);
            self.policy_updates += 1;
            debug!(update = self.policy_updates, norm, "policy updated");
        }
    }

    fn snapshot(&self) -> AgentState {
        AgentState {
            rng: self.rng.clone(),
            policy: self.policy.get_policy(),
            replay: self.replay.clone(),
            training_rewards: self.training_rewards.clone(),
            episodes_completed: self.episodes_completed,
            experiences_collected: self.experiences_collected,
            policy_updates: self.policy_updates,
            last_testing_reward: self.last_testing_reward,
        }
    }
}

fn check_arity(sample: &Sample, field: &str, expected: usize, actual: usize) -> SxResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(ModelError::Arity {
            sample_id: sample.id,
            field: field.to_string(),
            expected,
            actual,
        }
        .into())
    }
}

#[derive(Deserialize)]
struct ActionRequest {
    #[serde(rename = "State")]
    state: Vec<f64>,
    #[serde(rename = "Mode")]
    mode: EpisodeMode,
}

impl GenerationLoop for Agent {
    fn name(&self) -> &'static str {
        "Agent"
    }

    fn core(&self) -> &SolverCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SolverCore {
        &mut self.core
    }

    fn prepare_generation(&mut self) -> SxResult<Vec<SampleSpec>> {
        let (mode, count) = match self.phase {
            Phase::Training => (EpisodeMode::Training, self.config.episodes_per_generation),
            Phase::Testing => (EpisodeMode::Testing, self.config.testing_episodes),
        };
        Ok((0..count).map(|_| self.episode_spec(mode)).collect())
    }

    fn on_message(&mut self, message: &Message) -> SxResult<Option<Value>> {
        let kind = message.payload.get("Type").and_then(Value::as_str);
        match kind {
            Some(rollout::REQUEST_ACTION) => {
                let request: ActionRequest = serde_json::from_value(message.payload.clone())?;
                let training = request.mode == EpisodeMode::Training;
                let (action, policy) = self.policy.get_action(&request.state, training, &mut self.rng)?;
                Ok(Some(json!({ "Action": action, "Policy": policy })))
            }
            Some(rollout::REQUEST_POLICY) => Ok(Some(self.policy.get_policy())),
            _ => Err(ProtocolViolation::UnexpectedMessage {
                sample_id: message.sample_id,
                message: message.payload.to_string(),
            }
            .into()),
        }
    }

    fn update_state(&mut self, results: Vec<Sample>) -> SxResult<GenerationStep> {
        match self.phase {
            Phase::Training => {
                for sample in &results {
                    self.harvest(sample)?;
                }
                self.train();
                if self.testing_due() {
                    self.phase = Phase::Testing;
                    return Ok(GenerationStep::Continue);
                }
            }
            Phase::Testing => {
                let rewards = results
                    .iter()
                    .map(|s| s.get_f64(rollout::TESTING_REWARD))
                    .collect::<SxResult<Vec<f64>>>()?;
                let average = rewards.iter().sum::<f64>() / rewards.len().max(1) as f64;
                info!(episodes = rewards.len(), average, "testing episodes finished");
                self.last_testing_reward = Some(average);
                self.phase = Phase::Training;
            }
        }
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
        if let Some(max) = self.config.max_episodes {
            if self.episodes_completed >= max {
                self.core
                    .termination
                    .reach(format!("Max episodes ({max}) reached"));
            }
        }
        if let Some(target) = self.config.target_average_reward {
            let window_full = self.training_rewards.len() >= self.config.average_window;
            if let Some(average) = self.average_training_reward().filter(|_| window_full) {
                if average >= target {
                    self.core.termination.reach(format!(
                        "Average training reward {average} reached target {target}"
                    ));
                }
            }
        }
        self.core.termination.is_reached()
    }

    fn save_state(&self) -> SxResult<Value> {
        Ok(serde_json::to_value(self.snapshot())?)
    }

    fn load_state(&mut self, state: Value) -> SxResult<()> {
        let state: AgentState = serde_json::from_value(state)?;
        self.policy.set_policy(&state.policy)?;
        self.rng = state.rng;
        self.replay = state.replay;
        self.training_rewards = state.training_rewards;
        self.episodes_completed = state.episodes_completed;
        self.experiences_collected = state.experiences_collected;
        self.policy_updates = state.policy_updates;
        self.last_testing_reward = state.last_testing_reward;
        self.phase = Phase::Training;
        Ok(())
    }

    fn summary(&self) -> Value {
        json!({
            "episodes": self.episodes_completed,
            "experiences": self.experiences_collected,
            "replay_size": self.replay.len(),
            "policy_updates": self.policy_updates,
            "average_training_reward": self.average_training_reward(),
            "last_testing_reward": self.last_testing_reward,
        })
    }
}
