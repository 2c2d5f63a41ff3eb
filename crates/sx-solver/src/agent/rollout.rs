//! Episode rollouts: the model callback that drives an environment loop on
//! its own execution context and asks for an action at every step.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

use sx_engine::{EnvironmentContext, ModelRegistry, SampleContext};
use sx_types::{EpisodeTermination, ProtocolViolation, SxResult};

use super::policy::Policy;

pub const MODE: &str = "Mode";
pub const POLICY_PLACEMENT: &str = "Policy Placement";
pub const POLICY_HYPERPARAMETERS: &str = "Policy Hyperparameters";
pub const ENVIRONMENT_COUNT: &str = "Environment Count";
pub const ENVIRONMENT_ID: &str = "Environment Id";
pub const ACTIONS_BETWEEN_POLICY_UPDATES: &str = "Actions Between Policy Updates";
pub const SEED: &str = "Seed";
pub const EPISODE: &str = "Episode";
pub const TRAINING_REWARD: &str = "Training Reward";
pub const TESTING_REWARD: &str = "Testing Reward";

pub const REQUEST_ACTION: &str = "Request Action";
pub const REQUEST_POLICY: &str = "Request Policy";

/// Environment body: sets "State", calls `update()` for each action, then
/// sets "Reward", "Termination" and the next "State".
pub type EnvironmentFn = Arc<dyn Fn(&mut EnvironmentContext<'_>) -> SxResult<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EpisodeMode {
    Training,
    Testing,
}

/// Where actions are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PolicyPlacement {
    /// A copy of the policy travels with the sample.
    #[default]
    Worker,
    /// Every action is requested from the solver through the engine.
    Solver,
}

/// One step of an episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    pub state: Vec<f64>,
    pub action: Vec<f64>,
    /// Distribution the action was drawn from.
    pub policy: Value,
    pub reward: f64,
    pub termination: EpisodeTermination,
    /// State reached when the episode was truncated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated_state: Option<Vec<f64>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ActionReply {
    action: Vec<f64>,
    policy: Value,
}

/// Register `environment` as an episode rollout named `name`.
pub fn register_rollout(
    registry: &ModelRegistry,
    name: impl Into<String>,
    environment: EnvironmentFn,
    prototype: Arc<dyn Policy>,
) {
    registry.register(name, move |ctx: &mut SampleContext<'_>| {
        run_episode(ctx, &environment, prototype.as_ref())
    });
}

#[derive(Default)]
struct Profile {
    policy_evaluation: f64,
    computation: f64,
    communication: f64,
}

enum ActionSource {
    Local {
        policy: Box<dyn Policy>,
        rng: ChaCha8Rng,
    },
    Solver,
}

impl ActionSource {
    fn choose(
        &mut self,
        ctx: &mut SampleContext<'_>,
        state: &[f64],
        mode: EpisodeMode,
    ) -> SxResult<(Vec<f64>, Value)> {
        let training = mode == EpisodeMode::Training;
        match self {
            ActionSource::Local { policy, rng } => policy.get_action(state, training, rng),
            ActionSource::Solver => {
                let reply = ctx.request(json!({
                    "Type": REQUEST_ACTION,
                    "State": state,
                    "Mode": mode,
                }))?;
                let reply: ActionReply = serde_json::from_value(reply)?;
                Ok((reply.action, reply.policy))
            }
        }
    }
}

fn termination_of(ctx: &SampleContext<'_>) -> SxResult<EpisodeTermination> {
    let value: String = ctx.get("Termination")?;
    match value.as_str() {
        "Non Terminal" => Ok(EpisodeTermination::NonTerminal),
        other => EpisodeTermination::parse_final(ctx.id(), other),
    }
}

fn run_episode(
    ctx: &mut SampleContext<'_>,
    environment: &EnvironmentFn,
    prototype: &dyn Policy,
) -> SxResult<()> {
    let mode: EpisodeMode = ctx.get(MODE)?;
    let placement: PolicyPlacement = ctx.get(POLICY_PLACEMENT)?;
    let environment_count: usize = ctx.get(ENVIRONMENT_COUNT)?;
    let update_every: usize = if ctx.has(ACTIONS_BETWEEN_POLICY_UPDATES) {
        ctx.get(ACTIONS_BETWEEN_POLICY_UPDATES)?
    } else {
        0
    };

    let mut source = match placement {
        PolicyPlacement::Worker => {
            let mut policy = prototype.box_clone();
            policy.set_policy(&ctx.get::<Value>(POLICY_HYPERPARAMETERS)?)?;
            let seed: u64 = ctx.get(SEED)?;
            ActionSource::Local {
                policy,
                rng: ChaCha8Rng::seed_from_u64(seed),
            }
        }
        PolicyPlacement::Solver => ActionSource::Solver,
    };

    ctx.set("Termination", EpisodeTermination::NonTerminal.as_str())?;
    ctx.set(ENVIRONMENT_ID, 0usize)?;
    ctx.set_f64("Reward", 0.0)?;

    let body = Arc::clone(environment);
    let mut env = ctx.spawn_environment(move |e| body(e))?;
    let mut profile = Profile::default();

    let started = Instant::now();
    let mut awaiting_action = env.advance()?;
    profile.computation += started.elapsed().as_secs_f64();

    // Only the leader of a worker group reports the episode.
    if !ctx.is_leader() {
        return Ok(());
    }

    let environment_id: usize = ctx.get(ENVIRONMENT_ID)?;
    if environment_id >= environment_count {
        return Err(ProtocolViolation::EnvironmentOutOfRange {
            sample_id: ctx.id(),
            environment_id,
            environment_count,
        }
        .into());
    }

    let mut termination = termination_of(ctx)?;
    let mut experiences: Vec<Experience> = Vec::new();
    let mut cumulative_reward = 0.0;

    while awaiting_action && termination == EpisodeTermination::NonTerminal {
        let state = ctx.get_vector("State", None)?;

        let started = Instant::now();
        let (action, policy) = source.choose(ctx, &state, mode)?;
        profile.policy_evaluation += started.elapsed().as_secs_f64();
        ctx.set_vector("Action", &action)?;

        let started = Instant::now();
        awaiting_action = env.advance()?;
        profile.computation += started.elapsed().as_secs_f64();

        let reward = ctx.get_f64("Reward")?;
        termination = termination_of(ctx)?;
        let truncated_state = match termination {
            EpisodeTermination::Truncated => Some(ctx.get_vector("State", None)?),
            _ => None,
        };
        trace!(sample_id = %ctx.id(), step = experiences.len(), reward, ?termination, "episode step");

        cumulative_reward += reward;
        experiences.push(Experience {
            state,
            action,
            policy,
            reward,
            termination,
            truncated_state,
        });

        if let ActionSource::Local { policy, .. } = &mut source {
            let due = update_every > 0 && experiences.len() % update_every == 0;
            if due && termination == EpisodeTermination::NonTerminal {
                let started = Instant::now();
                let hyperparameters = ctx.request(json!({ "Type": REQUEST_POLICY }))?;
                policy.set_policy(&hyperparameters)?;
                ctx.set(POLICY_HYPERPARAMETERS, hyperparameters)?;
                profile.communication += started.elapsed().as_secs_f64();
            }
        }
    }

    // The environment returned (or ended the episode) without a final status.
    if termination == EpisodeTermination::NonTerminal {
        EpisodeTermination::parse_final(ctx.id(), termination.as_str())?;
    }
    drop(env);

    debug!(
        sample_id = %ctx.id(),
        steps = experiences.len(),
        cumulative_reward,
        ?mode,
        "episode finished"
    );

    match mode {
        EpisodeMode::Training => {
            ctx.set(EPISODE, &experiences)?;
            ctx.set_f64(TRAINING_REWARD, cumulative_reward)?;
        }
        EpisodeMode::Testing => ctx.set_f64(TESTING_REWARD, cumulative_reward)?,
    }
    ctx.set_f64("Policy Evaluation Time", profile.policy_evaluation)?;
    ctx.set_f64("Computation Time", profile.computation)?;
    ctx.set_f64("Communication Time", profile.communication)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::policy::LinearGaussianPolicy;
    use std::time::Duration;
    use sx_engine::{Engine, LocalConduit};
    use sx_types::{ConduitConfig, ModelError, Sample, SampleSpec, SxError};
    use uuid::Uuid;

    /// Walk from 0 by the chosen action; terminal after `steps` actions.
    fn walker(steps: usize, final_status: &'static str) -> EnvironmentFn {
        Arc::new(move |env: &mut EnvironmentContext<'_>| {
            let mut position = 0.0;
            env.set_state(&[position])?;
            for step in 1..=steps {
                let action = env.update()?;
                position += action[0];
                env.set_reward(-position.abs())?;
                env.set_state(&[position])?;
                if step == steps {
                    env.set_termination(final_status)?;
                }
            }
            Ok(())
        })
    }

    fn engine_with(environment: EnvironmentFn, workers: usize, per_sample: usize) -> Engine {
        let registry = ModelRegistry::new();
        let prototype: Arc<dyn Policy> = Arc::new(LinearGaussianPolicy::new(1, 1, 0.1));
        register_rollout(&registry, "walker", environment, prototype);
        let config = ConduitConfig::local(workers).with_workers_per_sample(per_sample);
        let conduit = LocalConduit::start(&config, Arc::clone(&registry)).unwrap();
        Engine::new(Uuid::new_v4(), registry, Box::new(conduit), Duration::from_millis(5))
    }

    fn episode_spec(mode: EpisodeMode, placement: PolicyPlacement) -> SampleSpec {
        SampleSpec::new("walker", vec![])
            .with_field(MODE, json!(mode))
            .with_field(POLICY_PLACEMENT, json!(placement))
            .with_field(
                POLICY_HYPERPARAMETERS,
                LinearGaussianPolicy::new(1, 1, 0.1).get_policy(),
            )
            .with_field(ENVIRONMENT_COUNT, json!(1))
            .with_field(SEED, json!(3))
    }

    fn episode(sample: &Sample) -> Vec<Experience> {
        sample.get(EPISODE).unwrap()
    }

    #[test]
    fn each_suspension_yields_one_experience() {
        for k in [1usize, 4, 9] {
            let mut engine = engine_with(walker(k, "Terminal"), 1, 1);
            let sample = engine
                .evaluate(episode_spec(EpisodeMode::Training, PolicyPlacement::Worker))
                .unwrap();
            let experiences = episode(&sample);
            assert_eq!(experiences.len(), k);
            assert_eq!(
                experiences.last().unwrap().termination,
                EpisodeTermination::Terminal
            );
            assert!(experiences[..k - 1]
                .iter()
                .all(|e| e.termination == EpisodeTermination::NonTerminal));
            assert_eq!(sample.launch_count, 1);
        }
    }

    #[test]
    fn truncated_episodes_keep_their_last_state() {
        let mut engine = engine_with(walker(3, "Truncated"), 1, 1);
        let sample = engine
            .evaluate(episode_spec(EpisodeMode::Training, PolicyPlacement::Worker))
            .unwrap();
        let last = episode(&sample).pop().unwrap();
        assert_eq!(last.termination, EpisodeTermination::Truncated);
        assert!(last.truncated_state.is_some());
    }

    #[test]
    fn unknown_final_status_is_a_protocol_violation() {
        let mut engine = engine_with(walker(2, "Success"), 1, 1);
        let err = engine
            .evaluate(episode_spec(EpisodeMode::Training, PolicyPlacement::Worker))
            .unwrap_err();
        assert!(matches!(
            err,
            SxError::Protocol(ProtocolViolation::InvalidTermination { .. })
        ));
    }

    #[test]
    fn returning_without_a_final_status_is_a_protocol_violation() {
        let mut engine = engine_with(walker(2, "Non Terminal"), 1, 1);
        let err = engine
            .evaluate(episode_spec(EpisodeMode::Training, PolicyPlacement::Worker))
            .unwrap_err();
        assert!(matches!(
            err,
            SxError::Protocol(ProtocolViolation::InvalidTermination { .. })
        ));
    }

    #[test]
    fn environment_id_is_bounded_by_the_environment_count() {
        let environment: EnvironmentFn = Arc::new(|env: &mut EnvironmentContext<'_>| {
            env.set(ENVIRONMENT_ID, 4usize)?;
            env.set_state(&[0.0])?;
            env.update()?;
            env.set_termination("Terminal")?;
            Ok(())
        });
        let mut engine = engine_with(environment, 1, 1);
        let err = engine
            .evaluate(episode_spec(EpisodeMode::Training, PolicyPlacement::Worker))
            .unwrap_err();
        assert!(matches!(
            err,
            SxError::Protocol(ProtocolViolation::EnvironmentOutOfRange {
                environment_id: 4,
                environment_count: 1,
                ..
            })
        ));
    }

    #[test]
    fn solver_placement_requests_every_action() {
        let mut engine = engine_with(walker(5, "Terminal"), 1, 1);
        let mut requests = 0;
        let results = engine
            .submit_and_wait(
                vec![episode_spec(EpisodeMode::Testing, PolicyPlacement::Solver)],
                |message| {
                    assert_eq!(message.payload["Type"], REQUEST_ACTION);
                    requests += 1;
                    Ok(Some(json!({ "Action": [1.0], "Policy": { "Mean": [1.0] } })))
                },
            )
            .unwrap();
        assert_eq!(requests, 5);
        // Walking +1 five times: rewards -1..-5.
        assert_eq!(results[0].get_f64(TESTING_REWARD).unwrap(), -15.0);
        assert!(!results[0].has(EPISODE));
    }

    #[test]
    fn worker_placement_refreshes_the_policy_periodically() {
        let mut engine = engine_with(walker(7, "Terminal"), 1, 1);
        let spec = episode_spec(EpisodeMode::Training, PolicyPlacement::Worker)
            .with_field(ACTIONS_BETWEEN_POLICY_UPDATES, json!(3));
        let mut refreshes = 0;
        engine
            .submit_and_wait(vec![spec], |message| {
                assert_eq!(message.payload["Type"], REQUEST_POLICY);
                refreshes += 1;
                Ok(Some(LinearGaussianPolicy::new(1, 1, 0.2).get_policy()))
            })
            .unwrap();
        // After actions 3 and 6; never after the terminal seventh.
        assert_eq!(refreshes, 2);
    }

    #[test]
    fn non_finite_rewards_fail_the_episode() {
        let environment: EnvironmentFn = Arc::new(|env: &mut EnvironmentContext<'_>| {
            env.set_state(&[0.0])?;
            env.update()?;
            env.set_reward(f64::NAN)?;
            Ok(())
        });
        let mut engine = engine_with(environment, 1, 1);
        let err = engine
            .evaluate(episode_spec(EpisodeMode::Training, PolicyPlacement::Worker))
            .unwrap_err();
        assert!(matches!(err, SxError::Model(ModelError::NonFinite { .. })));
    }

    #[test]
    fn only_the_group_leader_reports_an_episode() {
        let mut engine = engine_with(walker(3, "Terminal"), 2, 2);
        let sample = engine
            .evaluate(episode_spec(EpisodeMode::Training, PolicyPlacement::Worker))
            .unwrap();
        assert_eq!(episode(&sample).len(), 3);
        assert_eq!(engine.stats().completed, 1);
    }
}
