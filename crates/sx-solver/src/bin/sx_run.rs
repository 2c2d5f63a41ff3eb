use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sx_engine::{EnvironmentContext, ModelRegistry, SampleContext};
use sx_solver::agent::EnvironmentFn;
use sx_solver::mcmc::McmcVariable;
use sx_solver::{
    register_rollout, Experiment, ExperimentConfig, LinearGaussianPolicy, McmcConfig, Prior,
    SolverConfig, LOG_LIKELIHOOD, OBJECTIVE,
};

const WALKER_STEPS: usize = 20;

/// Built-in models so a configuration file can name them.
fn demo_registry() -> Arc<ModelRegistry> {
    let registry = ModelRegistry::new();

    registry.register("gaussian", |ctx: &mut SampleContext<'_>| {
        let log_likelihood: f64 = ctx
            .parameters()
            .iter()
            .map(|x| -0.5 * (x - 1.0) * (x - 1.0))
            .sum();
        ctx.set_f64(LOG_LIKELIHOOD, log_likelihood)
    });

    registry.register("sphere", |ctx: &mut SampleContext<'_>| {
        let value: f64 = ctx.parameters().iter().map(|x| x * x).sum();
        ctx.set_f64(OBJECTIVE, value)
    });

    // Reach position 1.0 from the origin; reward is minus the distance.
    let walker: EnvironmentFn = Arc::new(|env: &mut EnvironmentContext<'_>| {
        let mut position = 0.0;
        env.set_state(&[position])?;
        for step in 1..=WALKER_STEPS {
            let action = env.update()?;
            position += action[0].clamp(-0.5, 0.5);
            env.set_reward(-(position - 1.0).abs())?;
            env.set_state(&[position])?;
            if step == WALKER_STEPS {
                env.set_termination("Truncated")?;
            }
        }
        Ok(())
    });
    register_rollout(
        &registry,
        "walker",
        walker,
        Arc::new(LinearGaussianPolicy::new(1, 1, 0.5)),
    );

    registry
}

fn demo_config() -> ExperimentConfig {
    let mcmc = McmcConfig::new("gaussian", 2000)
        .with_burn_in(200)
        .with_rejection_levels(2)
        .with_adaptive_sampling(true)
        .with_variable(McmcVariable::new(
            "x",
            Prior::Normal {
                mean: 0.0,
                standard_deviation: 5.0,
            },
            0.0,
            1.0,
        ));
    ExperimentConfig::new("demo-posterior", SolverConfig::Mcmc(mcmc)).with_seed(1)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut resume = false;
    let mut path = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--resume" => resume = true,
            _ => path = Some(arg),
        }
    }
    let path = path.or_else(|| std::env::var("SAMPLEX_CONFIG").ok());

    let config = match &path {
        Some(path) => ExperimentConfig::from_path(path)
            .with_context(|| format!("loading experiment configuration {path}"))?,
        None => {
            info!("no configuration given, running the built-in demo");
            demo_config()
        }
    };

    let registry = demo_registry();
    let mut experiment = if resume {
        Experiment::resume_latest(config, registry).context("resuming from checkpoint")?
    } else {
        Experiment::new(config, registry).context("starting experiment")?
    };

    let summary = experiment.run().context("running experiment")?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
