//! Policy collaborators. The engine and the rollout only see their
//! hyperparameters and per-action blobs as opaque JSON.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use sx_types::{config_error, SxResult};

/// Maps states to actions.
pub trait Policy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick an action for `state`. Training mode explores; testing mode acts
    /// greedily. Returns the action plus the blob describing the
    /// distribution it was drawn from.
    fn get_action(&self, state: &[f64], training: bool, rng: &mut ChaCha8Rng) -> SxResult<(Vec<f64>, Value)>;

    /// Replace the hyperparameters with a blob from `get_policy`.
    fn set_policy(&mut self, hyperparameters: &Value) -> SxResult<()>;

    fn get_policy(&self) -> Value;

    fn parameters(&self) -> &[f64];

    fn set_parameters(&mut self, parameters: Vec<f64>);

    /// Gradient of `log pi(action | state)` with respect to `parameters()`.
    fn log_prob_gradient(&self, state: &[f64], action: &[f64]) -> Vec<f64>;

    fn box_clone(&self) -> Box<dyn Policy>;
}

impl Clone for Box<dyn Policy> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Gaussian policy whose mean is affine in the state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearGaussianPolicy {
    state_size: usize,
    action_size: usize,
    /// Row-major `action_size x (state_size + 1)`; the last column is a bias.
    weights: Vec<f64>,
    sigma: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LinearHyperparameters {
    weights: Vec<f64>,
    sigma: f64,
}

impl LinearGaussianPolicy {
    pub fn new(state_size: usize, action_size: usize, sigma: f64) -> Self {
        Self {
            state_size,
            action_size,
            weights: vec![0.0; action_size * (state_size + 1)],
            sigma,
        }
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn mean(&self, state: &[f64]) -> SxResult<Vec<f64>> {
        if state.len() != self.state_size {
            return Err(config_error!(
                "Agent",
                "State Vector Size",
                "policy expects {} state entries, got {}",
                self.state_size,
                state.len()
            ));
        }
        let row = self.state_size + 1;
        Ok((0..self.action_size)
            .map(|a| {
                let w = &self.weights[a * row..(a + 1) * row];
                w[..self.state_size]
                    .iter()
                    .zip(state)
                    .map(|(w, s)| w * s)
                    .sum::<f64>()
                    + w[self.state_size]
            })
            .collect())
    }
}

impl Policy for LinearGaussianPolicy {
    fn name(&self) -> &'static str {
        "Linear Gaussian"
    }

    fn get_action(&self, state: &[f64], training: bool, rng: &mut ChaCha8Rng) -> SxResult<(Vec<f64>, Value)> {
        let mean = self.mean(state)?;
        let action = if training {
            mean.iter()
                .map(|m| {
                    let z: f64 = rng.sample(StandardNormal);
                    m + self.sigma * z
                })
                .collect()
        } else {
            mean.clone()
        };
        Ok((action, json!({ "Mean": mean, "Sigma": self.sigma })))
    }

    fn set_policy(&mut self, hyperparameters: &Value) -> SxResult<()> {
        let parsed: LinearHyperparameters = serde_json::from_value(hyperparameters.clone())?;
        if parsed.weights.len() != self.weights.len() {
            return Err(config_error!(
                "Agent",
                "Policy Hyperparameters",
                "expected {} weights, got {}",
                self.weights.len(),
                parsed.weights.len()
            ));
        }
        self.weights = parsed.weights;
        self.sigma = parsed.sigma;
        Ok(())
    }

    fn get_policy(&self) -> Value {
        json!({ "Weights": self.weights, "Sigma": self.sigma })
    }

    fn parameters(&self) -> &[f64] {
        &self.weights
    }

    fn set_parameters(&mut self, parameters: Vec<f64>) {
        self.weights = parameters;
    }

    fn log_prob_gradient(&self, state: &[f64], action: &[f64]) -> Vec<f64> {
        let row = self.state_size + 1;
        let mut gradient = vec![0.0; self.weights.len()];
        let Ok(mean) = self.mean(state) else {
            return gradient;
        };
        let variance = self.sigma * self.sigma;
        for (a, (m, x)) in mean.iter().zip(action).enumerate() {
            let scale = (x - m) / variance;
            for (i, s) in state.iter().enumerate() {
                gradient[a * row + i] = scale * s;
            }
            gradient[a * row + self.state_size] = scale;
        }
        gradient
    }

    fn box_clone(&self) -> Box<dyn Policy> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn testing_mode_acts_on_the_mean() {
        let mut policy = LinearGaussianPolicy::new(2, 1, 0.5);
        policy
            .set_policy(&json!({ "Weights": [1.0, 2.0, 0.5], "Sigma": 0.5 }))
            .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        let (action, blob) = policy.get_action(&[1.0, 1.0], false, &mut rng).unwrap();
        assert_eq!(action, vec![3.5]);
        assert_eq!(blob["Mean"], json!([3.5]));

        let (explored, _) = policy.get_action(&[1.0, 1.0], true, &mut rng).unwrap();
        assert_ne!(explored, action);
    }

    #[test]
    fn hyperparameters_round_trip_through_blobs() {
        let mut source = LinearGaussianPolicy::new(1, 2, 0.3);
        source.set_parameters(vec![0.1, 0.2, 0.3, 0.4]);
        let mut target = LinearGaussianPolicy::new(1, 2, 1.0);
        target.set_policy(&source.get_policy()).unwrap();
        assert_eq!(source, target);

        let wrong = json!({ "Weights": [1.0], "Sigma": 1.0 });
        assert!(target.set_policy(&wrong).is_err());
    }

    #[test]
    fn gradient_points_towards_the_taken_action() {
        let policy = LinearGaussianPolicy::new(1, 1, 1.0);
        let gradient = policy.log_prob_gradient(&[2.0], &[1.0]);
        assert_eq!(gradient, vec![2.0, 1.0]);
    }

    #[test]
    fn wrong_state_size_is_reported() {
        let policy = LinearGaussianPolicy::new(3, 1, 1.0);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(policy.get_action(&[1.0], true, &mut rng).is_err());
    }
}
