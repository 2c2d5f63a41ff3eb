//! Replay memory and the learners that train a policy from it.

use rand::seq::index::sample as sample_indices;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::policy::Policy;
use super::rollout::Experience;

/// One experience together with its discounted return-to-go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayEntry {
    pub experience: Experience,
    pub return_to_go: f64,
}

/// Bounded FIFO of experiences; the oldest are dropped first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayMemory {
    entries: VecDeque<ReplayEntry>,
    capacity: usize,
}

impl ReplayMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a finished episode, computing discounted returns backwards.
    pub fn push_episode(&mut self, episode: Vec<Experience>, discount: f64) {
        let mut returns = vec![0.0; episode.len()];
        let mut running = 0.0;
        for (i, e) in episode.iter().enumerate().rev() {
            running = e.reward + discount * running;
            returns[i] = running;
        }
        for (experience, return_to_go) in episode.into_iter().zip(returns) {
            if self.entries.len() == self.capacity {
                self.entries.pop_front();
            }
            self.entries.push_back(ReplayEntry {
                experience,
                return_to_go,
            });
        }
    }

    /// Uniform mini-batch without replacement.
    pub fn mini_batch(&self, size: usize, rng: &mut ChaCha8Rng) -> Vec<&ReplayEntry> {
        let size = size.min(self.entries.len());
        sample_indices(rng, self.entries.len(), size)
            .into_iter()
            .map(|i| &self.entries[i])
            .collect()
    }
}

/// Turns mini-batches into policy updates.
pub trait Learner: Send {
    fn name(&self) -> &'static str;

    /// One gradient step; returns the norm of the applied update.
    fn train(&mut self, policy: &mut dyn Policy, batch: &[&ReplayEntry]) -> f64;
}

/// Vanilla policy gradient with a mean-return baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct ReinforceLearner {
    pub learning_rate: f64,
}

impl ReinforceLearner {
    pub fn new(learning_rate: f64) -> Self {
        Self { learning_rate }
    }
}

impl Learner for ReinforceLearner {
    fn name(&self) -> &'static str {
        "REINFORCE"
    }

    fn train(&mut self, policy: &mut dyn Policy, batch: &[&ReplayEntry]) -> f64 {
        if batch.is_empty() {
            return 0.0;
        }
        let n = batch.len() as f64;
        let baseline = batch.iter().map(|e| e.return_to_go).sum::<f64>() / n;

        let mut gradient = vec![0.0; policy.parameters().len()];
        for entry in batch {
            let advantage = entry.return_to_go - baseline;
            let g = policy.log_prob_gradient(&entry.experience.state, &entry.experience.action);
            for (acc, gi) in gradient.iter_mut().zip(g) {
                *acc += advantage * gi / n;
            }
        }

        let step: Vec<f64> = gradient.iter().map(|g| self.learning_rate * g).collect();
        let norm = step.iter().map(|s| s * s).sum::<f64>().sqrt();
        let updated = policy
            .parameters()
            .iter()
            .zip(&step)
            .map(|(p, s)| p + s)
            .collect();
        policy.set_parameters(updated);
        norm
    }
}
