//! Engine-mediated messages exchanged with running samples.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sample::SampleId;

/// Which way a message travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Solver (through the engine) to the sample's callback.
    ToSample,
    /// Sample's callback to the solver (through the engine).
    ToSolver,
}

/// A message bound to one sample. The payload is opaque to the engine and
/// the conduits; only the solver and the callback interpret it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sample_id: SampleId,
    pub direction: Direction,
    pub payload: Value,
}

impl Message {
    pub fn to_sample(sample_id: SampleId, payload: Value) -> Self {
        Self {
            sample_id,
            direction: Direction::ToSample,
            payload,
        }
    }

    pub fn to_solver(sample_id: SampleId, payload: Value) -> Self {
        Self {
            sample_id,
            direction: Direction::ToSolver,
            payload,
        }
    }
}
