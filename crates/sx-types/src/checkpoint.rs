//! Versioned checkpoint record written at generation boundaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{SxError, SxResult};
use crate::termination::Termination;

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Structured record of a solver's generation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub experiment_id: Uuid,
    pub experiment_name: String,
    pub generation: usize,
    pub termination: Termination,
    /// Solver working set, tagged by solver variant.
    pub solver: Value,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        experiment_id: Uuid,
        experiment_name: impl Into<String>,
        generation: usize,
        termination: Termination,
        solver: Value,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            experiment_id,
            experiment_name: experiment_name.into(),
            generation,
            termination,
            solver,
            saved_at: Utc::now(),
        }
    }

    pub fn to_json(&self) -> SxResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a checkpoint, rejecting records written by a newer format.
    pub fn from_json(text: &str) -> SxResult<Self> {
        let checkpoint: Checkpoint = serde_json::from_str(text)?;
        if checkpoint.version > CHECKPOINT_VERSION {
            return Err(SxError::Checkpoint {
                message: format!(
                    "checkpoint version {} is newer than supported version {}",
                    checkpoint.version, CHECKPOINT_VERSION
                ),
            });
        }
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn future_versions_are_rejected() {
        let mut cp = Checkpoint::new(Uuid::new_v4(), "exp", 3, Termination::new(), Value::Null);
        cp.version = CHECKPOINT_VERSION + 1;
        let text = serde_json::to_string(&cp).unwrap();
        assert!(matches!(
            Checkpoint::from_json(&text),
            Err(SxError::Checkpoint { .. })
        ));
    }

    #[test]
    fn termination_survives_serialization() {
        let mut termination = Termination::new();
        termination.reach("Max generations reached (10)");
        let cp = Checkpoint::new(Uuid::new_v4(), "exp", 10, termination, serde_json::json!({"k": 1}));

        let back = Checkpoint::from_json(&cp.to_json().unwrap()).unwrap();
        assert_eq!(back, cp);
        assert_eq!(back.termination.reason(), Some("Max generations reached (10)"));
    }
}
