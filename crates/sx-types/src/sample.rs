//! Samples: the unit of model-evaluation work.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::errors::{ModelError, ProtocolViolation, SxError, SxResult};

/// Unique sample identifier within one experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SampleId(pub u64);

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a worker in a conduit's pool (thread index or rank).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Lifecycle of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleStatus {
    Queued,
    Running,
    Suspended,
    Finished,
}

/// Termination status an environment reports for an RL episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EpisodeTermination {
    #[serde(rename = "Non Terminal")]
    NonTerminal,
    Terminal,
    Truncated,
}

impl EpisodeTermination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NonTerminal => "Non Terminal",
            Self::Terminal => "Terminal",
            Self::Truncated => "Truncated",
        }
    }

    /// Parse a final termination status. Only "Terminal" and "Truncated" are
    /// accepted once an episode has ended.
    pub fn parse_final(sample_id: SampleId, value: &str) -> SxResult<Self> {
        match value {
            "Terminal" => Ok(Self::Terminal),
            "Truncated" => Ok(Self::Truncated),
            other => Err(ProtocolViolation::InvalidTermination {
                sample_id,
                value: other.to_string(),
            }
            .into()),
        }
    }
}

/// What a solver asks for: which registered model to run, on which inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSpec {
    /// Name of the model callback in the registry.
    pub model: String,
    /// Ordered input parameters.
    pub parameters: Vec<f64>,
    /// Initial fields visible to the callback (policy blobs, seeds, mode).
    pub fields: Map<String, Value>,
}

impl SampleSpec {
    pub fn new(model: impl Into<String>, parameters: Vec<f64>) -> Self {
        Self {
            model: model.into(),
            parameters,
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// A single sample (one model evaluation in flight or finished).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: SampleId,
    pub experiment_id: Uuid,
    pub model: String,
    pub parameters: Vec<f64>,
    pub fields: Map<String, Value>,
    pub status: SampleStatus,
    pub worker: Option<WorkerId>,
    /// Number of times the callback has been entered or re-entered.
    pub launch_count: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Sample {
    pub fn new(id: SampleId, experiment_id: Uuid, spec: SampleSpec) -> Self {
        Self {
            id,
            experiment_id,
            model: spec.model,
            parameters: spec.parameters,
            fields: spec.fields,
            status: SampleStatus::Queued,
            worker: None,
            launch_count: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    fn transition(&mut self, expected: SampleStatus, to: SampleStatus) -> SxResult<()> {
        if self.status == SampleStatus::Finished && to == SampleStatus::Running {
            return Err(ProtocolViolation::ResumeAfterFinish {
                context: format!("sample {}", self.id),
            }
            .into());
        }
        if self.status != expected {
            return Err(ProtocolViolation::InvalidTransition {
                sample_id: self.id,
                from: self.status,
                to,
            }
            .into());
        }
        self.status = to;
        Ok(())
    }

    /// Queued -> Running. Happens exactly once.
    pub fn mark_running(&mut self, worker: WorkerId) -> SxResult<()> {
        self.transition(SampleStatus::Queued, SampleStatus::Running)?;
        self.worker = Some(worker);
        self.launch_count = 1;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Running -> Suspended.
    pub fn mark_suspended(&mut self) -> SxResult<()> {
        self.transition(SampleStatus::Running, SampleStatus::Suspended)
    }

    /// Suspended -> Running. Fails with `ResumeAfterFinish` on a finished sample.
    pub fn mark_resumed(&mut self) -> SxResult<()> {
        self.transition(SampleStatus::Suspended, SampleStatus::Running)?;
        self.launch_count += 1;
        Ok(())
    }

    /// Running -> Finished. Happens exactly once.
    pub fn mark_finished(&mut self) -> SxResult<()> {
        self.transition(SampleStatus::Running, SampleStatus::Finished)?;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.status == SampleStatus::Finished
    }

    pub fn has(&self, field: &str) -> bool {
        self.fields.get(field).map_or(false, |v| !v.is_null())
    }

    /// Raw field access.
    pub fn field(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Typed field access; a missing field is a model evaluation error.
    pub fn get<T: DeserializeOwned>(&self, field: &str) -> SxResult<T> {
        let value = self.fields.get(field).filter(|v| !v.is_null()).ok_or_else(|| {
            ModelError::MissingField {
                sample_id: self.id,
                field: field.to_string(),
            }
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            SxError::Model(ModelError::WrongType {
                sample_id: self.id,
                field: field.to_string(),
                message: e.to_string(),
            })
        })
    }

    /// Read a finite scalar result.
    pub fn get_f64(&self, field: &str) -> SxResult<f64> {
        let value: f64 = self.get(field)?;
        self.check_finite(field, value)?;
        Ok(value)
    }

    /// Read a vector of finite numbers, optionally checking its length.
    pub fn get_vector(&self, field: &str, expected_len: Option<usize>) -> SxResult<Vec<f64>> {
        let values: Vec<f64> = self.get(field)?;
        if let Some(expected) = expected_len {
            if values.len() != expected {
                return Err(ModelError::Arity {
                    sample_id: self.id,
                    field: field.to_string(),
                    expected,
                    actual: values.len(),
                }
                .into());
            }
        }
        for v in &values {
            self.check_finite(field, *v)?;
        }
        Ok(values)
    }

    /// Store an arbitrary serializable value.
    pub fn set<T: Serialize>(&mut self, field: &str, value: T) -> SxResult<()> {
        self.fields
            .insert(field.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Store a scalar; non-finite values are rejected.
    pub fn set_f64(&mut self, field: &str, value: f64) -> SxResult<()> {
        self.check_finite(field, value)?;
        self.fields.insert(field.to_string(), Value::from(value));
        Ok(())
    }

    /// Store a numeric vector; non-finite entries are rejected.
    pub fn set_vector(&mut self, field: &str, values: &[f64]) -> SxResult<()> {
        for v in values {
            self.check_finite(field, *v)?;
        }
        self.set(field, values)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    fn check_finite(&self, field: &str, value: f64) -> SxResult<()> {
        if value.is_finite() {
            Ok(())
        } else {
            Err(ModelError::NonFinite {
                sample_id: self.id,
                field: field.to_string(),
                value,
            }
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Sample {
        Sample::new(
            SampleId(1),
            Uuid::new_v4(),
            SampleSpec::new("model", vec![1.0, 2.0]),
        )
    }

    #[test]
    fn lifecycle_follows_protocol() {
        let mut s = sample();
        assert_eq!(s.status, SampleStatus::Queued);

        s.mark_running(WorkerId(0)).unwrap();
        assert_eq!(s.launch_count, 1);
        for _ in 0..3 {
            s.mark_suspended().unwrap();
            s.mark_resumed().unwrap();
        }
        assert_eq!(s.launch_count, 4);
        s.mark_finished().unwrap();
        assert!(s.is_finished());
        assert!(s.finished_at.is_some());
    }

    #[test]
    fn resume_after_finish_is_protocol_violation() {
        let mut s = sample();
        s.mark_running(WorkerId(0)).unwrap();
        s.mark_finished().unwrap();

        match s.mark_resumed() {
            Err(SxError::Protocol(ProtocolViolation::ResumeAfterFinish { .. })) => (),
            other => panic!("expected ResumeAfterFinish, got {other:?}"),
        }
    }

    #[test]
    fn running_twice_is_rejected() {
        let mut s = sample();
        s.mark_running(WorkerId(0)).unwrap();
        assert!(matches!(
            s.mark_running(WorkerId(1)),
            Err(SxError::Protocol(ProtocolViolation::InvalidTransition { .. }))
        ));
    }

    #[test]
    fn non_finite_results_are_rejected() {
        let mut s = sample();
        assert!(s.set_f64("logLikelihood", f64::NAN).is_err());
        assert!(s.set_vector("State", &[0.0, f64::INFINITY]).is_err());
        assert!(!s.has("logLikelihood"));
    }

    #[test]
    fn missing_and_mismatched_fields() {
        let mut s = sample();
        assert!(matches!(
            s.get_f64("F(x)"),
            Err(SxError::Model(ModelError::MissingField { .. }))
        ));

        s.set_vector("State", &[1.0, 2.0, 3.0]).unwrap();
        assert!(matches!(
            s.get_vector("State", Some(2)),
            Err(SxError::Model(ModelError::Arity { expected: 2, actual: 3, .. }))
        ));
        assert_eq!(s.get_vector("State", Some(3)).unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn termination_parsing() {
        assert_eq!(
            EpisodeTermination::parse_final(SampleId(1), "Terminal").unwrap(),
            EpisodeTermination::Terminal
        );
        assert!(EpisodeTermination::parse_final(SampleId(1), "Non Terminal").is_err());
        assert!(EpisodeTermination::parse_final(SampleId(1), "Success").is_err());
        assert_eq!(EpisodeTermination::NonTerminal.as_str(), "Non Terminal");
    }
}
