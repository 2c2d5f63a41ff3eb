//! What a model callback sees while its sample runs.
//!
//! [`SampleContext`] is the outer handle (worker <-> sample). A callback that
//! drives a stepwise environment spawns it with
//! [`SampleContext::spawn_environment`]; the environment body then runs on a
//! second execution context owned by the sample and talks to it through an
//! [`EnvironmentContext`] (sample <-> environment loop).

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

use sx_types::{Message, Sample, SampleId, SxResult, WorkerId};

use crate::coroutine::{Coroutine, Step, SuspendReason, Suspender};
use crate::worker::Uplink;

/// Sample state shared between the worker that owns a sample and the
/// callback running inside it. Only one of the two runs at a time.
pub struct SampleCell {
    id: SampleId,
    sample: Mutex<Sample>,
    inbox: Mutex<VecDeque<Value>>,
}

impl SampleCell {
    pub fn new(sample: Sample) -> Arc<Self> {
        Arc::new(Self {
            id: sample.id,
            sample: Mutex::new(sample),
            inbox: Mutex::new(VecDeque::new()),
        })
    }

    pub fn id(&self) -> SampleId {
        self.id
    }

    /// Deposit a solver message; visible to the callback after its next resume.
    pub fn deposit(&self, payload: Value) {
        self.inbox.lock().push_back(payload);
    }

    pub fn has_mail(&self) -> bool {
        !self.inbox.lock().is_empty()
    }

    pub(crate) fn take_mail(&self) -> Option<Value> {
        self.inbox.lock().pop_front()
    }

    pub fn with_sample<R>(&self, f: impl FnOnce(&mut Sample) -> R) -> R {
        f(&mut self.sample.lock())
    }

    pub fn snapshot(&self) -> Sample {
        self.sample.lock().clone()
    }
}

/// Outer context handed to a model callback.
pub struct SampleContext<'a> {
    cell: Arc<SampleCell>,
    suspender: &'a Suspender,
    uplink: Arc<dyn Uplink>,
    worker: WorkerId,
    leader: bool,
    stack_bytes: usize,
}

impl<'a> SampleContext<'a> {
    pub(crate) fn new(
        cell: Arc<SampleCell>,
        suspender: &'a Suspender,
        uplink: Arc<dyn Uplink>,
        worker: WorkerId,
        leader: bool,
        stack_bytes: usize,
    ) -> Self {
        Self {
            cell,
            suspender,
            uplink,
            worker,
            leader,
            stack_bytes,
        }
    }

    pub fn id(&self) -> SampleId {
        self.cell.id()
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Whether this participant reports results for its sample. Callbacks of
    /// non-leaders may compute, but nothing they write reaches the solver.
    pub fn is_leader(&self) -> bool {
        self.leader
    }

    pub fn parameters(&self) -> Vec<f64> {
        self.cell.with_sample(|s| s.parameters.clone())
    }

    pub fn has(&self, field: &str) -> bool {
        self.cell.with_sample(|s| s.has(field))
    }

    pub fn get<T: DeserializeOwned>(&self, field: &str) -> SxResult<T> {
        self.cell.with_sample(|s| s.get(field))
    }

    pub fn get_f64(&self, field: &str) -> SxResult<f64> {
        self.cell.with_sample(|s| s.get_f64(field))
    }

    pub fn get_vector(&self, field: &str, expected_len: Option<usize>) -> SxResult<Vec<f64>> {
        self.cell.with_sample(|s| s.get_vector(field, expected_len))
    }

    pub fn set<T: Serialize>(&mut self, field: &str, value: T) -> SxResult<()> {
        self.cell.with_sample(|s| s.set(field, value))
    }

    pub fn set_f64(&mut self, field: &str, value: f64) -> SxResult<()> {
        self.cell.with_sample(|s| s.set_f64(field, value))
    }

    pub fn set_vector(&mut self, field: &str, values: &[f64]) -> SxResult<()> {
        self.cell.with_sample(|s| s.set_vector(field, values))
    }

    /// Hand control back to the worker and continue on its next resume.
    pub fn suspend(&mut self) -> SxResult<()> {
        self.suspend_for(SuspendReason::Yield)
    }

    fn suspend_for(&mut self, reason: SuspendReason) -> SxResult<()> {
        self.cell.with_sample(|s| s.mark_suspended())?;
        self.suspender.suspend(reason)?;
        self.cell.with_sample(|s| s.mark_resumed())
    }

    /// Send a message to the solver. Silently dropped for non-leaders.
    pub fn send(&mut self, payload: Value) -> SxResult<()> {
        if !self.leader {
            trace!(sample_id = %self.id(), worker = %self.worker, "non-leader send dropped");
            return Ok(());
        }
        self.uplink.message(Message::to_solver(self.id(), payload))
    }

    /// Next message from the solver, suspending until one arrives.
    pub fn receive(&mut self) -> SxResult<Value> {
        loop {
            if let Some(payload) = self.cell.take_mail() {
                return Ok(payload);
            }
            self.suspend_for(SuspendReason::AwaitMessage)?;
        }
    }

    pub fn try_receive(&mut self) -> Option<Value> {
        self.cell.take_mail()
    }

    /// Send a message and wait for the reply. Every member of a worker group
    /// receives the reply, even though only the leader's request is sent.
    pub fn request(&mut self, payload: Value) -> SxResult<Value> {
        self.send(payload)?;
        self.receive()
    }

    /// Start a stepwise environment on an execution context owned by this
    /// sample. The environment does not run until [`Environment::advance`].
    pub fn spawn_environment<F>(&mut self, body: F) -> SxResult<Environment>
    where
        F: FnOnce(&mut EnvironmentContext<'_>) -> SxResult<()> + Send + 'static,
    {
        let cell = Arc::clone(&self.cell);
        let context = format!("sample-{}-environment", self.id());
        let coroutine = Coroutine::spawn(context, self.stack_bytes, move |suspender| {
            let mut env = EnvironmentContext {
                cell,
                suspender,
                steps: 0,
            };
            body(&mut env)
        })?;
        Ok(Environment { coroutine })
    }
}

/// Inner handle, owned by the sample, over a running environment loop.
pub struct Environment {
    coroutine: Coroutine<()>,
}

impl Environment {
    /// Run the environment until it asks for its next action (`true`) or
    /// returns (`false`). An error returned by the environment body is
    /// propagated here.
    pub fn advance(&mut self) -> SxResult<bool> {
        match self.coroutine.resume()? {
            Step::Suspended(_) => Ok(true),
            Step::Finished => match self.coroutine.take_result() {
                Some(result) => result.map(|_| false),
                None => Ok(false),
            },
        }
    }

    pub fn is_finished(&self) -> bool {
        self.coroutine.is_finished()
    }
}

/// Context handed to an environment body.
pub struct EnvironmentContext<'a> {
    cell: Arc<SampleCell>,
    suspender: &'a Suspender,
    steps: usize,
}

impl<'a> EnvironmentContext<'a> {
    pub fn sample_id(&self) -> SampleId {
        self.cell.id()
    }

    pub fn parameters(&self) -> Vec<f64> {
        self.cell.with_sample(|s| s.parameters.clone())
    }

    pub fn get<T: DeserializeOwned>(&self, field: &str) -> SxResult<T> {
        self.cell.with_sample(|s| s.get(field))
    }

    pub fn set<T: Serialize>(&mut self, field: &str, value: T) -> SxResult<()> {
        self.cell.with_sample(|s| s.set(field, value))
    }

    pub fn set_state(&mut self, state: &[f64]) -> SxResult<()> {
        self.cell.with_sample(|s| s.set_vector("State", state))
    }

    pub fn set_reward(&mut self, reward: f64) -> SxResult<()> {
        self.cell.with_sample(|s| s.set_f64("Reward", reward))
    }

    /// Record how the episode ended. Only "Terminal" and "Truncated" are
    /// accepted by the rollout once the environment returns.
    pub fn set_termination(&mut self, termination: &str) -> SxResult<()> {
        self.cell.with_sample(|s| s.set("Termination", termination))
    }

    /// Number of actions requested so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Suspend until the sample has chosen the next action, then return it.
    pub fn update(&mut self) -> SxResult<Vec<f64>> {
        self.suspender.suspend(SuspendReason::Yield)?;
        self.steps += 1;
        self.cell.with_sample(|s| s.get_vector("Action", None))
    }
}
