// Sample execution engine
// Mediates between a solver, the active conduit and running samples

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use sx_types::{
    internal_error, ConduitConfig, Message, ProtocolViolation, Sample, SampleId, SampleSpec,
    SxResult, WorkerId,
};

use crate::conduit::{self, Conduit, ConduitEvent};
use crate::registry::ModelRegistry;

/// Where an in-flight sample currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Waiting for a free worker group.
    Queued,
    Placed(WorkerId),
}

/// Running counters, logged at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub submitted: u64,
    pub completed: u64,
    pub messages_to_solver: u64,
    pub messages_to_samples: u64,
    /// Assignments deferred because every worker was busy.
    pub deferred: u64,
}

/// Process-scope coordinator for one run.
///
/// The engine never interprets message payloads; it only keeps them in
/// per-sample FIFO order in both directions.
pub struct Engine {
    experiment_id: Uuid,
    registry: Arc<ModelRegistry>,
    conduit: Box<dyn Conduit>,
    in_flight: HashMap<SampleId, Placement>,
    backlog: VecDeque<Sample>,
    outbound: HashMap<SampleId, VecDeque<Value>>,
    pending_inbound: HashMap<SampleId, Vec<Value>>,
    finished: HashMap<SampleId, Sample>,
    next_id: u64,
    poll_interval: Duration,
    stats: EngineStats,
}

impl Engine {
    pub fn new(
        experiment_id: Uuid,
        registry: Arc<ModelRegistry>,
        conduit: Box<dyn Conduit>,
        poll_interval: Duration,
    ) -> Self {
        info!(
            %experiment_id,
            pool_size = conduit.pool_size(),
            workers_per_sample = conduit.workers_per_sample(),
            "engine created"
        );
        Self {
            experiment_id,
            registry,
            conduit,
            in_flight: HashMap::new(),
            backlog: VecDeque::new(),
            outbound: HashMap::new(),
            pending_inbound: HashMap::new(),
            finished: HashMap::new(),
            next_id: 0,
            poll_interval,
            stats: EngineStats::default(),
        }
    }

    /// Build the configured conduit and an engine around it.
    pub fn from_config(
        experiment_id: Uuid,
        config: &ConduitConfig,
        registry: Arc<ModelRegistry>,
    ) -> SxResult<Self> {
        let conduit = conduit::build(config, Arc::clone(&registry))?;
        Ok(Self::new(
            experiment_id,
            registry,
            conduit,
            Duration::from_millis(config.poll_interval_ms),
        ))
    }

    pub fn experiment_id(&self) -> Uuid {
        self.experiment_id
    }

    pub fn pool_size(&self) -> usize {
        self.conduit.pool_size()
    }

    pub fn busy_workers(&self) -> usize {
        self.conduit.busy_workers()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn is_leader(&self, sample_id: SampleId, worker: WorkerId) -> bool {
        self.conduit.is_leader(sample_id, worker)
    }

    /// Leader worker of an in-flight sample; `None` while it waits for one.
    pub fn leader_of(&self, sample_id: SampleId) -> Option<WorkerId> {
        match self.in_flight.get(&sample_id)? {
            Placement::Placed(worker) => Some(*worker),
            Placement::Queued => None,
        }
    }

    /// Submit a sample without waiting for it. Samples that find every
    /// worker busy are queued and placed as workers free up.
    pub fn submit(&mut self, spec: SampleSpec) -> SxResult<SampleId> {
        // Unknown models are a configuration error, caught before anything runs.
        self.registry.resolve(&spec.model)?;

        let id = SampleId(self.next_id);
        self.next_id += 1;
        let sample = Sample::new(id, self.experiment_id, spec);

        trace!(sample_id = %id, model = %sample.model, "sample submitted");
        self.in_flight.insert(id, Placement::Queued);
        self.backlog.push_back(sample);
        self.stats.submitted += 1;
        self.place_backlog()?;
        Ok(id)
    }

    /// Submit one sample and block until it has finished.
    ///
    /// Messages are not dispatched, and whatever the sample sent is dropped
    /// with it. A callback that talks to the solver needs
    /// [`Engine::submit_and_wait`].
    pub fn evaluate(&mut self, spec: SampleSpec) -> SxResult<Sample> {
        let id = self.submit(spec)?;
        loop {
            if let Some(sample) = self.hand_back(id) {
                return Ok(sample);
            }
            let events = self.conduit.wait(self.poll_interval);
            self.absorb(events)?;
        }
    }

    /// Submit a batch and block until every sample has finished, passing each
    /// message from a sample to `handler`. A `Some` reply is delivered back
    /// to the same sample. Results come back in batch order.
    pub fn submit_and_wait<H>(&mut self, batch: Vec<SampleSpec>, handler: H) -> SxResult<Vec<Sample>>
    where
        H: FnMut(&Message) -> SxResult<Option<Value>>,
    {
        let ids = batch
            .into_iter()
            .map(|spec| self.submit(spec))
            .collect::<SxResult<Vec<_>>>()?;
        self.wait_all(&ids, handler)
    }

    /// Block until every sample in `ids` has finished.
    ///
    /// Samples outside `ids` that finish meanwhile stay with their
    /// submitter, to be collected with [`Engine::take_finished`].
    pub fn wait_all<H>(&mut self, ids: &[SampleId], mut handler: H) -> SxResult<Vec<Sample>>
    where
        H: FnMut(&Message) -> SxResult<Option<Value>>,
    {
        let mut events = self.conduit.poll();
        loop {
            self.absorb(events)?;
            self.dispatch(ids, &mut handler)?;
            if ids.iter().all(|id| self.finished.contains_key(id)) {
                break;
            }
            events = self.conduit.wait(self.poll_interval);
        }

        ids.iter()
            .map(|id| {
                self.hand_back(*id)
                    .ok_or_else(|| internal_error!("sample {id} is missing from the finished set"))
            })
            .collect()
    }

    /// Drain the conduit. Returns the ids of samples that finished since the
    /// last call; their results are picked up with [`Engine::take_finished`].
    pub fn check_progress(&mut self) -> SxResult<Vec<SampleId>> {
        let events = self.conduit.poll();
        self.absorb(events)
    }

    /// Collect a finished sample. Messages it sent that were not yet
    /// withdrawn with [`Engine::receive`] are dropped.
    pub fn take_finished(&mut self, sample_id: SampleId) -> Option<Sample> {
        self.hand_back(sample_id)
    }

    /// A finished sample leaves the engine together with its mailbox.
    fn hand_back(&mut self, sample_id: SampleId) -> Option<Sample> {
        let sample = self.finished.remove(&sample_id)?;
        if let Some(unread) = self.outbound.remove(&sample_id) {
            debug!(%sample_id, unread = unread.len(), "unread messages dropped");
        }
        Some(sample)
    }

    /// Deposit a message on a sample's inbound FIFO.
    pub fn send(&mut self, sample_id: SampleId, payload: Value) -> SxResult<()> {
        match self.in_flight.get(&sample_id) {
            None => Err(ProtocolViolation::UnknownSample { sample_id }.into()),
            Some(Placement::Queued) => {
                self.pending_inbound.entry(sample_id).or_default().push(payload);
                self.stats.messages_to_samples += 1;
                Ok(())
            }
            Some(Placement::Placed(_)) => {
                self.conduit.deliver(Message::to_sample(sample_id, payload))?;
                self.stats.messages_to_samples += 1;
                Ok(())
            }
        }
    }

    /// Withdraw the oldest message a sample sent to the solver.
    pub fn receive(&mut self, sample_id: SampleId) -> Option<Value> {
        let queue = self.outbound.get_mut(&sample_id)?;
        let payload = queue.pop_front();
        if queue.is_empty() {
            self.outbound.remove(&sample_id);
        }
        payload
    }

    pub fn shutdown(&mut self) {
        if !self.in_flight.is_empty() {
            warn!(in_flight = self.in_flight.len(), "shutting down with samples in flight");
        }
        info!(
            submitted = self.stats.submitted,
            completed = self.stats.completed,
            deferred = self.stats.deferred,
            "engine shutting down"
        );
        self.conduit.shutdown();
    }

    fn dispatch<H>(&mut self, ids: &[SampleId], handler: &mut H) -> SxResult<()>
    where
        H: FnMut(&Message) -> SxResult<Option<Value>>,
    {
        for id in ids {
            while let Some(payload) = self.receive(*id) {
                let message = Message::to_solver(*id, payload);
                if let Some(reply) = handler(&message)? {
                    if self.in_flight.contains_key(id) {
                        self.send(*id, reply)?;
                    } else {
                        debug!(sample_id = %id, "reply to a finished sample dropped");
                    }
                }
            }
        }
        Ok(())
    }

    fn absorb(&mut self, events: Vec<ConduitEvent>) -> SxResult<Vec<SampleId>> {
        let mut completed = Vec::new();
        for event in events {
            match event {
                ConduitEvent::Completed(sample) => {
                    let id = sample.id;
                    if self.in_flight.remove(&id).is_none() {
                        warn!(sample_id = %id, "completion for a sample that is not in flight");
                        continue;
                    }
                    debug!(sample_id = %id, launches = sample.launch_count, "sample completed");
                    self.stats.completed += 1;
                    self.finished.insert(id, sample);
                    completed.push(id);
                }
                ConduitEvent::Message(message) => {
                    if !self.in_flight.contains_key(&message.sample_id) {
                        warn!(sample_id = %message.sample_id, "message from a sample that is not in flight");
                        continue;
                    }
                    self.stats.messages_to_solver += 1;
                    self.outbound
                        .entry(message.sample_id)
                        .or_default()
                        .push_back(message.payload);
                }
                ConduitEvent::Released { worker, sample_id } => {
                    trace!(%worker, %sample_id, "worker released");
                }
                ConduitEvent::Failed { sample_id, error } => {
                    self.in_flight.remove(&sample_id);
                    self.outbound.remove(&sample_id);
                    self.pending_inbound.remove(&sample_id);
                    return Err(error);
                }
            }
        }
        self.place_backlog()?;
        Ok(completed)
    }

    fn place_backlog(&mut self) -> SxResult<()> {
        while let Some(sample) = self.backlog.pop_front() {
            let id = sample.id;
            match self.conduit.assign(sample) {
                Ok(worker) => {
                    self.in_flight.insert(id, Placement::Placed(worker));
                    for payload in self.pending_inbound.remove(&id).unwrap_or_default() {
                        self.conduit.deliver(Message::to_sample(id, payload))?;
                    }
                }
                Err(unplaced) if !unplaced.error.is_fatal() => {
                    trace!(sample_id = %id, reason = %unplaced.error, "assignment deferred");
                    self.stats.deferred += 1;
                    self.backlog.push_front(*unplaced.sample);
                    break;
                }
                Err(unplaced) => return Err(unplaced.error),
            }
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.conduit.shutdown();
    }
}
