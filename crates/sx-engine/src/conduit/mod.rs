//! Conduits own the worker pool and place samples on it.

pub mod distributed;
pub mod local;

use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use sx_types::{
    ConduitConfig, ConduitKind, Message, ProtocolViolation, Sample, SampleId, SxError, SxResult,
    WorkerId,
};

use crate::registry::ModelRegistry;

pub use distributed::{DistributedConduit, RankWorker};
pub use local::LocalConduit;

/// Something a conduit observed on its workers.
#[derive(Debug)]
pub enum ConduitEvent {
    /// A sample finished; carries the leader's copy.
    Completed(Sample),
    /// A leader's callback sent a message to the solver.
    Message(Message),
    /// A worker's slot was freed.
    Released { worker: WorkerId, sample_id: SampleId },
    /// A callback failed. Fatal for the run.
    Failed { sample_id: SampleId, error: SxError },
}

/// A sample the conduit could not place, handed back with the reason.
#[derive(Debug)]
pub struct Unplaced {
    pub sample: Box<Sample>,
    pub error: SxError,
}

impl Unplaced {
    pub fn new(sample: Sample, error: SxError) -> Self {
        Self {
            sample: Box::new(sample),
            error,
        }
    }
}

/// Abstraction over the compute substrate.
pub trait Conduit: Send {
    /// Total number of workers.
    fn pool_size(&self) -> usize;

    fn workers_per_sample(&self) -> usize;

    /// Place a sample on a free worker group and start it. Returns the
    /// group leader. Fails with the recoverable `NoFreeWorker` when every
    /// group is busy.
    fn assign(&self, sample: Sample) -> Result<WorkerId, Unplaced>;

    /// Drain events without blocking.
    fn poll(&self) -> Vec<ConduitEvent>;

    /// Block until at least one event arrives or `timeout` elapses.
    fn wait(&self, timeout: Duration) -> Vec<ConduitEvent>;

    /// Deposit a solver message for every participant of a sample.
    fn deliver(&self, message: Message) -> SxResult<()>;

    /// Whether `worker` is the reporting leader of `sample_id`.
    fn is_leader(&self, sample_id: SampleId, worker: WorkerId) -> bool;

    /// Number of workers currently holding a sample.
    fn busy_workers(&self) -> usize;

    fn shutdown(&mut self);
}

/// Build the conduit described by `config`.
///
/// A distributed conduit built this way runs its worker ranks in-process
/// over a [`ChannelTransport`](crate::transport::ChannelTransport) world.
pub fn build(config: &ConduitConfig, registry: Arc<ModelRegistry>) -> SxResult<Box<dyn Conduit>> {
    config.validate()?;
    match config.kind {
        ConduitKind::Local => Ok(Box::new(LocalConduit::start(config, registry)?)),
        ConduitKind::Distributed => Ok(Box::new(DistributedConduit::in_process(config, registry)?)),
    }
}

/// Worker-pool map: which worker holds which in-flight sample.
///
/// Workers are grouped into fixed teams of `workers_per_sample`; the first
/// worker of a team is its leader. Only this map is mutated concurrently.
#[derive(Debug)]
pub struct WorkerPool {
    slots: DashMap<WorkerId, Option<SampleId>>,
    teams: Vec<Vec<WorkerId>>,
}

impl WorkerPool {
    pub fn new(workers: impl IntoIterator<Item = WorkerId>, workers_per_sample: usize) -> Self {
        let workers: Vec<WorkerId> = workers.into_iter().collect();
        let slots = DashMap::new();
        for w in &workers {
            slots.insert(*w, None);
        }
        let teams = workers
            .chunks(workers_per_sample.max(1))
            .map(|c| c.to_vec())
            .collect();
        Self { slots, teams }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn holder(&self, worker: WorkerId) -> Option<SampleId> {
        self.slots.get(&worker).and_then(|slot| *slot.value())
    }

    pub fn busy(&self) -> usize {
        self.slots.iter().filter(|slot| slot.value().is_some()).count()
    }

    /// Claim a fully idle team for `sample_id`. `Ok(None)` means every team
    /// has at least one busy worker.
    pub fn claim(&self, sample_id: SampleId) -> SxResult<Option<Vec<WorkerId>>> {
        let free_team = self
            .teams
            .iter()
            .find(|team| team.iter().all(|w| self.holder(*w).is_none()));

        let Some(team) = free_team else {
            return Ok(None);
        };
        for (i, worker) in team.iter().enumerate() {
            if let Err(e) = self.occupy(*worker, sample_id) {
                for taken in &team[..i] {
                    self.release(*taken, sample_id);
                }
                return Err(e);
            }
        }
        Ok(Some(team.clone()))
    }

    fn occupy(&self, worker: WorkerId, sample_id: SampleId) -> SxResult<()> {
        let mut slot = self
            .slots
            .get_mut(&worker)
            .ok_or_else(|| sx_types::internal_error!("{worker} is not part of the pool"))?;
        let current = *slot;
        match current {
            Some(holding) => Err(ProtocolViolation::WorkerAlreadyAssigned {
                worker,
                holding,
                requested: sample_id,
            }
            .into()),
            None => {
                *slot = Some(sample_id);
                Ok(())
            }
        }
    }

    /// Free `worker` if it still holds `sample_id`.
    pub fn release(&self, worker: WorkerId, sample_id: SampleId) {
        if let Some(mut slot) = self.slots.get_mut(&worker) {
            let holding = *slot;
            if holding == Some(sample_id) {
                *slot = None;
            } else {
                warn!(%worker, %sample_id, ?holding, "release of a sample the worker does not hold");
            }
        }
    }
}

/// Event channel between workers (or a rank receiver) and the engine.
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: Sender<ConduitEvent>,
    rx: Receiver<ConduitEvent>,
}

impl Default for EventQueue {
    fn default() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }
}

impl EventQueue {
    pub fn sender(&self) -> Sender<ConduitEvent> {
        self.tx.clone()
    }

    pub fn poll(&self) -> Vec<ConduitEvent> {
        self.rx.try_iter().collect()
    }

    pub fn wait(&self, timeout: Duration) -> Vec<ConduitEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(first) => {
                let mut events = vec![first];
                events.extend(self.rx.try_iter());
                events
            }
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(workers: usize, per_sample: usize) -> WorkerPool {
        WorkerPool::new((0..workers).map(WorkerId), per_sample)
    }

    #[test]
    fn claims_whole_teams() {
        let pool = pool(4, 2);
        assert_eq!(
            pool.claim(SampleId(1)).unwrap(),
            Some(vec![WorkerId(0), WorkerId(1)])
        );
        assert_eq!(
            pool.claim(SampleId(2)).unwrap(),
            Some(vec![WorkerId(2), WorkerId(3)])
        );
        assert_eq!(pool.claim(SampleId(3)).unwrap(), None);
        assert_eq!(pool.busy(), 4);
    }

    #[test]
    fn released_slots_are_reused() {
        let pool = pool(2, 1);
        pool.claim(SampleId(1)).unwrap();
        pool.claim(SampleId(2)).unwrap();
        pool.release(WorkerId(0), SampleId(1));

        assert_eq!(pool.holder(WorkerId(0)), None);
        assert_eq!(pool.claim(SampleId(3)).unwrap(), Some(vec![WorkerId(0)]));
        assert_eq!(pool.holder(WorkerId(1)), Some(SampleId(2)));
    }

    #[test]
    fn releasing_someone_elses_sample_is_ignored() {
        let pool = pool(1, 1);
        pool.claim(SampleId(1)).unwrap();
        pool.release(WorkerId(0), SampleId(9));
        assert_eq!(pool.holder(WorkerId(0)), Some(SampleId(1)));
    }

    #[test]
    fn occupied_worker_cannot_take_a_second_sample() {
        let pool = pool(1, 1);
        pool.claim(SampleId(1)).unwrap();
        match pool.occupy(WorkerId(0), SampleId(2)) {
            Err(SxError::Protocol(ProtocolViolation::WorkerAlreadyAssigned {
                holding,
                requested,
                ..
            })) => {
                assert_eq!(holding, SampleId(1));
                assert_eq!(requested, SampleId(2));
            }
            other => panic!("expected WorkerAlreadyAssigned, got {other:?}"),
        }
    }
}
