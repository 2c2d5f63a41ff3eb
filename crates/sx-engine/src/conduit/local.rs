//! Single-process conduit: a fixed pool of worker threads.

use crossbeam_channel::{unbounded, Sender};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use sx_types::{ConduitConfig, Message, Sample, SampleId, SxError, SxResult, WorkerId};

use super::{Conduit, ConduitEvent, EventQueue, Unplaced, WorkerPool};
use crate::context::SampleCell;
use crate::registry::ModelRegistry;
use crate::worker::{Command, Participant, Uplink, WorkerHandle, WorkerLoop};

/// Reports from worker threads straight into the engine's event queue.
struct LocalUplink {
    pool: Arc<WorkerPool>,
    events: Sender<ConduitEvent>,
}

impl LocalUplink {
    fn emit(&self, event: ConduitEvent) -> SxResult<()> {
        self.events.send(event).map_err(|_| SxError::Transport {
            message: "engine event queue closed".to_string(),
        })
    }
}

impl Uplink for LocalUplink {
    fn message(&self, message: Message) -> SxResult<()> {
        self.emit(ConduitEvent::Message(message))
    }

    fn released(&self, worker: WorkerId, sample_id: SampleId) -> SxResult<()> {
        self.pool.release(worker, sample_id);
        self.emit(ConduitEvent::Released { worker, sample_id })
    }

    fn finished(&self, _worker: WorkerId, sample: Sample) -> SxResult<()> {
        self.emit(ConduitEvent::Completed(sample))
    }

    fn failed(&self, _worker: WorkerId, sample_id: SampleId, error: SxError) -> SxResult<()> {
        self.emit(ConduitEvent::Failed { sample_id, error })
    }
}

pub struct LocalConduit {
    pool: Arc<WorkerPool>,
    registry: Arc<ModelRegistry>,
    workers: Vec<WorkerHandle>,
    events: EventQueue,
    placements: DashMap<SampleId, Vec<(WorkerId, Arc<SampleCell>)>>,
    workers_per_sample: usize,
}

impl LocalConduit {
    /// Spawn the worker threads.
    pub fn start(config: &ConduitConfig, registry: Arc<ModelRegistry>) -> SxResult<Self> {
        config.validate()?;

        let pool = Arc::new(WorkerPool::new(
            (0..config.workers).map(WorkerId),
            config.workers_per_sample,
        ));
        let events = EventQueue::default();
        let uplink: Arc<dyn Uplink> = Arc::new(LocalUplink {
            pool: Arc::clone(&pool),
            events: events.sender(),
        });

        let mut workers = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            let worker = WorkerId(id);
            let (tx, rx) = unbounded();
            let thread = WorkerLoop::new(
                worker,
                rx,
                Arc::clone(&uplink),
                config.coroutine_stack_bytes,
            )
            .start()?;
            workers.push(WorkerHandle {
                worker,
                commands: tx,
                thread: Some(thread),
            });
        }

        info!(
            workers = config.workers,
            workers_per_sample = config.workers_per_sample,
            "local conduit started"
        );
        Ok(Self {
            pool,
            registry,
            workers,
            events,
            placements: DashMap::new(),
            workers_per_sample: config.workers_per_sample,
        })
    }

    fn forget_finished(&self, events: &[ConduitEvent]) {
        for event in events {
            match event {
                ConduitEvent::Completed(sample) => {
                    self.placements.remove(&sample.id);
                }
                ConduitEvent::Failed { sample_id, .. } => {
                    self.placements.remove(sample_id);
                }
                _ => {}
            }
        }
    }

    /// Undo a partially started assignment. Workers that already run the
    /// sample keep their slot until they report it released.
    fn abandon(&self, sample_id: SampleId, started: &[WorkerId], unstarted: &[WorkerId]) {
        self.placements.remove(&sample_id);
        for worker in unstarted {
            self.pool.release(*worker, sample_id);
        }
        warn!(
            %sample_id,
            started = started.len(),
            released = unstarted.len(),
            "assignment abandoned"
        );
    }

    fn handle(&self, worker: WorkerId) -> SxResult<&WorkerHandle> {
        self.workers
            .get(worker.0)
            .ok_or_else(|| sx_types::internal_error!("{worker} is not part of the pool"))
    }
}

impl Conduit for LocalConduit {
    fn pool_size(&self) -> usize {
        self.pool.size()
    }

    fn workers_per_sample(&self) -> usize {
        self.workers_per_sample
    }

    fn assign(&self, sample: Sample) -> Result<WorkerId, Unplaced> {
        let model = match self.registry.resolve(&sample.model) {
            Ok(model) => model,
            Err(e) => return Err(Unplaced::new(sample, e)),
        };
        let team = match self.pool.claim(sample.id) {
            Ok(Some(team)) => team,
            Ok(None) => {
                let pool_size = self.pool.size();
                return Err(Unplaced::new(sample, SxError::NoFreeWorker { pool_size }));
            }
            Err(e) => return Err(Unplaced::new(sample, e)),
        };

        let placement: Vec<(WorkerId, Arc<SampleCell>)> = team
            .iter()
            .map(|w| (*w, SampleCell::new(sample.clone())))
            .collect();
        self.placements.insert(sample.id, placement.clone());

        for (i, (worker, cell)) in placement.into_iter().enumerate() {
            let participant = Participant {
                cell,
                model: Arc::clone(&model),
                leader: i == 0,
            };
            if let Err(e) = self.handle(worker).and_then(|h| h.send(Command::Run(participant))) {
                self.abandon(sample.id, &team[..i], &team[i..]);
                return Err(Unplaced::new(sample, e));
            }
        }

        debug!(sample_id = %sample.id, leader = %team[0], "sample assigned");
        Ok(team[0])
    }

    fn poll(&self) -> Vec<ConduitEvent> {
        let events = self.events.poll();
        self.forget_finished(&events);
        events
    }

    fn wait(&self, timeout: Duration) -> Vec<ConduitEvent> {
        let events = self.events.wait(timeout);
        self.forget_finished(&events);
        events
    }

    fn deliver(&self, message: Message) -> SxResult<()> {
        let placement = self
            .placements
            .get(&message.sample_id)
            .map(|p| p.value().clone())
            .ok_or(sx_types::ProtocolViolation::UnknownSample {
                sample_id: message.sample_id,
            })?;

        for (worker, cell) in placement {
            cell.deposit(message.payload.clone());
            self.handle(worker)?.send(Command::Wake)?;
        }
        Ok(())
    }

    fn is_leader(&self, sample_id: SampleId, worker: WorkerId) -> bool {
        self.placements
            .get(&sample_id)
            .and_then(|p| p.value().first().map(|(leader, _)| *leader == worker))
            .unwrap_or(false)
    }

    fn busy_workers(&self) -> usize {
        self.pool.busy()
    }

    fn shutdown(&mut self) {
        for handle in &mut self.workers {
            handle.stop();
        }
        self.workers.clear();
        self.placements.clear();
    }
}

impl Drop for LocalConduit {
    fn drop(&mut self) {
        self.shutdown();
    }
}
