//! Multi-rank conduit.
//!
//! Rank 0 hosts the engine and this conduit; every other rank runs a
//! [`RankWorker`]. Worker ranks are grouped into teams of
//! `workers_per_sample` consecutive ranks whose first rank is the leader.
//! All traffic is [`WireFrame`]s over a [`Transport`]; per-rank-pair FIFO
//! order of the transport gives per-sample FIFO order of messages.

use crossbeam_channel::{unbounded, Sender};
use dashmap::DashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use sx_types::{
    config_error, ConduitConfig, Message, RemoteError, Sample, SampleId, SxError, SxResult,
    WorkerId,
};

use super::{Conduit, ConduitEvent, EventQueue, Unplaced, WorkerPool};
use crate::context::SampleCell;
use crate::registry::ModelRegistry;
use crate::transport::{recv_frame, send_frame, ChannelTransport, Transport, WireFrame, HOME_RANK};
use crate::worker::{Command, Participant, Uplink, WorkerLoop};

pub struct DistributedConduit {
    transport: Arc<dyn Transport>,
    pool: Arc<WorkerPool>,
    registry: Arc<ModelRegistry>,
    events: EventQueue,
    placements: Arc<DashMap<SampleId, Vec<WorkerId>>>,
    receiver: Option<JoinHandle<()>>,
    /// Worker ranks hosted in this process, if any.
    local_ranks: Vec<JoinHandle<()>>,
    workers_per_sample: usize,
}

impl DistributedConduit {
    /// Attach to rank 0 of an existing world. `config.workers` must equal
    /// the number of worker ranks.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: &ConduitConfig,
        registry: Arc<ModelRegistry>,
    ) -> SxResult<Self> {
        config.validate()?;
        if transport.rank() != HOME_RANK {
            return Err(config_error!(
                "Conduit",
                "Rank",
                "the engine must run on rank {} (is {})",
                HOME_RANK,
                transport.rank()
            ));
        }
        if transport.size() != config.workers + 1 {
            return Err(config_error!(
                "Conduit",
                "Workers",
                "{} worker ranks configured but the world has {} ranks",
                config.workers,
                transport.size()
            ));
        }

        let pool = Arc::new(WorkerPool::new(
            (1..transport.size()).map(WorkerId),
            config.workers_per_sample,
        ));
        let events = EventQueue::default();
        let placements = Arc::new(DashMap::new());

        let receiver = {
            let transport = Arc::clone(&transport);
            let pool = Arc::clone(&pool);
            let placements = Arc::clone(&placements);
            let events = events.sender();
            thread::Builder::new()
                .name("sx-home-receiver".to_string())
                .spawn(move || receive_loop(transport.as_ref(), &pool, &placements, &events))?
        };

        info!(
            worker_ranks = config.workers,
            workers_per_sample = config.workers_per_sample,
            "distributed conduit started"
        );
        Ok(Self {
            transport,
            pool,
            registry,
            events,
            placements,
            receiver: Some(receiver),
            local_ranks: Vec::new(),
            workers_per_sample: config.workers_per_sample,
        })
    }

    /// Run every worker rank as a thread of this process over a
    /// [`ChannelTransport`] world.
    pub fn in_process(config: &ConduitConfig, registry: Arc<ModelRegistry>) -> SxResult<Self> {
        config.validate()?;
        let mut world = ChannelTransport::world(config.workers + 1).into_iter();
        let home = world
            .next()
            .ok_or_else(|| sx_types::internal_error!("empty transport world"))?;

        let mut local_ranks = Vec::with_capacity(config.workers);
        for transport in world {
            let rank = transport.rank();
            let worker = RankWorker::new(
                Arc::new(transport),
                Arc::clone(&registry),
                config.coroutine_stack_bytes,
            );
            let handle = thread::Builder::new()
                .name(format!("sx-rank-{rank}"))
                .spawn(move || {
                    if let Err(e) = worker.serve() {
                        error!(rank, error = %e, "worker rank stopped with error");
                    }
                })?;
            local_ranks.push(handle);
        }

        let mut conduit = Self::new(Arc::new(home), config, registry)?;
        conduit.local_ranks = local_ranks;
        Ok(conduit)
    }

    fn send(&self, rank: WorkerId, frame: &WireFrame) -> SxResult<()> {
        send_frame(self.transport.as_ref(), rank.0, frame)
    }

    /// Undo a partially sent assignment. Ranks that already received the
    /// sample keep their slot until they report it released.
    fn abandon(&self, sample_id: SampleId, started: &[WorkerId], unstarted: &[WorkerId]) {
        self.placements.remove(&sample_id);
        for rank in unstarted {
            self.pool.release(*rank, sample_id);
        }
        warn!(
            %sample_id,
            started = started.len(),
            released = unstarted.len(),
            "assignment abandoned"
        );
    }
}

/// Home-rank receiver: turns worker frames into conduit events.
fn receive_loop(
    transport: &dyn Transport,
    pool: &WorkerPool,
    placements: &DashMap<SampleId, Vec<WorkerId>>,
    events: &Sender<ConduitEvent>,
) {
    loop {
        let (from, frame) = match recv_frame(transport) {
            Ok(received) => received,
            Err(e) => {
                error!(error = %e, "home receiver stopped");
                return;
            }
        };

        let event = match frame {
            WireFrame::Outbound { message } => ConduitEvent::Message(message),
            WireFrame::Released { worker, sample_id } => {
                pool.release(worker, sample_id);
                ConduitEvent::Released { worker, sample_id }
            }
            WireFrame::Finished { sample } => {
                placements.remove(&sample.id);
                ConduitEvent::Completed(sample)
            }
            WireFrame::Failed { sample_id, error } => {
                placements.remove(&sample_id);
                ConduitEvent::Failed {
                    sample_id,
                    error: error.into_error(from),
                }
            }
            WireFrame::Shutdown => {
                debug!("home receiver shutting down");
                return;
            }
            other => {
                warn!(rank = from, frame = ?other, "unexpected frame on home rank");
                continue;
            }
        };

        if events.send(event).is_err() {
            return;
        }
    }
}

impl Conduit for DistributedConduit {
    fn pool_size(&self) -> usize {
        self.pool.size()
    }

    fn workers_per_sample(&self) -> usize {
        self.workers_per_sample
    }

    fn assign(&self, sample: Sample) -> Result<WorkerId, Unplaced> {
        if let Err(e) = self.registry.resolve(&sample.model) {
            return Err(Unplaced::new(sample, e));
        }
        let team = match self.pool.claim(sample.id) {
            Ok(Some(team)) => team,
            Ok(None) => {
                let pool_size = self.pool.size();
                return Err(Unplaced::new(sample, SxError::NoFreeWorker { pool_size }));
            }
            Err(e) => return Err(Unplaced::new(sample, e)),
        };

        self.placements.insert(sample.id, team.clone());
        for (i, rank) in team.iter().enumerate() {
            let frame = WireFrame::Assign {
                sample: sample.clone(),
                leader: i == 0,
            };
            if let Err(e) = self.send(*rank, &frame) {
                self.abandon(sample.id, &team[..i], &team[i..]);
                return Err(Unplaced::new(sample, e));
            }
        }

        debug!(sample_id = %sample.id, leader = %team[0], "sample assigned to ranks");
        Ok(team[0])
    }

    fn poll(&self) -> Vec<ConduitEvent> {
        self.events.poll()
    }

    fn wait(&self, timeout: Duration) -> Vec<ConduitEvent> {
        self.events.wait(timeout)
    }

    fn deliver(&self, message: Message) -> SxResult<()> {
        let team = self
            .placements
            .get(&message.sample_id)
            .map(|t| t.value().clone())
            .ok_or(sx_types::ProtocolViolation::UnknownSample {
                sample_id: message.sample_id,
            })?;

        let frame = WireFrame::Deliver {
            sample_id: message.sample_id,
            payload: message.payload,
        };
        for rank in team {
            self.send(rank, &frame)?;
        }
        Ok(())
    }

    fn is_leader(&self, sample_id: SampleId, worker: WorkerId) -> bool {
        self.placements
            .get(&sample_id)
            .and_then(|t| t.value().first().map(|leader| *leader == worker))
            .unwrap_or(false)
    }

    fn busy_workers(&self) -> usize {
        self.pool.busy()
    }

    fn shutdown(&mut self) {
        let Some(receiver) = self.receiver.take() else {
            return;
        };
        for rank in 1..self.transport.size() {
            if let Err(e) = self.send(WorkerId(rank), &WireFrame::Shutdown) {
                warn!(rank, error = %e, "could not stop worker rank");
            }
        }
        // Wake our own receiver so it can exit.
        let _ = send_frame(self.transport.as_ref(), HOME_RANK, &WireFrame::Shutdown);
        if receiver.join().is_err() {
            warn!("home receiver panicked");
        }
        for handle in self.local_ranks.drain(..) {
            if handle.join().is_err() {
                warn!("worker rank thread panicked");
            }
        }
        self.placements.clear();
        info!("distributed conduit stopped");
    }
}

impl Drop for DistributedConduit {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reports from a worker rank to the home rank.
struct RankUplink {
    transport: Arc<dyn Transport>,
}

impl RankUplink {
    fn home(&self, frame: WireFrame) -> SxResult<()> {
        send_frame(self.transport.as_ref(), HOME_RANK, &frame)
    }
}

impl Uplink for RankUplink {
    fn message(&self, message: Message) -> SxResult<()> {
        self.home(WireFrame::Outbound { message })
    }

    fn released(&self, worker: WorkerId, sample_id: SampleId) -> SxResult<()> {
        self.home(WireFrame::Released { worker, sample_id })
    }

    fn finished(&self, _worker: WorkerId, sample: Sample) -> SxResult<()> {
        self.home(WireFrame::Finished { sample })
    }

    fn failed(&self, _worker: WorkerId, sample_id: SampleId, error: SxError) -> SxResult<()> {
        self.home(WireFrame::Failed {
            sample_id,
            error: RemoteError::from(&error),
        })
    }
}

/// Event loop of a worker rank.
pub struct RankWorker {
    transport: Arc<dyn Transport>,
    registry: Arc<ModelRegistry>,
    stack_bytes: usize,
}

impl RankWorker {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<ModelRegistry>,
        stack_bytes: usize,
    ) -> Self {
        Self {
            transport,
            registry,
            stack_bytes,
        }
    }

    /// Serve frames from the home rank until told to shut down.
    pub fn serve(self) -> SxResult<()> {
        let rank = self.transport.rank();
        let worker = WorkerId(rank);
        let uplink: Arc<dyn Uplink> = Arc::new(RankUplink {
            transport: Arc::clone(&self.transport),
        });
        let (commands, command_rx) = unbounded();
        let worker_thread =
            WorkerLoop::new(worker, command_rx, Arc::clone(&uplink), self.stack_bytes).start()?;
        debug!(rank, "worker rank serving");

        let mut current: Option<Arc<SampleCell>> = None;
        let outcome = loop {
            let frame = match recv_frame(self.transport.as_ref()) {
                Ok((_, frame)) => frame,
                Err(e) => break Err(e),
            };

            match frame {
                WireFrame::Assign { sample, leader } => {
                    let sample_id = sample.id;
                    let model = match self.registry.resolve(&sample.model) {
                        Ok(model) => model,
                        Err(e) => {
                            uplink.released(worker, sample_id)?;
                            uplink.failed(worker, sample_id, e)?;
                            continue;
                        }
                    };
                    let cell = SampleCell::new(sample);
                    current = Some(Arc::clone(&cell));
                    let run = Command::Run(Participant {
                        cell,
                        model,
                        leader,
                    });
                    if commands.send(run).is_err() {
                        break Err(sx_types::internal_error!("rank {rank}: worker loop exited"));
                    }
                }
                WireFrame::Deliver { sample_id, payload } => match &current {
                    Some(cell) if cell.id() == sample_id => {
                        cell.deposit(payload);
                        if commands.send(Command::Wake).is_err() {
                            error!(rank, %sample_id, "worker loop exited with mail pending");
                            break Err(sx_types::internal_error!("rank {rank}: worker loop exited"));
                        }
                    }
                    _ => warn!(rank, %sample_id, "mail for a sample this rank does not hold"),
                },
                WireFrame::Shutdown => break Ok(()),
                other => warn!(rank, frame = ?other, "unexpected frame on worker rank"),
            }
        };

        let _ = commands.send(Command::Shutdown);
        if worker_thread.join().is_err() {
            warn!(rank, "worker loop panicked");
        }
        debug!(rank, "worker rank stopped");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;
    use uuid::Uuid;

    use sx_types::SampleSpec;

    fn drain_until(
        conduit: &DistributedConduit,
        mut done: impl FnMut(&[ConduitEvent]) -> bool,
    ) -> Vec<ConduitEvent> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut seen = Vec::new();
        while !done(&seen) {
            assert!(Instant::now() < deadline, "timed out waiting for events");
            seen.extend(conduit.wait(Duration::from_millis(50)));
        }
        seen
    }

    fn registry() -> Arc<ModelRegistry> {
        let registry = ModelRegistry::new();
        registry.register("echo", |ctx| {
            let x = ctx.parameters();
            ctx.send(json!({ "x": x }))?;
            let reply = ctx.receive()?;
            ctx.set("Reply", reply)?;
            ctx.set_f64("Rank", ctx.worker().0 as f64)
        });
        registry.register("square", |ctx| {
            let x = ctx.parameters()[0];
            ctx.set_f64("F(x)", x * x)
        });
        registry.register("nan", |ctx| ctx.set_f64("F(x)", f64::NAN));
        registry
    }

    #[test]
    fn round_trips_messages_across_ranks() {
        let config = ConduitConfig::distributed(2);
        let mut conduit = DistributedConduit::in_process(&config, registry()).unwrap();
        assert_eq!(conduit.pool_size(), 2);

        let sample = Sample::new(SampleId(1), Uuid::new_v4(), SampleSpec::new("echo", vec![1.5]));
        let leader = conduit.assign(sample).unwrap();
        assert_eq!(leader, WorkerId(1));

        let events = drain_until(&conduit, |e| {
            e.iter().any(|e| matches!(e, ConduitEvent::Message(_)))
        });
        let outbound = events
            .iter()
            .find_map(|e| match e {
                ConduitEvent::Message(m) => Some(m.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(outbound.payload, json!({ "x": [1.5] }));

        conduit
            .deliver(Message::to_sample(SampleId(1), json!("pong")))
            .unwrap();
        let events = drain_until(&conduit, |e| {
            e.iter().any(|e| matches!(e, ConduitEvent::Completed(_)))
        });
        let done = events
            .into_iter()
            .find_map(|e| match e {
                ConduitEvent::Completed(s) => Some(s),
                _ => None,
            })
            .unwrap();
        assert_eq!(done.field("Reply"), Some(&json!("pong")));
        assert_eq!(done.get_f64("Rank").unwrap(), 1.0);
        assert_eq!(conduit.busy_workers(), 0);

        conduit.shutdown();
    }

    #[test]
    fn worker_groups_report_once() {
        let config = ConduitConfig::distributed(4).with_workers_per_sample(2);
        let conduit = DistributedConduit::in_process(&config, registry()).unwrap();

        for id in 1..=2 {
            let sample = Sample::new(SampleId(id), Uuid::new_v4(), SampleSpec::new("echo", vec![0.0]));
            conduit.assign(sample).unwrap();
        }
        assert!(conduit.is_leader(SampleId(1), WorkerId(1)));
        assert!(!conduit.is_leader(SampleId(1), WorkerId(2)));
        assert!(conduit.is_leader(SampleId(2), WorkerId(3)));

        let third = Sample::new(SampleId(3), Uuid::new_v4(), SampleSpec::new("echo", vec![0.0]));
        assert!(matches!(
            conduit.assign(third).unwrap_err().error,
            SxError::NoFreeWorker { pool_size: 4 }
        ));

        let events = drain_until(&conduit, |e| {
            e.iter().filter(|e| matches!(e, ConduitEvent::Message(_))).count() == 2
        });
        assert_eq!(events.len(), 2);

        for id in 1..=2 {
            conduit
                .deliver(Message::to_sample(SampleId(id), json!(id)))
                .unwrap();
        }
        let events = drain_until(&conduit, |e| {
            e.iter().filter(|e| matches!(e, ConduitEvent::Completed(_))).count() == 2
                && e.iter().filter(|e| matches!(e, ConduitEvent::Released { .. })).count() == 4
        });
        let leaders: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                ConduitEvent::Completed(s) => s.get_f64("Rank").ok(),
                _ => None,
            })
            .collect();
        assert_eq!(leaders.len(), 2);
        assert!(leaders.contains(&1.0) && leaders.contains(&3.0));
    }

    #[test]
    fn model_errors_keep_their_kind_across_ranks() {
        let config = ConduitConfig::distributed(1);
        let conduit = DistributedConduit::in_process(&config, registry()).unwrap();

        let sample = Sample::new(SampleId(4), Uuid::new_v4(), SampleSpec::new("nan", vec![0.0]));
        conduit.assign(sample).unwrap();
        let events = drain_until(&conduit, |e| {
            e.iter().any(|e| matches!(e, ConduitEvent::Failed { .. }))
        });
        let error = events
            .into_iter()
            .find_map(|e| match e {
                ConduitEvent::Failed { sample_id, error } => {
                    assert_eq!(sample_id, SampleId(4));
                    Some(error)
                }
                _ => None,
            })
            .unwrap();
        assert!(matches!(
            error,
            SxError::Model(sx_types::ModelError::NonFinite { .. })
        ));
        assert!(error.is_fatal());
    }

    #[test]
    fn unreachable_rank_releases_the_rest_of_the_team() {
        let mut world = ChannelTransport::world(3).into_iter();
        let home = world.next().unwrap();
        let leader = world.next().unwrap();
        // Rank 2 never serves; its inbox is gone.
        drop(world.next().unwrap());

        let config = ConduitConfig::distributed(2).with_workers_per_sample(2);
        let registry = registry();
        let rank = RankWorker::new(
            Arc::new(leader),
            Arc::clone(&registry),
            config.coroutine_stack_bytes,
        );
        thread::spawn(move || rank.serve());

        let conduit = DistributedConduit::new(Arc::new(home), &config, registry).unwrap();

        let sample = Sample::new(SampleId(1), Uuid::new_v4(), SampleSpec::new("square", vec![2.0]));
        let unplaced = conduit.assign(sample).unwrap_err();
        assert!(matches!(unplaced.error, SxError::Transport { .. }));
        assert!(unplaced.error.is_fatal());
        assert!(!conduit.is_leader(SampleId(1), WorkerId(1)));
        assert_eq!(conduit.pool.holder(WorkerId(2)), None);

        // The leader already started; it frees its own slot when done.
        drain_until(&conduit, |e| {
            e.iter().any(|e| {
                matches!(e, ConduitEvent::Released { worker, .. } if *worker == WorkerId(1))
            })
        });
        assert_eq!(conduit.busy_workers(), 0);
    }

    #[test]
    fn world_size_must_match_configuration() {
        let world = ChannelTransport::world(2);
        let home = world.into_iter().next().unwrap();
        let config = ConduitConfig::distributed(3);
        assert!(matches!(
            DistributedConduit::new(Arc::new(home), &config, ModelRegistry::new()),
            Err(SxError::Config(_))
        ));
    }
}
