//! Worker loop: runs one sample at a time on a coroutine and reports back.
//!
//! The same loop backs the worker threads of the local conduit and the
//! worker ranks of the distributed conduit. Only the [`Uplink`] differs.

use crossbeam_channel::{Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace, warn};

use sx_types::{Message, ModelError, Sample, SampleId, SxError, SxResult, WorkerId};

use crate::context::{SampleCell, SampleContext};
use crate::coroutine::{panic_message, Coroutine, Step, SuspendReason};
use crate::registry::ModelFn;

/// Where a worker reports what its samples do.
pub trait Uplink: Send + Sync {
    /// A leader's callback sent a message to the solver.
    fn message(&self, message: Message) -> SxResult<()>;

    /// The worker no longer holds `sample_id`. Always reported before
    /// `finished` so that the slot is free when the result is observed.
    fn released(&self, worker: WorkerId, sample_id: SampleId) -> SxResult<()>;

    /// A leader's sample reached Finished.
    fn finished(&self, worker: WorkerId, sample: Sample) -> SxResult<()>;

    /// A participant's callback failed; fatal for the run.
    fn failed(&self, worker: WorkerId, sample_id: SampleId, error: SxError) -> SxResult<()>;
}

/// One worker's share of a sample.
pub struct Participant {
    pub cell: Arc<SampleCell>,
    pub model: ModelFn,
    pub leader: bool,
}

pub enum Command {
    Run(Participant),
    /// Mail was deposited for the current sample.
    Wake,
    Shutdown,
}

enum Outcome {
    Idle,
    Stop,
}

pub struct WorkerLoop {
    worker: WorkerId,
    commands: Receiver<Command>,
    uplink: Arc<dyn Uplink>,
    stack_bytes: usize,
}

impl WorkerLoop {
    pub fn new(
        worker: WorkerId,
        commands: Receiver<Command>,
        uplink: Arc<dyn Uplink>,
        stack_bytes: usize,
    ) -> Self {
        Self {
            worker,
            commands,
            uplink,
            stack_bytes,
        }
    }

    /// Run the loop on its own thread.
    pub fn start(self) -> SxResult<JoinHandle<()>> {
        let handle = thread::Builder::new()
            .name(format!("sx-{}", self.worker))
            .spawn(move || self.run())?;
        Ok(handle)
    }

    /// Serve commands until shutdown or until the command channel closes.
    pub fn run(self) {
        debug!(worker = %self.worker, "worker started");
        while let Ok(command) = self.commands.recv() {
            match command {
                Command::Run(participant) => {
                    if let Outcome::Stop = self.drive(participant) {
                        break;
                    }
                }
                Command::Wake => trace!(worker = %self.worker, "stale wake ignored"),
                Command::Shutdown => break,
            }
        }
        debug!(worker = %self.worker, "worker stopped");
    }

    fn drive(&self, participant: Participant) -> Outcome {
        let cell = Arc::clone(&participant.cell);
        let sample_id = cell.id();
        let leader = participant.leader;

        let (result, outcome) = match self.execute(participant) {
            Ok(outcome) => (Ok(()), outcome),
            Err((error, outcome)) => (Err(error), outcome),
        };

        if let Outcome::Stop = outcome {
            // Shut down mid-sample: the coroutine has been dropped and nothing
            // about this sample is reported.
            debug!(worker = %self.worker, %sample_id, "sample abandoned at shutdown");
            return Outcome::Stop;
        }

        let report = self.uplink.released(self.worker, sample_id).and_then(|_| match result {
            Ok(()) if leader => self.uplink.finished(self.worker, cell.snapshot()),
            Ok(()) => Ok(()),
            Err(error) => {
                error!(worker = %self.worker, %sample_id, %error, "sample failed");
                self.uplink.failed(self.worker, sample_id, error)
            }
        });
        if let Err(e) = report {
            warn!(worker = %self.worker, %sample_id, error = %e, "uplink report failed");
        }
        Outcome::Idle
    }

    /// Drive a sample's coroutine to completion.
    fn execute(&self, participant: Participant) -> Result<Outcome, (SxError, Outcome)> {
        let Participant { cell, model, leader } = participant;
        let sample_id = cell.id();

        cell.with_sample(|s| s.mark_running(self.worker))
            .map_err(|e| (e, Outcome::Idle))?;
        debug!(worker = %self.worker, %sample_id, leader, "sample running");

        let body_cell = Arc::clone(&cell);
        let uplink = Arc::clone(&self.uplink);
        let worker = self.worker;
        let stack_bytes = self.stack_bytes;
        let mut coroutine = Coroutine::spawn(
            format!("sample-{sample_id}"),
            stack_bytes,
            move |suspender| {
                let mut ctx =
                    SampleContext::new(body_cell, suspender, uplink, worker, leader, stack_bytes);
                panic::catch_unwind(AssertUnwindSafe(|| model(&mut ctx))).unwrap_or_else(
                    |payload| {
                        Err(ModelError::Panicked {
                            sample_id,
                            message: panic_message(payload.as_ref()),
                        }
                        .into())
                    },
                )
            },
        )
        .map_err(|e| (e, Outcome::Idle))?;

        loop {
            match coroutine.resume().map_err(|e| (e, Outcome::Idle))? {
                Step::Suspended(SuspendReason::Yield) => continue,
                Step::Suspended(SuspendReason::AwaitMessage) => {
                    if let Outcome::Stop = self.await_mail(&cell) {
                        return Ok(Outcome::Stop);
                    }
                }
                Step::Finished => break,
            }
        }

        match coroutine.take_result() {
            Some(Ok(())) | None => {}
            Some(Err(e)) => return Err((e, Outcome::Idle)),
        }
        cell.with_sample(|s| s.mark_finished())
            .map_err(|e| (e, Outcome::Idle))?;
        debug!(worker = %self.worker, %sample_id, "sample finished");
        Ok(Outcome::Idle)
    }

    /// Block until mail is available for `cell`.
    fn await_mail(&self, cell: &SampleCell) -> Outcome {
        while !cell.has_mail() {
            match self.commands.recv() {
                Ok(Command::Wake) => continue,
                Ok(Command::Run(other)) => {
                    // The pool map never hands a busy worker a second sample.
                    let error = sx_types::ProtocolViolation::WorkerAlreadyAssigned {
                        worker: self.worker,
                        holding: cell.id(),
                        requested: other.cell.id(),
                    };
                    error!(worker = %self.worker, %error, "double assignment");
                    if let Err(e) = self.uplink.failed(self.worker, other.cell.id(), error.into()) {
                        error!(worker = %self.worker, error = %e, "uplink closed, stopping worker");
                        return Outcome::Stop;
                    }
                }
                Ok(Command::Shutdown) | Err(_) => return Outcome::Stop,
            }
        }
        Outcome::Idle
    }
}

/// A worker loop running on its own thread, addressed by command channel.
pub struct WorkerHandle {
    pub worker: WorkerId,
    pub commands: Sender<Command>,
    pub thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn send(&self, command: Command) -> SxResult<()> {
        self.commands.send(command).map_err(|_| SxError::Transport {
            message: format!("{} is no longer accepting commands", self.worker),
        })
    }

    pub fn stop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(worker = %self.worker, "worker thread panicked");
            }
        }
    }
}
