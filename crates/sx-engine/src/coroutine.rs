//! Suspendable execution contexts.
//!
//! A [`Coroutine`] runs its body on a dedicated thread, but control is handed
//! back and forth with a rendezvous baton so that exactly one side (owner or
//! body) executes at any time. The body receives a [`Suspender`] and may call
//! [`Suspender::suspend`] any number of times; each call returns control to
//! whoever last called [`Coroutine::resume`].

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{trace, warn};

use sx_types::{internal_error, ProtocolViolation, SxError, SxResult};

/// Why the body handed control back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    /// Resume as soon as possible.
    Yield,
    /// Resume once a message has been deposited for the sample.
    AwaitMessage,
}

/// Outcome of one [`Coroutine::resume`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Suspended(SuspendReason),
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineState {
    Created,
    Running,
    Suspended,
    Finished,
}

enum Signal {
    Resume,
    Cancel,
}

enum Handoff {
    Suspended(SuspendReason),
    Returned,
    Panicked(String),
}

/// Handle given to a coroutine body for yielding control.
pub struct Suspender {
    context: String,
    body_thread: ThreadId,
    signals: Receiver<Signal>,
    handoffs: Sender<Handoff>,
}

impl Suspender {
    /// Yield to the owner and block until resumed.
    ///
    /// Fails with `SuspendOutsideRunningContext` when called from any thread
    /// other than the body's own, and with `Abandoned` when the owner dropped
    /// the coroutine instead of resuming it.
    pub fn suspend(&self, reason: SuspendReason) -> SxResult<()> {
        if thread::current().id() != self.body_thread {
            return Err(ProtocolViolation::SuspendOutsideRunningContext {
                context: self.context.clone(),
            }
            .into());
        }

        trace!(context = %self.context, ?reason, "suspending");
        if self.handoffs.send(Handoff::Suspended(reason)).is_err() {
            return Err(self.abandoned());
        }

        match self.signals.recv() {
            Ok(Signal::Resume) => Ok(()),
            Ok(Signal::Cancel) | Err(_) => Err(self.abandoned()),
        }
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    fn abandoned(&self) -> SxError {
        ProtocolViolation::Abandoned {
            context: self.context.clone(),
        }
        .into()
    }
}

/// A suspendable task producing a `T` when its body returns.
pub struct Coroutine<T> {
    context: String,
    state: CoroutineState,
    signals: Sender<Signal>,
    handoffs: Receiver<Handoff>,
    result: Arc<Mutex<Option<SxResult<T>>>>,
}

impl<T: Send + 'static> Coroutine<T> {
    /// Create a coroutine. The body does not start until the first `resume`.
    pub fn spawn<F>(context: impl Into<String>, stack_bytes: usize, body: F) -> SxResult<Self>
    where
        F: FnOnce(&Suspender) -> SxResult<T> + Send + 'static,
    {
        let context = context.into();
        let (signal_tx, signal_rx) = bounded::<Signal>(1);
        let (handoff_tx, handoff_rx) = bounded::<Handoff>(1);
        let result = Arc::new(Mutex::new(None));

        let body_result = Arc::clone(&result);
        let body_context = context.clone();
        thread::Builder::new()
            .name(context.clone())
            .stack_size(stack_bytes)
            .spawn(move || {
                // Wait for the first resume; a cancel here means the body never runs.
                match signal_rx.recv() {
                    Ok(Signal::Resume) => {}
                    Ok(Signal::Cancel) | Err(_) => return,
                }

                let suspender = Suspender {
                    context: body_context,
                    body_thread: thread::current().id(),
                    signals: signal_rx,
                    handoffs: handoff_tx.clone(),
                };

                let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&suspender)));
                let handoff = match outcome {
                    Ok(value) => {
                        *body_result.lock() = Some(value);
                        Handoff::Returned
                    }
                    Err(payload) => Handoff::Panicked(panic_message(payload.as_ref())),
                };
                // The owner may already be gone; nothing left to report to.
                let _ = handoff_tx.send(handoff);
            })?;

        Ok(Self {
            context,
            state: CoroutineState::Created,
            signals: signal_tx,
            handoffs: handoff_rx,
            result,
        })
    }

    /// Transfer control into the body until it suspends or returns.
    pub fn resume(&mut self) -> SxResult<Step> {
        match self.state {
            CoroutineState::Finished => {
                return Err(ProtocolViolation::ResumeAfterFinish {
                    context: self.context.clone(),
                }
                .into())
            }
            CoroutineState::Running => {
                return Err(ProtocolViolation::DoubleResume {
                    context: self.context.clone(),
                }
                .into())
            }
            CoroutineState::Created | CoroutineState::Suspended => {}
        }

        self.state = CoroutineState::Running;
        if self.signals.send(Signal::Resume).is_err() {
            self.state = CoroutineState::Finished;
            return Err(internal_error!("{}: execution context exited unexpectedly", self.context));
        }

        match self.handoffs.recv() {
            Ok(Handoff::Suspended(reason)) => {
                self.state = CoroutineState::Suspended;
                Ok(Step::Suspended(reason))
            }
            Ok(Handoff::Returned) => {
                self.state = CoroutineState::Finished;
                Ok(Step::Finished)
            }
            Ok(Handoff::Panicked(message)) => {
                self.state = CoroutineState::Finished;
                warn!(context = %self.context, %message, "coroutine body panicked");
                *self.result.lock() = Some(Err(internal_error!(
                    "{}: panicked: {}",
                    self.context,
                    message
                )));
                Ok(Step::Finished)
            }
            Err(_) => {
                self.state = CoroutineState::Finished;
                Err(internal_error!("{}: execution context exited unexpectedly", self.context))
            }
        }
    }

    pub fn state(&self) -> CoroutineState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == CoroutineState::Finished
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    /// Take the body's return value. `None` until the coroutine has finished,
    /// and after the value has been taken once.
    pub fn take_result(&mut self) -> Option<SxResult<T>> {
        if self.state != CoroutineState::Finished {
            return None;
        }
        self.result.lock().take()
    }
}

impl<T> Drop for Coroutine<T> {
    fn drop(&mut self) {
        if matches!(self.state, CoroutineState::Created | CoroutineState::Suspended) {
            trace!(context = %self.context, "abandoning unfinished coroutine");
            // The body observes Abandoned from its pending suspend and unwinds
            // on its own thread; the thread is detached.
            let _ = self.signals.send(Signal::Cancel);
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STACK: usize = 256 * 1024;

    #[test]
    fn body_does_not_start_before_first_resume() {
        let started = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&started);
        let mut co = Coroutine::spawn("lazy", STACK, move |_| {
            *flag.lock() = true;
            Ok(())
        })
        .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!*started.lock());
        assert_eq!(co.state(), CoroutineState::Created);

        assert_eq!(co.resume().unwrap(), Step::Finished);
        assert!(*started.lock());
    }

    #[test]
    fn suspends_and_resumes_where_it_left_off() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&trace);
        let mut co = Coroutine::spawn("counter", STACK, move |s| {
            for i in 0..3 {
                log.lock().push(i);
                s.suspend(SuspendReason::Yield)?;
            }
            Ok(42)
        })
        .unwrap();

        for expected_len in 1..=3 {
            assert_eq!(co.resume().unwrap(), Step::Suspended(SuspendReason::Yield));
            assert_eq!(trace.lock().len(), expected_len);
        }
        assert_eq!(co.resume().unwrap(), Step::Finished);
        assert_eq!(co.take_result().unwrap().unwrap(), 42);
        assert!(co.take_result().is_none());
    }

    #[test]
    fn resume_after_finish_is_rejected() {
        let mut co = Coroutine::spawn("once", STACK, |_| Ok(())).unwrap();
        co.resume().unwrap();
        match co.resume() {
            Err(SxError::Protocol(ProtocolViolation::ResumeAfterFinish { context })) => {
                assert_eq!(context, "once")
            }
            other => panic!("expected ResumeAfterFinish, got {other:?}"),
        }
    }

    #[test]
    fn suspend_from_foreign_thread_is_rejected() {
        let (tx, rx) = bounded::<SxResult<()>>(1);
        let mut co = Coroutine::spawn("escape", STACK, move |s| {
            // Borrow the suspender from a scoped thread that is not the body.
            let outcome = std::thread::scope(|scope| {
                scope
                    .spawn(|| s.suspend(SuspendReason::Yield))
                    .join()
                    .unwrap()
            });
            tx.send(outcome).unwrap();
            Ok(())
        })
        .unwrap();

        assert_eq!(co.resume().unwrap(), Step::Finished);
        assert!(matches!(
            rx.recv().unwrap(),
            Err(SxError::Protocol(
                ProtocolViolation::SuspendOutsideRunningContext { .. }
            ))
        ));
    }

    #[test]
    fn panics_become_errors() {
        let mut co: Coroutine<()> =
            Coroutine::spawn("boom", STACK, |_| panic!("model exploded")).unwrap();
        assert_eq!(co.resume().unwrap(), Step::Finished);
        let err = co.take_result().unwrap().unwrap_err();
        assert!(err.to_string().contains("model exploded"));
    }

    #[test]
    fn dropping_a_suspended_coroutine_abandons_the_body() {
        let (tx, rx) = bounded::<bool>(1);
        let mut co = Coroutine::spawn("dropped", STACK, move |s| {
            let outcome = s.suspend(SuspendReason::Yield);
            let abandoned = matches!(
                outcome,
                Err(SxError::Protocol(ProtocolViolation::Abandoned { .. }))
            );
            tx.send(abandoned).unwrap();
            outcome
        })
        .unwrap();
        co.resume().unwrap();
        drop(co);

        let abandoned = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .unwrap();
        assert!(abandoned);
    }
}
