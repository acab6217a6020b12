//! Engines and their run loop.
//!
//! An engine is one isolated language VM: a store, a dedicated thread and a
//! cooperative scheduler. [`EngineHandle`] is the cross-thread view used by
//! the environment, the reactor and other engines; everything that touches
//! the store goes through the handle's event funnel.
//!
//! The run loop moves through `Starting → Running ⇄ Waiting → Terminating →
//! Terminated`. Between two slices it fires expired alarms, drains the funnel
//! and checks the termination flag, so every cross-thread effect is applied
//! before the interpreter runs again.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use vm_store::Value;

use crate::context::VmContext;
use crate::error::VmError;
use crate::funnel::{EventFunnel, FunnelReceiver};
use crate::interpreter::{EngineStarter, Interpreter, Program, SliceOutcome};
use crate::monitor::MonitorSet;
use crate::timers::PreemptionTimer;

/// Exit code of an engine whose starter failed or whose run loop panicked.
pub const EXIT_FAILURE: i32 = 1;

/// Process-local engine identifier. Assigned from 1 upwards and never
/// reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineId(pub u64);

impl std::fmt::Display for EngineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Engine({})", self.0)
    }
}

impl From<EngineId> for Value {
    fn from(id: EngineId) -> Self {
        Value::Int(i64::try_from(id.0).unwrap_or(i64::MAX))
    }
}

/// Lifecycle state of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Starting = 0,
    Running = 1,
    Waiting = 2,
    Terminating = 3,
    Terminated = 4,
}

impl EngineState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => EngineState::Starting,
            1 => EngineState::Running,
            2 => EngineState::Waiting,
            3 => EngineState::Terminating,
            _ => EngineState::Terminated,
        }
    }
}

/// State of one engine visible from every thread.
pub(crate) struct EngineShared {
    pub(crate) id: EngineId,
    terminated: AtomicBool,
    exit_code: Mutex<Option<i32>>,
    state: AtomicU8,
    pub(crate) monitors: Mutex<MonitorSet>,
    pub(crate) funnel: EventFunnel,
}

impl EngineShared {
    pub(crate) fn new(id: EngineId, funnel: EventFunnel) -> Self {
        Self {
            id,
            terminated: AtomicBool::new(false),
            exit_code: Mutex::new(None),
            state: AtomicU8::new(EngineState::Starting as u8),
            monitors: Mutex::new(MonitorSet::default()),
            funnel,
        }
    }

    /// Set the termination flag and wake the engine. The first exit code
    /// wins. Returns `true` for the first request.
    pub(crate) fn request_termination(&self, exit_code: i32) -> bool {
        let first = {
            let mut code = self.exit_code.lock();
            let first = code.is_none();
            if first {
                *code = Some(exit_code);
            }
            first
        };
        self.terminated.store(true, Ordering::Release);
        self.funnel.wake();
        first
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub(crate) fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    pub(crate) fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: EngineState) {
        let previous = self.state.swap(state as u8, Ordering::AcqRel);
        if previous != state as u8 {
            debug!(engine_id = %self.id, ?state, "engine state changed");
        }
    }
}

impl std::fmt::Debug for EngineShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineShared")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Cross-thread handle to an engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    pub(crate) shared: Arc<EngineShared>,
}

impl EngineHandle {
    pub(crate) fn new(shared: Arc<EngineShared>) -> Self {
        Self { shared }
    }

    #[must_use]
    pub fn id(&self) -> EngineId {
        self.shared.id
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    /// Returns `true` until the engine starts terminating.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.shared.is_terminated()
            && !matches!(
                self.state(),
                EngineState::Terminating | EngineState::Terminated
            )
    }

    /// Ask the engine to stop. Does not wait for it; the first exit code
    /// requested (by anyone, including the engine itself) is kept.
    pub fn request_termination(&self, exit_code: i32) {
        if self.shared.request_termination(exit_code) {
            info!(engine_id = %self.id(), exit_code, "termination requested");
        }
    }

    /// The exit code, once termination has been requested.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.shared.exit_code()
    }

    /// Run `event` on the engine thread.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::FunnelClosed`] once the engine stopped accepting
    /// events.
    pub fn post<F>(&self, event: F) -> Result<u64, VmError>
    where
        F: FnOnce(&mut VmContext) + Send + 'static,
    {
        self.shared.funnel.post(event)
    }

    /// Append `value` to the engine's VM Port stream.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::FunnelClosed`] if the engine is gone. Appending to
    /// a closed stream fails on the engine thread and is logged.
    pub fn send(&self, value: Value) -> Result<(), VmError> {
        self.post(move |ctx| {
            if let Err(err) = ctx.receive(value) {
                warn!(engine_id = %ctx.id(), %err, "dropping VM port message");
            }
        })
        .map(|_| ())
    }

    /// Append a pickled value to the engine's VM Port stream.
    ///
    /// # Errors
    ///
    /// See [`EngineHandle::send`].
    pub fn send_bytes(&self, bytes: Vec<u8>) -> Result<(), VmError> {
        self.post(move |ctx| {
            if let Err(err) = ctx.receive_bytes(&bytes) {
                warn!(engine_id = %ctx.id(), %err, "dropping VM port payload");
            }
        })
        .map(|_| ())
    }

    /// Close the engine's VM Port stream.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::FunnelClosed`] if the engine is gone.
    pub fn close_stream(&self) -> Result<(), VmError> {
        self.post(|ctx| {
            if let Err(err) = ctx.close_stream() {
                warn!(engine_id = %ctx.id(), %err, "failed to close VM port");
            }
        })
        .map(|_| ())
    }
}

/// The thread-owned part of an engine.
pub(crate) struct Engine {
    ctx: VmContext,
    inbox: FunnelReceiver,
    preemption: PreemptionTimer,
}

impl Engine {
    pub(crate) fn new(ctx: VmContext, inbox: FunnelReceiver, preemption_period: Duration) -> Self {
        Self {
            ctx,
            inbox,
            preemption: PreemptionTimer::new(preemption_period),
        }
    }

    /// Run the engine to completion on the calling thread. Returns its exit
    /// code.
    pub(crate) fn run(mut self, program: &Program, starter: &EngineStarter) -> i32 {
        let id = self.ctx.id();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_loop(program, starter)));
        if outcome.is_err() {
            error!(engine_id = %id, "engine run loop panicked");
            self.ctx.request_termination(EXIT_FAILURE);
        }
        self.terminate()
    }

    fn run_loop(&mut self, program: &Program, starter: &EngineStarter) {
        let id = self.ctx.id();
        info!(engine_id = %id, reference = program.is_reference(), "engine starting");

        let mut interpreter: Box<dyn Interpreter> = match starter(&mut self.ctx, program) {
            Ok(interpreter) => interpreter,
            Err(err) => {
                error!(engine_id = %id, error = %err, "failed to start engine");
                self.ctx.request_termination(EXIT_FAILURE);
                return;
            }
        };

        self.ctx.shared().set_state(EngineState::Running);
        self.preemption.start(self.ctx.reactor());
        let signal = self.preemption.signal();

        loop {
            self.ctx.fire_alarms(Instant::now());
            self.inbox.drain(&mut self.ctx);
            if self.ctx.is_terminated() {
                return;
            }

            if self.ctx.store().should_collect() {
                self.ctx.collect_garbage(interpreter.roots());
            }

            self.preemption.rearm();
            match interpreter.run_slice(&mut self.ctx, &signal) {
                SliceOutcome::Yielded => {}
                SliceOutcome::Exit(code) => {
                    info!(engine_id = %id, exit_code = code, "program exited");
                    self.ctx.request_termination(code);
                }
                SliceOutcome::Idle => {
                    if self.inbox.is_empty() && !self.ctx.has_pending_work() {
                        info!(engine_id = %id, "engine idle with no pending work");
                        self.ctx.request_termination(0);
                        continue;
                    }
                    let deadline = self.ctx.next_alarm_deadline();
                    self.ctx.shared().set_state(EngineState::Waiting);
                    let applied = self.inbox.wait(&mut self.ctx, deadline);
                    self.ctx.shared().set_state(EngineState::Running);
                    debug!(engine_id = %id, applied, "engine woke up");
                }
            }
        }
    }

    fn terminate(mut self) -> i32 {
        let id = self.ctx.id();
        self.ctx.shared().set_state(EngineState::Terminating);
        self.preemption.stop();

        self.ctx.funnel().close();
        let drained = self.drain_on_shutdown();
        let alarms = self.ctx.clear_alarms();
        let abandoned = self.ctx.abandon_feedback();
        if abandoned > 0 {
            warn!(engine_id = %id, pending = abandoned, "abandoning unresolved feedback nodes");
        }
        if let Err(err) = self.ctx.close_stream() {
            debug!(engine_id = %id, %err, "VM port close failed");
        }

        self.ctx.shared().set_state(EngineState::Terminated);
        let exit_code = self.ctx.shared().exit_code().unwrap_or(0);
        info!(
            engine_id = %id,
            exit_code,
            drained,
            alarms,
            applied = self.inbox.applied(),
            "engine terminated"
        );
        exit_code
    }

    /// Apply the entries still queued. A panicking entry is skipped and
    /// marks the engine as failed; the rest are still applied.
    fn drain_on_shutdown(&mut self) -> usize {
        let mut drained = 0;
        loop {
            match panic::catch_unwind(AssertUnwindSafe(|| self.inbox.drain(&mut self.ctx))) {
                Ok(count) => return drained + count,
                Err(_) => {
                    error!(engine_id = %self.ctx.id(), "funnel entry panicked during shutdown");
                    self.ctx.request_termination(EXIT_FAILURE);
                    drained += 1;
                }
            }
        }
    }
}
