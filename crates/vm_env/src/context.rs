//! The thread-owned state of one engine.
//!
//! [`VmContext`] is handed to the interpreter on every slice and to every
//! closure applied from the event funnel. It owns the store and everything
//! that must only be mutated by the engine thread: the feedback registry,
//! the VM Port stream, the alarms and the random generator.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::runtime::Handle;
use tracing::{debug, warn};
use uuid::Uuid;
use vm_store::{CollectStats, NodeRef, Store, Value};

use crate::engine::{EngineId, EngineShared};
use crate::environment::Environment;
use crate::error::VmError;
use crate::feedback::{FeedbackHandle, FeedbackRegistry};
use crate::funnel::EventFunnel;
use crate::os_error::OsError;
use crate::port::VmPort;
use crate::time;
use crate::timers::{AlarmId, AlarmQueue};

/// Engine state owned by the engine thread.
pub struct VmContext {
    shared: Arc<EngineShared>,
    env: Environment,
    store: Store,
    feedback: FeedbackRegistry,
    port: VmPort,
    alarms: AlarmQueue,
    rng: StdRng,
    reactor: Handle,
}

impl std::fmt::Debug for VmContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmContext")
            .field("id", &self.shared.id)
            .field("nodes", &self.store.len())
            .field("pending", &self.feedback.pending())
            .field("alarms", &self.alarms.len())
            .field("port", &self.port)
            .finish()
    }
}

impl VmContext {
    pub(crate) fn new(shared: Arc<EngineShared>, env: Environment, reactor: Handle) -> Self {
        let mut store = Store::new();
        let port = VmPort::new(&mut store);
        Self {
            feedback: FeedbackRegistry::new(shared.id),
            shared,
            env,
            store,
            port,
            alarms: AlarmQueue::new(),
            rng: StdRng::from_entropy(),
            reactor,
        }
    }

    #[must_use]
    pub fn id(&self) -> EngineId {
        self.shared.id
    }

    /// The environment this engine belongs to.
    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.env
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    /// This engine's own funnel, for handing to other threads.
    #[must_use]
    pub fn funnel(&self) -> &EventFunnel {
        &self.shared.funnel
    }

    /// The shared I/O reactor.
    #[must_use]
    pub fn reactor(&self) -> &Handle {
        &self.reactor
    }

    pub(crate) fn shared(&self) -> &EngineShared {
        &self.shared
    }

    // Feedback nodes.

    /// Protect an existing placeholder until its operation completes.
    pub fn alloc_feedback_node(&mut self, node: NodeRef) -> FeedbackHandle {
        self.feedback.allocate(&mut self.store, node)
    }

    /// Create a protected placeholder. The returned value is a read-only
    /// view usable before the result arrives.
    pub fn create_feedback_node(&mut self) -> (FeedbackHandle, Value) {
        self.feedback.create(&mut self.store)
    }

    /// Bind (`Ok`) or fail (`Err`) a placeholder and release it.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::DuplicateResolution`] for a handle that is not
    /// pending on this engine.
    pub fn resolve_and_release(
        &mut self,
        handle: FeedbackHandle,
        outcome: Result<Value, Value>,
    ) -> Result<(), VmError> {
        self.feedback
            .resolve_and_release(&mut self.store, handle, outcome)
    }

    /// # Errors
    ///
    /// See [`VmContext::resolve_and_release`].
    pub fn bind_and_release(&mut self, handle: FeedbackHandle, value: Value) -> Result<(), VmError> {
        self.resolve_and_release(handle, Ok(value))
    }

    /// # Errors
    ///
    /// See [`VmContext::resolve_and_release`].
    pub fn raise_and_release(&mut self, handle: FeedbackHandle, error: Value) -> Result<(), VmError> {
        self.resolve_and_release(handle, Err(error))
    }

    /// Number of unresolved feedback nodes.
    #[must_use]
    pub fn pending_async(&self) -> usize {
        self.feedback.pending()
    }

    /// Run `future` on the shared reactor and deliver its outcome into a new
    /// placeholder, which is returned immediately.
    ///
    /// A successful output is bound; an I/O error is raised as the
    /// exception of an [`OsError`] named after `function`. The result is
    /// applied through this engine's funnel. It is dropped if the engine
    /// terminated in the meantime.
    pub fn spawn_io<T, Fut>(&mut self, function: &'static str, future: Fut) -> Value
    where
        T: Into<Value> + Send + 'static,
        Fut: Future<Output = io::Result<T>> + Send + 'static,
    {
        let (handle, view) = self.create_feedback_node();
        let funnel = self.funnel().clone();
        let engine_id = self.id();
        debug!(engine_id = %engine_id, function, %handle, "issuing async operation");

        self.reactor.spawn(async move {
            let outcome = future
                .await
                .map(Into::into)
                .map_err(|err| OsError::from_io(function, &err).to_exception());
            let posted = funnel.post(move |ctx| {
                if let Err(err) = ctx.resolve_and_release(handle, outcome) {
                    warn!(engine_id = %ctx.id(), function, %err, "completion not applied");
                }
            });
            if posted.is_err() {
                debug!(engine_id = %engine_id, function, "engine gone, dropping completion");
            }
        });
        view
    }

    // VM Port.

    /// The unconsumed head of the VM Port stream.
    pub fn get_stream(&mut self) -> Value {
        self.port.get_stream(&mut self.store)
    }

    /// # Errors
    ///
    /// Returns a store error if the stream tail cannot be bound.
    pub fn close_stream(&mut self) -> Result<(), VmError> {
        self.port.close(&mut self.store)
    }

    /// # Errors
    ///
    /// Returns [`VmError::PortClosed`] once the stream is closed.
    pub fn receive(&mut self, value: Value) -> Result<(), VmError> {
        self.port.receive(&mut self.store, value)
    }

    /// # Errors
    ///
    /// Returns [`VmError::PortClosed`] once the stream is closed, or a store
    /// error for an invalid payload.
    pub fn receive_bytes(&mut self, bytes: &[u8]) -> Result<(), VmError> {
        self.port.receive_bytes(&mut self.store, bytes)
    }

    #[must_use]
    pub fn stream_requested(&self) -> bool {
        self.port.stream_requested()
    }

    #[must_use]
    pub fn port_closed(&self) -> bool {
        self.port.is_closed()
    }

    // Alarms.

    /// Run `wake` on this engine after `delay`.
    pub fn set_alarm<F>(&mut self, delay: Duration, wake: F) -> AlarmId
    where
        F: FnOnce(&mut VmContext) + Send + 'static,
    {
        self.alarms.schedule(Instant::now() + delay, Box::new(wake))
    }

    /// Run `wake` at `millis`, a language timestamp in milliseconds since
    /// the Unix epoch. Timestamps in the past fire on the next slice.
    pub fn set_alarm_at<F>(&mut self, millis: i64, wake: F) -> AlarmId
    where
        F: FnOnce(&mut VmContext) + Send + 'static,
    {
        let deadline = time::reference_time_to_instant(millis);
        self.alarms.schedule(deadline, Box::new(wake))
    }

    /// Returns `false` if the alarm already fired.
    pub fn cancel_alarm(&mut self, id: AlarmId) -> bool {
        self.alarms.cancel(id)
    }

    pub(crate) fn fire_alarms(&mut self, now: Instant) -> usize {
        self.alarms.fire_expired(now, &self.shared.funnel)
    }

    pub(crate) fn next_alarm_deadline(&self) -> Option<Instant> {
        self.alarms.next_deadline()
    }

    pub(crate) fn clear_alarms(&mut self) -> usize {
        self.alarms.clear()
    }

    // Environment services.

    /// A fresh version 4 UUID from this engine's own generator.
    pub fn gen_uuid(&mut self) -> Uuid {
        let mut bytes = [0u8; 16];
        self.rng.fill_bytes(&mut bytes);
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }

    /// This engine's random generator.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Resolve a program locator through the environment's boot loader.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::NoBootLoader`] if none is installed, or
    /// [`VmError::Load`] if the loader fails.
    pub fn boot_load(&mut self, url: &str) -> Result<Value, VmError> {
        let loader = self.env.boot_loader().ok_or(VmError::NoBootLoader)?;
        loader(self, url).map_err(VmError::Load)
    }

    /// Get notified on the VM Port when `target` terminates.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::UnknownEngine`] if `target` was never created.
    pub fn add_monitor(&self, target: EngineId) -> Result<(), VmError> {
        self.env.add_monitor(self.id(), target)
    }

    /// Pickle `value` and append it to another engine's VM Port.
    ///
    /// # Errors
    ///
    /// Returns a store error if `value` is not ground, or
    /// [`VmError::UnknownEngine`] if `to` is not alive.
    pub fn send_to_vm_port(&self, to: EngineId, value: &Value) -> Result<(), VmError> {
        self.env.send_to_vm_port(&self.store, to, value)
    }

    /// Terminate this engine after the current slice.
    pub fn request_termination(&self, exit_code: i32) {
        self.shared.request_termination(exit_code);
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.shared.is_terminated()
    }

    // Run loop support.

    /// Collect the store, keeping `roots` and every protected node alive.
    pub fn collect_garbage<I>(&mut self, roots: I) -> CollectStats
    where
        I: IntoIterator<Item = NodeRef>,
    {
        let stats = self.store.collect(roots);
        debug!(engine_id = %self.id(), live = stats.live, freed = stats.freed, "store collected");
        stats
    }

    /// Returns `true` while something outside the interpreter can still
    /// wake the engine: a pending async operation, an armed alarm or a
    /// listened-to VM Port.
    #[must_use]
    pub fn has_pending_work(&self) -> bool {
        self.feedback.pending() > 0 || !self.alarms.is_empty() || self.port.is_listening()
    }

    pub(crate) fn abandon_feedback(&mut self) -> usize {
        let reason = Value::record("system", vec![Value::atom("terminated")]);
        self.feedback.abandon_all(&mut self.store, &reason)
    }
}
