//! The environment: registry of live engines, the shared reactor and the
//! monitor/termination fan-out.
//!
//! One [`Environment`] is constructed per process and cloned into every
//! engine. Engine insertion and removal happen under the registry lock; the
//! live count is atomic so [`Environment::run_reactor`] can wait for it to
//! reach zero without touching the registry.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vm_store::{Store, Value};

use crate::config::EnvironmentConfig;
use crate::context::VmContext;
use crate::engine::{EXIT_FAILURE, Engine, EngineHandle, EngineId, EngineShared, EngineState};
use crate::error::VmError;
use crate::funnel::{FunnelReceiver, event_funnel};
use crate::interpreter::{BootLoader, EngineStarter, Interpreter, Program};
use crate::monitor::{AddMonitor, death_notice};

#[derive(Debug)]
struct Registry {
    engines: BTreeMap<EngineId, EngineHandle>,
    next_id: u64,
}

impl Registry {
    /// Returns `true` if `id` was handed out at some point.
    fn was_allocated(&self, id: EngineId) -> bool {
        id.0 >= 1 && id.0 < self.next_id
    }
}

struct EnvironmentInner {
    config: EnvironmentConfig,
    registry: Mutex<Registry>,
    alive: AtomicUsize,
    last_exit_code: AtomicI32,
    idle: Notify,
    threads: Mutex<Vec<JoinHandle<()>>>,
    starter: EngineStarter,
    boot_loader: RwLock<Option<BootLoader>>,
    reactor_handle: Handle,
    reactor: Option<Runtime>,
}

impl Drop for EnvironmentInner {
    fn drop(&mut self) {
        if let Some(reactor) = self.reactor.take() {
            reactor.shutdown_background();
        }
    }
}

/// Process-wide engine registry and shared services. Cheap to clone.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvironmentInner>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("config", &self.inner.config)
            .field("live_engines", &self.live_engines())
            .finish()
    }
}

impl Environment {
    /// Build the environment and its reactor. `starter` is called once on
    /// every new engine's thread to build its interpreter.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Reactor`] if the reactor cannot be built.
    pub fn new<F>(config: EnvironmentConfig, starter: F) -> Result<Self, VmError>
    where
        F: Fn(&mut VmContext, &Program) -> anyhow::Result<Box<dyn Interpreter>>
            + Send
            + Sync
            + 'static,
    {
        let reactor = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.reactor_threads.max(1))
            .thread_name(format!("{}-reactor", config.thread_name_prefix))
            .enable_all()
            .build()
            .map_err(VmError::Reactor)?;
        info!(
            reactor_threads = config.reactor_threads,
            preemption_ms = u64::try_from(config.preemption_period.as_millis()).unwrap_or(u64::MAX),
            "environment created"
        );

        Ok(Self {
            inner: Arc::new(EnvironmentInner {
                reactor_handle: reactor.handle().clone(),
                reactor: Some(reactor),
                config,
                registry: Mutex::new(Registry {
                    engines: BTreeMap::new(),
                    next_id: 1,
                }),
                alive: AtomicUsize::new(0),
                last_exit_code: AtomicI32::new(0),
                idle: Notify::new(),
                threads: Mutex::new(Vec::new()),
                starter: Arc::new(starter),
                boot_loader: RwLock::new(None),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &EnvironmentConfig {
        &self.inner.config
    }

    /// Handle to the shared I/O reactor.
    #[must_use]
    pub fn reactor(&self) -> &Handle {
        &self.inner.reactor_handle
    }

    /// Create an engine running `app` and start its thread. `app` is
    /// program source, or a locator for the boot loader when `is_reference`
    /// is set.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Spawn`] if the engine thread cannot be started;
    /// the engine is unregistered again.
    pub fn add_engine(
        &self,
        app: impl Into<String>,
        is_reference: bool,
    ) -> Result<EngineHandle, VmError> {
        let program = Program::new(app, is_reference);
        let (funnel, inbox) = event_funnel();

        let handle = {
            let mut registry = self.inner.registry.lock();
            let id = EngineId(registry.next_id);
            registry.next_id += 1;
            let handle = EngineHandle::new(Arc::new(EngineShared::new(id, funnel)));
            registry.engines.insert(id, handle.clone());
            self.inner.alive.fetch_add(1, Ordering::SeqCst);
            handle
        };
        let id = handle.id();

        let env = self.clone();
        let shared = Arc::clone(&handle.shared);
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.inner.config.thread_name_prefix, id.0))
            .spawn(move || env.run_engine(shared, inbox, program));

        match spawned {
            Ok(thread) => {
                self.inner.threads.lock().push(thread);
                info!(engine_id = %id, "engine added");
                Ok(handle)
            }
            Err(err) => {
                self.inner.registry.lock().engines.remove(&id);
                self.release_live_count();
                warn!(engine_id = %id, error = %err, "failed to spawn engine thread");
                Err(VmError::Spawn(err))
            }
        }
    }

    fn run_engine(&self, shared: Arc<EngineShared>, inbox: FunnelReceiver, program: Program) {
        let ctx = VmContext::new(
            Arc::clone(&shared),
            self.clone(),
            self.inner.reactor_handle.clone(),
        );
        let engine = Engine::new(ctx, inbox, self.inner.config.preemption_period);
        let starter = &self.inner.starter;
        let exit_code = panic::catch_unwind(AssertUnwindSafe(|| engine.run(&program, starter)))
            .unwrap_or_else(|_| {
                error!(engine_id = %shared.id, "engine shutdown panicked");
                shared.set_state(EngineState::Terminated);
                EXIT_FAILURE
            });
        self.engine_terminated(&shared, exit_code);
    }

    /// Fan out death notices, unregister the engine and drop the live count.
    fn engine_terminated(&self, shared: &EngineShared, exit_code: i32) {
        let id = shared.id;
        let monitors = shared.monitors.lock().seal();
        for monitor in monitors {
            self.deliver_death_notice(monitor, id);
        }

        self.inner.registry.lock().engines.remove(&id);
        self.inner.last_exit_code.store(exit_code, Ordering::SeqCst);
        debug!(engine_id = %id, exit_code, "engine unregistered");
        self.release_live_count();
    }

    fn release_live_count(&self) {
        let previous = self.inner.alive.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "live engine count underflow");
        if previous == 1 {
            info!("no live engines left");
            self.inner.idle.notify_waiters();
        }
    }

    fn deliver_death_notice(&self, monitor: EngineId, dead: EngineId) {
        let delivered = self
            .get_engine(monitor)
            .and_then(|handle| handle.send(death_notice(dead)));
        match delivered {
            Ok(()) => debug!(engine_id = %dead, monitor = %monitor, "death notice sent"),
            Err(err) => debug!(engine_id = %dead, monitor = %monitor, %err, "death notice dropped"),
        }
    }

    /// Number of engines that have not reached `Terminated` yet.
    #[must_use]
    pub fn live_engines(&self) -> usize {
        self.inner.alive.load(Ordering::SeqCst)
    }

    /// Look up a live engine.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::UnknownEngine`] if the engine terminated or never
    /// existed.
    pub fn get_engine(&self, id: EngineId) -> Result<EngineHandle, VmError> {
        self.inner
            .registry
            .lock()
            .engines
            .get(&id)
            .cloned()
            .ok_or(VmError::UnknownEngine(id))
    }

    /// Snapshot of the live engine identifiers, in creation order.
    #[must_use]
    pub fn list_engines(&self) -> EngineList {
        let registry = self.inner.registry.lock();
        EngineList(registry.engines.keys().copied().collect())
    }

    /// Ask an engine to stop with `exit_code`. Returns without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::UnknownEngine`] if the engine is not alive.
    pub fn request_termination(&self, id: EngineId, exit_code: i32) -> Result<(), VmError> {
        self.get_engine(id)?.request_termination(exit_code);
        Ok(())
    }

    /// Register `monitor` to receive `terminated(<target>)` on its VM Port
    /// when `target` terminates. Registering the same pair twice has no
    /// further effect. If `target` already terminated, the notice is sent
    /// right away.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::UnknownEngine`] if `target` was never created.
    pub fn add_monitor(&self, monitor: EngineId, target: EngineId) -> Result<(), VmError> {
        let handle = {
            let registry = self.inner.registry.lock();
            match registry.engines.get(&target) {
                Some(handle) => Some(handle.clone()),
                None if registry.was_allocated(target) => None,
                None => return Err(VmError::UnknownEngine(target)),
            }
        };

        let added = match handle {
            Some(handle) => handle.shared.monitors.lock().add(monitor),
            None => AddMonitor::Sealed,
        };
        debug!(engine_id = %target, monitor = %monitor, ?added, "monitor added");
        if added == AddMonitor::Sealed {
            self.deliver_death_notice(monitor, target);
        }
        Ok(())
    }

    /// Pickle `value` from `store` and append it to the VM Port of `to`.
    /// Runs on the sender's thread; decoding happens on the receiver's.
    ///
    /// # Errors
    ///
    /// Returns a store error if `value` is not ground, or
    /// [`VmError::UnknownEngine`] if `to` is not alive.
    pub fn send_to_vm_port(&self, store: &Store, to: EngineId, value: &Value) -> Result<(), VmError> {
        let bytes = vm_store::encode(store, value)?;
        self.get_engine(to)?.send_bytes(bytes)
    }

    /// Install the loader used to resolve program locators.
    pub fn set_boot_loader<F>(&self, loader: F)
    where
        F: Fn(&mut VmContext, &str) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        *self.inner.boot_loader.write() = Some(Arc::new(loader));
    }

    #[must_use]
    pub fn boot_loader(&self) -> Option<BootLoader> {
        self.inner.boot_loader.read().clone()
    }

    /// A version 4 UUID from the requesting engine's own generator.
    pub fn gen_uuid(ctx: &mut VmContext) -> Uuid {
        ctx.gen_uuid()
    }

    /// Block the calling thread until every engine has terminated, then join
    /// the engine threads. Returns the exit code of the last engine to
    /// terminate, or 0 if none ran.
    ///
    /// Must not be called from an engine thread or from within the reactor.
    pub fn run_reactor(&self) -> i32 {
        let inner = &self.inner;
        inner.reactor_handle.block_on(async {
            loop {
                let notified = inner.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if inner.alive.load(Ordering::SeqCst) == 0 {
                    break;
                }
                notified.await;
            }
        });

        let threads = std::mem::take(&mut *inner.threads.lock());
        for thread in threads {
            if thread.join().is_err() {
                warn!("engine thread panicked outside its run loop");
            }
        }
        let exit_code = inner.last_exit_code.load(Ordering::SeqCst);
        info!(exit_code, "reactor stopped");
        exit_code
    }
}

/// Snapshot of live engine identifiers returned by
/// [`Environment::list_engines`]. Iterating does not consume it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineList(Arc<[EngineId]>);

impl EngineList {
    pub fn iter(&self) -> impl Iterator<Item = EngineId> + '_ {
        self.0.iter().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: EngineId) -> bool {
        self.0.contains(&id)
    }

    /// The identifiers as a language list of integers.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::list(self.0.iter().copied().map(Value::from))
    }
}

impl<'a> IntoIterator for &'a EngineList {
    type Item = EngineId;
    type IntoIter = std::iter::Copied<std::slice::Iter<'a, EngineId>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter().copied()
    }
}
