//! Shared helpers for the environment integration tests.

#![allow(dead_code)]

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use vm_env::{
    Environment, EnvironmentConfig, Interpreter, PreemptionSignal, Program, SliceOutcome,
    VmContext,
};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vm_env=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// An interpreter driven by a closure, one call per slice.
pub struct Scripted<F>(F);

impl<F> Interpreter for Scripted<F>
where
    F: FnMut(&mut VmContext, &PreemptionSignal) -> SliceOutcome + Send,
{
    fn run_slice(&mut self, ctx: &mut VmContext, preemption: &PreemptionSignal) -> SliceOutcome {
        (self.0)(ctx, preemption)
    }
}

pub fn scripted<F>(script: F) -> Box<dyn Interpreter>
where
    F: FnMut(&mut VmContext, &PreemptionSignal) -> SliceOutcome + Send + 'static,
{
    Box::new(Scripted(script))
}

/// An interpreter that listens on its VM Port until it is killed.
pub fn listener() -> Box<dyn Interpreter> {
    let mut stream = None;
    scripted(move |ctx, _| {
        if stream.is_none() {
            stream = Some(ctx.get_stream());
        }
        SliceOutcome::Idle
    })
}

pub fn environment<F>(starter: F) -> Environment
where
    F: Fn(&mut VmContext, &Program) -> anyhow::Result<Box<dyn Interpreter>>
        + Send
        + Sync
        + 'static,
{
    init_tracing();
    let config = EnvironmentConfig::default()
        .with_reactor_threads(2)
        .with_preemption_period(Duration::from_millis(2))
        .with_thread_name_prefix("test-vm");
    Environment::new(config, starter).unwrap()
}

/// Run the reactor on another thread and wait for it to return.
pub fn run_reactor(env: &Environment) -> i32 {
    let (tx, rx) = mpsc::channel();
    let env = env.clone();
    thread::spawn(move || {
        let _ = tx.send(env.run_reactor());
    });
    rx.recv_timeout(TIMEOUT)
        .expect("reactor did not stop in time")
}

/// Poll `condition` until it holds or the timeout elapses.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + TIMEOUT;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}
