//! Seams to the external collaborators: the interpreter that executes
//! language code, the starter that builds one per engine, and the boot
//! loader that resolves program locators.

use std::sync::Arc;

use vm_store::{NodeRef, Value};

use crate::context::VmContext;
use crate::error::VmError;
use crate::timers::PreemptionSignal;

/// The initial program of an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Program {
    /// Program source given by value.
    Inline(String),
    /// A textual locator resolved through the [`BootLoader`].
    Locator(String),
}

impl Program {
    /// Build a program from the arguments of
    /// [`Environment::add_engine`](crate::Environment::add_engine).
    #[must_use]
    pub fn new(app: impl Into<String>, is_reference: bool) -> Self {
        let app = app.into();
        if is_reference {
            Program::Locator(app)
        } else {
            Program::Inline(app)
        }
    }

    /// The source text or the locator.
    #[must_use]
    pub fn source(&self) -> &str {
        match self {
            Program::Inline(source) | Program::Locator(source) => source,
        }
    }

    #[must_use]
    pub fn is_reference(&self) -> bool {
        matches!(self, Program::Locator(_))
    }

    /// Turn the program into a value the interpreter can run. Inline source
    /// becomes a string; a locator goes through the boot loader.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::NoBootLoader`] or [`VmError::Load`] for a locator
    /// that cannot be resolved.
    pub fn load(&self, ctx: &mut VmContext) -> Result<Value, VmError> {
        match self {
            Program::Inline(source) => Ok(Value::Str(source.clone())),
            Program::Locator(url) => ctx.boot_load(url),
        }
    }
}

/// What happened during one scheduling slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceOutcome {
    /// Threads are still runnable; the slice ended on preemption or quota.
    Yielded,
    /// No lightweight thread is runnable.
    Idle,
    /// The program exited voluntarily.
    Exit(i32),
}

/// The language interpreter driven by an engine's run loop.
pub trait Interpreter: Send {
    /// Run lightweight threads until `preemption` is requested, nothing is
    /// runnable, or the program exits.
    fn run_slice(&mut self, ctx: &mut VmContext, preemption: &PreemptionSignal) -> SliceOutcome;

    /// Nodes the interpreter keeps alive across a collection.
    fn roots(&self) -> Vec<NodeRef> {
        Vec::new()
    }
}

/// Called once on each new engine's thread to build its interpreter. An
/// error terminates the engine with exit code 1.
pub type EngineStarter =
    Arc<dyn Fn(&mut VmContext, &Program) -> anyhow::Result<Box<dyn Interpreter>> + Send + Sync>;

/// Resolves a program locator into a runnable value.
pub type BootLoader = Arc<dyn Fn(&mut VmContext, &str) -> anyhow::Result<Value> + Send + Sync>;
