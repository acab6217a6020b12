//! # vm_env
//!
//! Execution environment for many independent VM engines.
//!
//! Each engine owns a store and a dedicated thread running a cooperative
//! scheduler over lightweight language threads. All engines share a single
//! asynchronous I/O reactor. The reactor never touches a store: completed
//! operations are posted as closures into the target engine's
//! [`EventFunnel`], which only the owning thread drains.
//!
//! This crate provides:
//!
//! - [`Environment`]: the engine registry, the shared reactor and the
//!   monitor/termination fan-out.
//! - [`EngineHandle`]: a cross-thread handle to one engine.
//! - [`VmContext`]: the thread-owned engine state handed to the
//!   interpreter and to every funnel closure.
//! - [`funnel`]: the cross-thread event funnel.
//! - [`feedback`]: GC-rooted placeholders for pending asynchronous results.
//! - [`port`]: the VM Port inbound stream.
//! - [`timers`]: preemption and alarm timers.
//! - [`time`]: conversions between language timestamps and calendar time.
//! - [`interpreter`]: the seams to the interpreter, starter and boot loader.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use vm_env::{Environment, EnvironmentConfig, Interpreter, SliceOutcome};
//!
//! struct Halt;
//!
//! impl Interpreter for Halt {
//!     fn run_slice(
//!         &mut self,
//!         _ctx: &mut vm_env::VmContext,
//!         _preemption: &vm_env::PreemptionSignal,
//!     ) -> SliceOutcome {
//!         SliceOutcome::Exit(0)
//!     }
//! }
//!
//! let env = Environment::new(EnvironmentConfig::default(), |_ctx, _program| {
//!     Ok(Box::new(Halt) as Box<dyn Interpreter>)
//! })
//! .unwrap();
//! env.add_engine("main", false).unwrap();
//! std::process::exit(env.run_reactor());
//! ```

pub mod config;
pub mod context;
pub mod engine;
pub mod environment;
pub mod error;
pub mod feedback;
pub mod funnel;
pub mod interpreter;
pub mod monitor;
pub mod os_error;
pub mod port;
pub mod time;
pub mod timers;

pub use config::EnvironmentConfig;
pub use context::VmContext;
pub use engine::{EngineHandle, EngineId, EngineState};
pub use environment::{EngineList, Environment};
pub use error::VmError;
pub use feedback::FeedbackHandle;
pub use funnel::EventFunnel;
pub use interpreter::{BootLoader, EngineStarter, Interpreter, Program, SliceOutcome};
pub use os_error::OsError;
pub use timers::{AlarmId, PreemptionSignal};
