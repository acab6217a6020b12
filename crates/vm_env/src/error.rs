//! Environment-level error types.

use vm_store::{RootId, StoreError, Value};

use crate::engine::EngineId;
use crate::os_error::OsError;

/// Errors surfaced by engines and the environment.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// A system call failed.
    #[error(transparent)]
    Os(#[from] OsError),

    /// An element was appended to a closed VM Port stream.
    #[error("VM port is closed")]
    PortClosed,

    /// No live engine has this identifier.
    #[error("no live engine {0}")]
    UnknownEngine(EngineId),

    /// The feedback node is not pending on this engine (resolved twice, or
    /// issued by another engine).
    #[error("feedback node {0} is not pending")]
    DuplicateResolution(RootId),

    /// The engine stopped accepting events.
    #[error("event funnel is closed")]
    FunnelClosed,

    /// A locator was given but no boot loader is installed.
    #[error("no boot loader installed")]
    NoBootLoader,

    /// The boot loader or engine starter failed.
    #[error("failed to load program: {0}")]
    Load(#[source] anyhow::Error),

    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The engine thread could not be spawned.
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// The shared reactor could not be built.
    #[error("failed to build reactor: {0}")]
    Reactor(#[source] std::io::Error),
}

impl VmError {
    /// Build the language exception raised for this error.
    #[must_use]
    pub fn to_exception(&self) -> Value {
        let kind = match self {
            VmError::Os(err) => return err.to_exception(),
            VmError::PortClosed => "portClosed",
            VmError::UnknownEngine(_) => "unknownVM",
            VmError::DuplicateResolution(_) => "duplicateResolution",
            VmError::FunnelClosed => "terminated",
            VmError::NoBootLoader | VmError::Load(_) => "load",
            VmError::Store(_) => "store",
            VmError::Spawn(_) | VmError::Reactor(_) => "resource",
        };
        Value::record(
            "system",
            vec![Value::record(
                "kernel",
                vec![Value::atom(kind), Value::Str(self.to_string())],
            )],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_error_exception_passthrough() {
        let err: VmError = OsError::new("read", 5, "I/O error").into();
        assert_eq!(err.to_exception(), OsError::new("read", 5, "I/O error").to_exception());
    }

    #[test]
    fn test_port_closed_exception() {
        let exc = VmError::PortClosed.to_exception();
        let kernel = &exc.fields().unwrap()[0];
        assert_eq!(kernel.label(), Some("kernel"));
        assert_eq!(kernel.fields().unwrap()[0], Value::atom("portClosed"));
    }
}
