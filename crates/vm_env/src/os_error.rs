//! Operating-system error translation.
//!
//! Collaborators performing system calls (files, sockets, timers) report
//! failures as an [`OsError`]. Direct calls return it through
//! [`VmError::Os`](crate::VmError::Os); asynchronous operations raise
//! [`OsError::to_exception`] into the feedback node of the operation.

use std::io;

use vm_store::Value;

use crate::error::VmError;

/// A failed operating-system level operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{function}: {message} (os error {code})")]
pub struct OsError {
    /// Name of the failing operation, e.g. `"open"`.
    pub function: String,
    /// Platform error code (errno on Unix), 0 when none is available.
    pub code: i64,
    /// Human-readable description of the error.
    pub message: String,
    /// Optional contextual arguments (file name, address, ...).
    pub args: Vec<Value>,
}

impl OsError {
    /// Build an error from its parts.
    #[must_use]
    pub fn new(function: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            code,
            message: message.into(),
            args: Vec::new(),
        }
    }

    /// Build an error from a raw platform error code. The message is the
    /// platform's description of the code.
    #[must_use]
    pub fn from_code(function: impl Into<String>, errnum: i32) -> Self {
        let message = io::Error::from_raw_os_error(errnum).to_string();
        Self::new(function, i64::from(errnum), message)
    }

    /// Translate an [`io::Error`].
    #[must_use]
    pub fn from_io(function: impl Into<String>, error: &io::Error) -> Self {
        let code = error.raw_os_error().map_or(0, i64::from);
        Self::new(function, code, error.to_string())
    }

    /// Translate the calling thread's last OS error.
    #[must_use]
    pub fn last(function: impl Into<String>) -> Self {
        Self::from_io(function, &io::Error::last_os_error())
    }

    /// Attach a contextual argument.
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Build the language exception for this error:
    /// `system(os(os <function> <code> <message> <args>...))`.
    #[must_use]
    pub fn to_exception(&self) -> Value {
        let mut fields = vec![
            Value::atom("os"),
            Value::Str(self.function.clone()),
            Value::Int(self.code),
            Value::Str(self.message.clone()),
        ];
        fields.extend(self.args.iter().cloned());
        Value::record("system", vec![Value::record("os", fields)])
    }
}

/// Fail the current computation with an OS error.
///
/// # Errors
///
/// Always returns [`VmError::Os`].
pub fn raise_os_error<T>(
    function: impl Into<String>,
    code: i64,
    message: impl Into<String>,
) -> Result<T, VmError> {
    Err(OsError::new(function, code, message).into())
}
