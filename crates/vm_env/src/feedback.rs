//! Feedback nodes for asynchronous operations.
//!
//! Before an asynchronous operation is issued, the engine creates an unbound
//! placeholder, registers it as a GC root and hands the issuing code a
//! read-only view of it. When the operation completes, the result is posted
//! back through the event funnel and resolved with
//! [`FeedbackRegistry::resolve_and_release`], which binds (or fails) the
//! placeholder and drops the root.
//!
//! A [`FeedbackHandle`] is neither `Clone` nor `Copy`: resolving consumes it,
//! so each node is released at most once. The registry additionally tracks
//! every outstanding root so that the pending count always equals the number
//! of unresolved handles and nothing is leaked when the engine terminates.

use std::collections::BTreeSet;

use tracing::debug;
use vm_store::{NodeRef, RootId, Store, Value};

use crate::engine::EngineId;
use crate::error::VmError;

/// An outstanding feedback node.
#[must_use = "a feedback node must be resolved with bind_and_release or raise_and_release"]
#[derive(Debug, PartialEq, Eq)]
pub struct FeedbackHandle {
    engine: EngineId,
    root: RootId,
}

impl FeedbackHandle {
    /// The engine that issued this handle.
    #[must_use]
    pub fn engine(&self) -> EngineId {
        self.engine
    }
}

impl std::fmt::Display for FeedbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.root, self.engine)
    }
}

/// Per-engine bookkeeping of pending asynchronous results.
#[derive(Debug)]
pub struct FeedbackRegistry {
    engine: EngineId,
    pending: BTreeSet<RootId>,
}

impl FeedbackRegistry {
    /// Create an empty registry for `engine`.
    #[must_use]
    pub fn new(engine: EngineId) -> Self {
        Self {
            engine,
            pending: BTreeSet::new(),
        }
    }

    /// Protect an existing unbound node and count it as pending.
    pub fn allocate(&mut self, store: &mut Store, node: NodeRef) -> FeedbackHandle {
        let root = store.protect(node);
        self.pending.insert(root);
        FeedbackHandle {
            engine: self.engine,
            root,
        }
    }

    /// Allocate a fresh unbound node and protect it. Returns the handle and a
    /// read-only view of the placeholder.
    pub fn create(&mut self, store: &mut Store) -> (FeedbackHandle, Value) {
        let node = store.new_var();
        (self.allocate(store, node), Value::ReadOnly(node))
    }

    /// Resolve the placeholder with a value (`Ok`) or a raised error (`Err`),
    /// then release its root.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::DuplicateResolution`] if the handle is not pending
    /// on this engine. Store errors are returned after the root has been
    /// released.
    pub fn resolve_and_release(
        &mut self,
        store: &mut Store,
        handle: FeedbackHandle,
        outcome: Result<Value, Value>,
    ) -> Result<(), VmError> {
        if handle.engine != self.engine || !self.pending.remove(&handle.root) {
            return Err(VmError::DuplicateResolution(handle.root));
        }
        let node = store
            .unprotect(handle.root)
            .ok_or(VmError::DuplicateResolution(handle.root))?;
        match outcome {
            Ok(value) => store.bind(node, value)?,
            Err(error) => store.fail(node, error)?,
        }
        Ok(())
    }

    /// Bind the placeholder to `value` and release it.
    ///
    /// # Errors
    ///
    /// See [`FeedbackRegistry::resolve_and_release`].
    pub fn bind_and_release(
        &mut self,
        store: &mut Store,
        handle: FeedbackHandle,
        value: Value,
    ) -> Result<(), VmError> {
        self.resolve_and_release(store, handle, Ok(value))
    }

    /// Raise `error` into the placeholder and release it.
    ///
    /// # Errors
    ///
    /// See [`FeedbackRegistry::resolve_and_release`].
    pub fn raise_and_release(
        &mut self,
        store: &mut Store,
        handle: FeedbackHandle,
        error: Value,
    ) -> Result<(), VmError> {
        self.resolve_and_release(store, handle, Err(error))
    }

    /// Number of unresolved feedback nodes.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Fail every pending placeholder with `reason` and release all roots.
    /// Returns the number of abandoned nodes.
    pub fn abandon_all(&mut self, store: &mut Store, reason: &Value) -> usize {
        let abandoned = std::mem::take(&mut self.pending);
        for root in &abandoned {
            if let Some(node) = store.unprotect(*root)
                && let Err(err) = store.fail(node, reason.clone())
            {
                debug!(engine_id = %self.engine, %root, %err, "abandoned node already resolved");
            }
        }
        abandoned.len()
    }
}
