//! The VM Port stream.
//!
//! Every engine has one inbound stream through which the host and other
//! engines deliver values. In the store the stream is an open-ended list:
//! each `receive` binds the current unbound tail to `Cons(value, newTail)`.
//! Language code reads it from the head and suspends on the unbound tail.
//!
//! Only the owning engine thread appends. Other threads go through the event
//! funnel ([`EngineHandle::send`](crate::EngineHandle::send)).

use tracing::debug;
use vm_store::{NodeRef, RootId, Store, Value};

use crate::error::VmError;

#[derive(Debug, Clone, Copy)]
struct Anchor {
    node: NodeRef,
    root: RootId,
}

impl Anchor {
    fn new(store: &mut Store, node: NodeRef) -> Self {
        Self {
            node,
            root: store.protect(node),
        }
    }

    fn release(self, store: &mut Store) {
        store.unprotect(self.root);
    }
}

/// An engine's inbound stream.
#[derive(Debug)]
pub struct VmPort {
    /// `None` once the stream is closed and its remainder was handed out.
    head: Option<Anchor>,
    tail: Anchor,
    requested: bool,
    closed: bool,
}

impl VmPort {
    /// Create an empty, open stream.
    pub fn new(store: &mut Store) -> Self {
        let node = store.new_var();
        Self {
            head: Some(Anchor::new(store, node)),
            tail: Anchor::new(store, node),
            requested: false,
            closed: false,
        }
    }

    /// Hand the unconsumed part of the stream to language code.
    ///
    /// Elements received so far that nobody has taken yet are included. The
    /// stream remembers that it is being listened to; the next call returns
    /// only elements received after this one.
    ///
    /// After closing, the first call still returns the unread remainder,
    /// terminated by `Nil`. Later calls return `Nil`.
    pub fn get_stream(&mut self, store: &mut Store) -> Value {
        self.requested = true;
        let Some(head) = self.head.take() else {
            return Value::Nil;
        };
        head.release(store);
        if !self.closed {
            self.head = Some(Anchor::new(store, self.tail.node));
        }
        Value::ReadOnly(head.node)
    }

    /// Append a value.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::PortClosed`] after [`VmPort::close`]; the stream is
    /// not modified.
    pub fn receive(&mut self, store: &mut Store, value: Value) -> Result<(), VmError> {
        if self.closed {
            return Err(VmError::PortClosed);
        }
        let new_tail = store.new_var();
        store.bind(self.tail.node, Value::cons(value, Value::Var(new_tail)))?;
        self.tail.release(store);
        self.tail = Anchor::new(store, new_tail);
        Ok(())
    }

    /// Decode a pickled value and append it.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::PortClosed`] after closing, or a store error if the
    /// payload is not a valid pickle. The stream is not modified on error.
    pub fn receive_bytes(&mut self, store: &mut Store, bytes: &[u8]) -> Result<(), VmError> {
        if self.closed {
            return Err(VmError::PortClosed);
        }
        let value = vm_store::decode(bytes)?;
        self.receive(store, value)
    }

    /// Terminate the stream with `Nil`. Closing is permanent; closing twice
    /// is a no-op. Unread elements stay available to the next
    /// [`VmPort::get_stream`].
    ///
    /// # Errors
    ///
    /// Returns a store error if the tail cannot be bound.
    pub fn close(&mut self, store: &mut Store) -> Result<(), VmError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let bound = store.bind(self.tail.node, Value::Nil);
        self.tail.release(store);
        debug!("VM port closed");
        bound.map_err(VmError::from)
    }

    /// Returns `true` once language code has asked for the stream.
    #[must_use]
    pub fn stream_requested(&self) -> bool {
        self.requested
    }

    /// Returns `true` once the stream has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns `true` while language code listens to an open stream. A
    /// listening stream keeps its engine alive.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.requested && !self.closed
    }
}
