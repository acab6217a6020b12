//! Language values.
//!
//! [`Value`] covers the data the execution environment itself has to build or
//! inspect: results of asynchronous operations, VM Port messages, death
//! notices and OS error records. References to dataflow nodes
//! ([`Value::Var`], [`Value::ReadOnly`]) are only meaningful inside the store
//! that issued them and are therefore never serialised.

use serde::{Deserialize, Serialize};

use crate::node::NodeRef;

/// A language value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// The unit value.
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// A symbolic constant.
    Atom(String),
    Str(String),
    /// An opaque byte payload.
    Bytes(Vec<u8>),
    /// A labelled tuple, e.g. `terminated(3)`.
    Record { label: String, fields: Vec<Value> },
    /// The empty list.
    Nil,
    /// A list cell. The tail is usually another `Cons`, `Nil` or a `Var`.
    Cons(Box<Value>, Box<Value>),
    /// A reference to a dataflow node.
    #[serde(skip)]
    Var(NodeRef),
    /// A read-only view of a dataflow node. Language code may wait on it but
    /// not bind it.
    #[serde(skip)]
    ReadOnly(NodeRef),
}

impl Value {
    /// Build an atom.
    #[must_use]
    pub fn atom(name: impl Into<String>) -> Self {
        Value::Atom(name.into())
    }

    /// Build a record with the given label and fields.
    #[must_use]
    pub fn record(label: impl Into<String>, fields: Vec<Value>) -> Self {
        Value::Record {
            label: label.into(),
            fields,
        }
    }

    /// Build a cons cell.
    #[must_use]
    pub fn cons(head: Value, tail: Value) -> Self {
        Value::Cons(Box::new(head), Box::new(tail))
    }

    /// Build a proper list from the given elements.
    #[must_use]
    pub fn list<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: DoubleEndedIterator,
    {
        items
            .into_iter()
            .rev()
            .fold(Value::Nil, |tail, head| Value::cons(head, tail))
    }

    /// Returns the record label, if this is a record.
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        match self {
            Value::Record { label, .. } => Some(label),
            _ => None,
        }
    }

    /// Returns the record fields, if this is a record.
    #[must_use]
    pub fn fields(&self) -> Option<&[Value]> {
        match self {
            Value::Record { fields, .. } => Some(fields),
            _ => None,
        }
    }

    /// Returns the node this value refers to, if it is a reference.
    #[must_use]
    pub fn as_ref_node(&self) -> Option<NodeRef> {
        match self {
            Value::Var(r) | Value::ReadOnly(r) => Some(*r),
            _ => None,
        }
    }

    /// Returns `true` if the value contains no node references.
    #[must_use]
    pub fn is_ground(&self) -> bool {
        let mut refs = Vec::new();
        self.references(&mut refs);
        refs.is_empty()
    }

    /// Collect every node reference reachable inside this value (without
    /// following references into the store).
    pub(crate) fn references(&self, out: &mut Vec<NodeRef>) {
        let mut pending = vec![self];
        while let Some(value) = pending.pop() {
            match value {
                Value::Var(r) | Value::ReadOnly(r) => out.push(*r),
                Value::Record { fields, .. } => pending.extend(fields.iter()),
                Value::Cons(head, tail) => {
                    pending.push(head);
                    pending.push(tail);
                }
                _ => {}
            }
        }
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Value::Unit
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Int(i64::try_from(n).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}
