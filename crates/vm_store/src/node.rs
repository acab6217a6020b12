//! Dataflow nodes and generational node references.
//!
//! A [`NodeRef`] is a lightweight `(index, generation)` pair into the store
//! arena. The generation is bumped every time a slot is freed, so a reference
//! that outlives its node is detected as dangling instead of silently
//! aliasing whatever was allocated in the slot afterwards.

use crate::value::Value;

/// A reference to a node in a [`Store`](crate::Store).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl NodeRef {
    /// Returns the arena slot index.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Returns the slot generation this reference was issued for.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Node({}v{})", self.index, self.generation)
    }
}

/// The state of a dataflow node.
///
/// Nodes start out [`Node::Unbound`] and are resolved at most once, either to
/// a value or to an error raised into the placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Not yet determined. Readers suspend on it.
    Unbound,
    /// Bound to a value.
    Bound(Value),
    /// An error was raised into the placeholder. Readers see the error.
    Failed(Value),
}

impl Node {
    /// Returns `true` if the node has not been resolved yet.
    #[must_use]
    pub fn is_unbound(&self) -> bool {
        matches!(self, Node::Unbound)
    }

    /// Returns the bound value, if any.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        match self {
            Node::Bound(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the raised error, if any.
    #[must_use]
    pub fn error(&self) -> Option<&Value> {
        match self {
            Node::Failed(error) => Some(error),
            _ => None,
        }
    }

    /// Iterate over the node references held directly by this node.
    pub(crate) fn references(&self, out: &mut Vec<NodeRef>) {
        match self {
            Node::Unbound => {}
            Node::Bound(value) | Node::Failed(value) => value.references(out),
        }
    }
}
