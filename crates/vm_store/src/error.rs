//! Store-level error types.

use crate::node::NodeRef;

/// Errors that can occur while reading or mutating a [`Store`](crate::Store).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The reference points at a slot that was freed or reused.
    #[error("dangling node reference {0}")]
    DanglingRef(NodeRef),

    /// The node was already bound (or failed) and cannot be bound again.
    #[error("node {0} is already bound")]
    AlreadyBound(NodeRef),

    /// A ground value was required but the node is still unbound.
    #[error("node {0} is unbound")]
    Unbound(NodeRef),

    /// A ground value was required but an error was raised into the node.
    #[error("node {0} holds a raised error")]
    Failed(NodeRef),

    /// Failed to pickle a value to MessagePack.
    #[error("failed to encode value: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Failed to unpickle a value from MessagePack.
    #[error("failed to decode value: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}
