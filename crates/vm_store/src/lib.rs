//! # vm_store
//!
//! The store of a single VM engine, as seen by the execution environment.
//!
//! This crate provides:
//!
//! - [`Value`]: language values, including references to dataflow nodes.
//! - [`Store`]: a generational arena of [`Node`]s with a GC-root table and a
//!   mark/sweep collection entry point.
//! - [`codec`]: MessagePack pickling of ground values, used by the VM Port
//!   byte protocol.
//! - [`StoreError`]: store-level error types.
//!
//! A store is owned by exactly one engine thread. Nothing here is
//! synchronised; cross-thread access goes through the engine's event funnel.

pub mod codec;
pub mod error;
pub mod node;
pub mod store;
pub mod value;

pub use codec::{decode, encode};
pub use error::StoreError;
pub use node::{Node, NodeRef};
pub use store::{CollectStats, RootId, Store};
pub use value::Value;
