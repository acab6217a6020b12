//! Node arena, GC-root table and collection.
//!
//! The [`Store`] keeps every dataflow node of one engine in a generational
//! arena. Nodes that must survive collection although no language value
//! points at them (pending asynchronous results, the VM Port stream) are
//! registered in the root table with [`Store::protect`] and released with
//! [`Store::unprotect`].

use std::collections::BTreeMap;

use crate::error::StoreError;
use crate::node::{Node, NodeRef};
use crate::value::Value;

/// Minimum number of live nodes before a collection is suggested.
const MIN_COLLECT_THRESHOLD: usize = 1024;

/// Handle for an entry in the store's root table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RootId(u64);

impl std::fmt::Display for RootId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Root({})", self.0)
    }
}

/// Result of a [`Store::collect`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CollectStats {
    /// Nodes that survived.
    pub live: usize,
    /// Nodes that were reclaimed.
    pub freed: usize,
}

#[derive(Debug)]
enum Slot {
    Occupied { generation: u32, node: Node },
    Vacant { generation: u32, next_free: Option<u32> },
}

/// The node arena of a single engine.
#[derive(Debug)]
pub struct Store {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    live: usize,
    roots: BTreeMap<RootId, NodeRef>,
    next_root: u64,
    threshold: usize,
}

impl Store {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            live: 0,
            roots: BTreeMap::new(),
            next_root: 0,
            threshold: MIN_COLLECT_THRESHOLD,
        }
    }

    /// Allocate a node and return a reference to it.
    pub fn alloc(&mut self, node: Node) -> NodeRef {
        self.live += 1;
        if let Some(index) = self.free_head {
            let slot = &mut self.slots[index as usize];
            if let Slot::Vacant {
                generation,
                next_free,
            } = *slot
            {
                self.free_head = next_free;
                *slot = Slot::Occupied { generation, node };
                return NodeRef { index, generation };
            }
        }

        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot::Occupied {
            generation: 0,
            node,
        });
        NodeRef {
            index,
            generation: 0,
        }
    }

    /// Allocate a fresh unbound node.
    pub fn new_var(&mut self) -> NodeRef {
        self.alloc(Node::Unbound)
    }

    /// Returns the node behind a reference.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DanglingRef`] if the node was collected.
    pub fn node(&self, r: NodeRef) -> Result<&Node, StoreError> {
        match self.slots.get(r.index as usize) {
            Some(Slot::Occupied { generation, node }) if *generation == r.generation => Ok(node),
            _ => Err(StoreError::DanglingRef(r)),
        }
    }

    fn node_mut(&mut self, r: NodeRef) -> Result<&mut Node, StoreError> {
        match self.slots.get_mut(r.index as usize) {
            Some(Slot::Occupied { generation, node }) if *generation == r.generation => Ok(node),
            _ => Err(StoreError::DanglingRef(r)),
        }
    }

    /// Bind an unbound node to a value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyBound`] if the node was already resolved,
    /// or [`StoreError::DanglingRef`] if it no longer exists.
    pub fn bind(&mut self, r: NodeRef, value: Value) -> Result<(), StoreError> {
        self.resolve_node(r, Node::Bound(value))
    }

    /// Raise an error into an unbound node.
    ///
    /// # Errors
    ///
    /// Same as [`Store::bind`].
    pub fn fail(&mut self, r: NodeRef, error: Value) -> Result<(), StoreError> {
        self.resolve_node(r, Node::Failed(error))
    }

    fn resolve_node(&mut self, r: NodeRef, resolved: Node) -> Result<(), StoreError> {
        let node = self.node_mut(r)?;
        if !node.is_unbound() {
            return Err(StoreError::AlreadyBound(r));
        }
        *node = resolved;
        Ok(())
    }

    /// Follow bound references until reaching a non-reference value or a
    /// reference to an unresolved (or failed) node.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DanglingRef`] on a collected node.
    pub fn deref<'a>(&'a self, mut value: &'a Value) -> Result<&'a Value, StoreError> {
        while let Some(r) = value.as_ref_node() {
            match self.node(r)? {
                Node::Bound(next) => value = next,
                Node::Unbound | Node::Failed(_) => break,
            }
        }
        Ok(value)
    }

    /// Deep-copy a value, replacing every bound reference by its content.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unbound`] or [`StoreError::Failed`] if some
    /// reachable node is not bound to a value.
    pub fn resolve(&self, value: &Value) -> Result<Value, StoreError> {
        // List spines are walked iteratively; streams can be long.
        let mut heads = Vec::new();
        let mut current = self.deref(value)?;
        let last = loop {
            match current {
                Value::Cons(head, tail) => {
                    heads.push(self.resolve(head)?);
                    current = self.deref(tail)?;
                }
                Value::Var(r) | Value::ReadOnly(r) => {
                    return match self.node(*r)? {
                        Node::Failed(_) => Err(StoreError::Failed(*r)),
                        _ => Err(StoreError::Unbound(*r)),
                    };
                }
                Value::Record { label, fields } => {
                    let fields = fields
                        .iter()
                        .map(|field| self.resolve(field))
                        .collect::<Result<Vec<_>, _>>()?;
                    break Value::Record {
                        label: label.clone(),
                        fields,
                    };
                }
                other => break other.clone(),
            }
        };
        Ok(heads
            .into_iter()
            .rev()
            .fold(last, |tail, head| Value::cons(head, tail)))
    }

    /// Register `r` as a GC root.
    pub fn protect(&mut self, r: NodeRef) -> RootId {
        let id = RootId(self.next_root);
        self.next_root += 1;
        self.roots.insert(id, r);
        id
    }

    /// Remove a root. Returns the node it protected, or `None` if the root
    /// was already released.
    pub fn unprotect(&mut self, id: RootId) -> Option<NodeRef> {
        self.roots.remove(&id)
    }

    /// Returns the node protected by a root.
    #[must_use]
    pub fn root(&self, id: RootId) -> Option<NodeRef> {
        self.roots.get(&id).copied()
    }

    /// Returns the number of registered roots.
    #[must_use]
    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// Returns the number of live nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    /// Returns `true` if the store holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Returns `true` once enough nodes were allocated since the last
    /// collection.
    #[must_use]
    pub fn should_collect(&self) -> bool {
        self.live >= self.threshold
    }

    /// Reclaim every node not reachable from the root table or from
    /// `extra_roots`.
    pub fn collect<I>(&mut self, extra_roots: I) -> CollectStats
    where
        I: IntoIterator<Item = NodeRef>,
    {
        let mut marked = vec![false; self.slots.len()];
        let mut pending: Vec<NodeRef> = self.roots.values().copied().collect();
        pending.extend(extra_roots);

        while let Some(r) = pending.pop() {
            let index = r.index as usize;
            if marked.get(index).copied().unwrap_or(true) {
                continue;
            }
            if let Ok(node) = self.node(r) {
                marked[index] = true;
                node.references(&mut pending);
            }
        }

        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Slot::Occupied { generation, .. } = *slot
                && !marked[index]
            {
                *slot = Slot::Vacant {
                    generation: generation.wrapping_add(1),
                    next_free: self.free_head,
                };
                self.free_head = u32::try_from(index).ok();
                freed += 1;
            }
        }

        self.live -= freed;
        self.threshold = (self.live * 2).max(MIN_COLLECT_THRESHOLD);
        CollectStats {
            live: self.live,
            freed,
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}
