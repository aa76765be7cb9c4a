//! Reshaping parent-child relations into node trees.

use crate::change::{Change, ChangeReason, ChangeSet};
use crate::error::Error;
use crate::stream::{BoxObserver, Observable, Observer, Subscription};
use crate::{FxIndexMap, Key, Value};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::marker::PhantomData;
use std::sync::Arc;

/// One node of the reshaped tree: the item plus its effective place in
/// the hierarchy.
///
/// `parent` is the *effective* parent: `None` when the item declares no
/// parent or its declared parent is not (yet) present — such nodes are
/// roots. Children are referenced by key; the arena holds no cycles
/// because an item cannot be its own ancestor by key identity.
#[derive(Clone, PartialEq, Eq)]
pub struct Node<K, V> {
    key: K,
    value: V,
    parent: Option<K>,
    children: Vec<K>,
}

impl<K, V> Node<K, V> {
    /// The item's key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The item's value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// The effective parent key.
    pub fn parent(&self) -> Option<&K> {
        self.parent.as_ref()
    }

    /// Keys of the node's current children, in attachment order.
    pub fn children(&self) -> &[K] {
        &self.children
    }

    /// Whether the node currently sits at the top of the forest.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

impl<K: std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug for Node<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .finish()
    }
}

/// The tree-building operator. Built by
/// [`ChangeStreamExt::transform_to_tree`](super::ChangeStreamExt::transform_to_tree).
pub struct TreeBuilder<S, K, V> {
    upstream: S,
    parent_selector: Arc<dyn Fn(&V) -> Option<K> + Send + Sync>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<S, K, V> TreeBuilder<S, K, V> {
    pub(crate) fn new(
        upstream: S,
        parent_selector: Arc<dyn Fn(&V) -> Option<K> + Send + Sync>,
    ) -> Self {
        TreeBuilder {
            upstream,
            parent_selector,
            _marker: PhantomData,
        }
    }
}

struct NodeSlot<K, V> {
    value: V,
    declared_parent: Option<K>,
    children: Vec<K>,
}

struct TreeState<K, V> {
    arena: FxIndexMap<K, NodeSlot<K, V>>,
    /// Children declared under a parent that is not present yet, by
    /// that parent's key.
    waiting: FxHashMap<K, SmallVec<[K; 2]>>,
}

impl<K: Key, V: Value> TreeState<K, V> {
    fn make_node(&self, key: &K) -> Option<Node<K, V>> {
        let slot = self.arena.get(key)?;
        let parent = slot
            .declared_parent
            .clone()
            .filter(|p| self.arena.contains_key(p));
        Some(Node {
            key: key.clone(),
            value: slot.value.clone(),
            parent,
            children: slot.children.clone(),
        })
    }

    /// Detaches `key` from wherever its declared parent tracks it.
    /// Returns the parent key whose node shape changed, if any.
    fn detach(&mut self, key: &K, declared: &Option<K>) -> Option<K> {
        let parent = declared.as_ref()?;
        if let Some(slot) = self.arena.get_mut(parent) {
            slot.children.retain(|child| child != key);
            return Some(parent.clone());
        }
        if let Some(pending) = self.waiting.get_mut(parent) {
            pending.retain(|child| child != key);
            if pending.is_empty() {
                self.waiting.remove(parent);
            }
        }
        None
    }

    /// Attaches `key` under `declared`; returns the parent whose shape
    /// changed, if it is present.
    fn attach(&mut self, key: &K, declared: &Option<K>) -> Option<K> {
        let parent = declared.as_ref()?;
        if let Some(slot) = self.arena.get_mut(parent) {
            slot.children.push(key.clone());
            Some(parent.clone())
        } else {
            self.waiting
                .entry(parent.clone())
                .or_default()
                .push(key.clone());
            None
        }
    }
}

struct TreeAdapter<K: Key, V: Value> {
    state: Arc<Mutex<TreeState<K, V>>>,
    parent_selector: Arc<dyn Fn(&V) -> Option<K> + Send + Sync>,
    downstream: BoxObserver<ChangeSet<K, Node<K, V>>>,
}

impl<K: Key, V: Value> TreeAdapter<K, V> {
    fn push_update(
        state: &TreeState<K, V>,
        out: &mut ChangeSet<K, Node<K, V>>,
        key: &K,
        previous: Option<Node<K, V>>,
    ) {
        if let Some(node) = state.make_node(key) {
            match previous {
                Some(previous) => out.push(Change::update(key.clone(), node, previous)),
                None => out.push(Change::add(key.clone(), node)),
            }
        }
    }

    fn insert(
        &self,
        state: &mut TreeState<K, V>,
        key: &K,
        value: &V,
        out: &mut ChangeSet<K, Node<K, V>>,
    ) {
        let declared = (self.parent_selector)(value);
        match state.arena.get(key) {
            Some(existing) => {
                let old_declared = existing.declared_parent.clone();
                let self_previous = state.make_node(key);
                state.arena.get_mut(key).expect("slot vanished").value = value.clone();
                if old_declared != declared {
                    let detached = state.detach(key, &old_declared);
                    state
                        .arena
                        .get_mut(key)
                        .expect("slot vanished")
                        .declared_parent = declared.clone();
                    let attached = state.attach(key, &declared);
                    if let Some(parent) = detached {
                        Self::reemit_parent(state, out, &parent);
                    }
                    if let Some(parent) = attached {
                        Self::reemit_parent(state, out, &parent);
                    }
                }
                Self::push_update(state, out, key, self_previous);
            }
            None => {
                // Adopt any children that were waiting for this key.
                let adopted: SmallVec<[K; 2]> =
                    state.waiting.remove(key).unwrap_or_default();
                let adopted_previous: Vec<(K, Option<Node<K, V>>)> = adopted
                    .iter()
                    .map(|child| (child.clone(), state.make_node(child)))
                    .collect();
                state.arena.insert(
                    key.clone(),
                    NodeSlot {
                        value: value.clone(),
                        declared_parent: declared.clone(),
                        children: adopted.into_iter().collect(),
                    },
                );
                let attached = state.attach(key, &declared);
                out.push(Change::add(
                    key.clone(),
                    state.make_node(key).expect("just inserted"),
                ));
                if let Some(parent) = attached {
                    Self::reemit_parent(state, out, &parent);
                }
                for (child, previous) in adopted_previous {
                    Self::push_update(state, out, &child, previous);
                }
            }
        }
    }

    /// A parent whose children list changed is re-emitted as `Refresh`:
    /// the item itself did not change, only its shape, and derived
    /// caches adopt the refreshed node.
    fn reemit_parent(state: &TreeState<K, V>, out: &mut ChangeSet<K, Node<K, V>>, parent: &K) {
        if let Some(node) = state.make_node(parent) {
            out.push(Change::refresh(parent.clone(), node));
        }
    }

    fn remove(&self, state: &mut TreeState<K, V>, key: &K, out: &mut ChangeSet<K, Node<K, V>>) {
        let slot = match state.arena.shift_remove(key) {
            Some(slot) => slot,
            None => return,
        };
        let removed = Node {
            key: key.clone(),
            value: slot.value.clone(),
            parent: slot
                .declared_parent
                .clone()
                .filter(|p| state.arena.contains_key(p)),
            children: slot.children.clone(),
        };
        if let Some(parent) = state.detach(key, &slot.declared_parent) {
            Self::reemit_parent(state, out, &parent);
        }
        out.push(Change::remove(key.clone(), removed));
        // Children survive as roots-in-waiting under the removed key.
        for child in slot.children {
            let previous = state.make_node(&child);
            state
                .waiting
                .entry(key.clone())
                .or_default()
                .push(child.clone());
            Self::push_update(state, out, &child, previous);
        }
    }
}

impl<K: Key, V: Value> Observer<ChangeSet<K, V>> for TreeAdapter<K, V> {
    fn on_next(&mut self, changes: &ChangeSet<K, V>) {
        let mut out = ChangeSet::new();
        {
            let mut state = self.state.lock();
            for change in changes.iter() {
                match change.reason() {
                    ChangeReason::Add | ChangeReason::Update | ChangeReason::Refresh => {
                        self.insert(&mut state, change.key(), change.current(), &mut out)
                    }
                    ChangeReason::Remove => self.remove(&mut state, change.key(), &mut out),
                    ChangeReason::Moved => {}
                }
            }
        }
        if !out.is_empty() {
            self.downstream.on_next(&out);
        }
    }

    fn on_completed(&mut self) {
        self.downstream.on_completed();
    }

    fn on_error(&mut self, error: &Error) {
        self.downstream.on_error(error);
    }
}

impl<S, K, V> Observable<ChangeSet<K, Node<K, V>>> for TreeBuilder<S, K, V>
where
    S: Observable<ChangeSet<K, V>>,
    K: Key,
    V: Value,
{
    fn subscribe_with(&self, observer: BoxObserver<ChangeSet<K, Node<K, V>>>) -> Subscription {
        self.upstream.subscribe_with(Box::new(TreeAdapter {
            state: Arc::new(Mutex::new(TreeState {
                arena: FxIndexMap::default(),
                waiting: FxHashMap::default(),
            })),
            parent_selector: self.parent_selector.clone(),
            downstream: observer,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DerivedCache;
    use crate::ops::ChangeStreamExt;
    use crate::stream::Subject;

    #[derive(Clone, PartialEq, Debug)]
    struct Item {
        parent: Option<u32>,
        label: &'static str,
    }

    fn item(parent: Option<u32>, label: &'static str) -> Item {
        Item { parent, label }
    }

    fn tree_of(
        upstream: &Subject<ChangeSet<u32, Item>>,
    ) -> DerivedCache<u32, Node<u32, Item>> {
        upstream
            .clone()
            .transform_to_tree(|v: &Item| v.parent)
            .as_cache()
    }

    #[test]
    fn children_attach_under_their_parent() {
        let upstream: Subject<ChangeSet<u32, Item>> = Subject::new();
        let tree = tree_of(&upstream);

        let mut batch = ChangeSet::new();
        batch.push(Change::add(1, item(None, "root")));
        batch.push(Change::add(2, item(Some(1), "leaf")));
        upstream.publish(&batch);

        let root = tree.lookup(&1).expect("root missing");
        assert!(root.is_root());
        assert_eq!(root.children(), &[2]);
        let leaf = tree.lookup(&2).expect("leaf missing");
        assert_eq!(leaf.parent(), Some(&1));
    }

    #[test]
    fn orphans_become_roots_until_the_parent_arrives() {
        let upstream: Subject<ChangeSet<u32, Item>> = Subject::new();
        let tree = tree_of(&upstream);

        upstream.publish(&ChangeSet::single(Change::add(2, item(Some(1), "early"))));
        assert!(tree.lookup(&2).expect("orphan missing").is_root());

        upstream.publish(&ChangeSet::single(Change::add(1, item(None, "late"))));
        let adopted = tree.lookup(&2).expect("orphan missing");
        assert_eq!(adopted.parent(), Some(&1));
        assert_eq!(tree.lookup(&1).expect("root missing").children(), &[2]);
    }

    #[test]
    fn removing_a_parent_reroots_its_children() {
        let upstream: Subject<ChangeSet<u32, Item>> = Subject::new();
        let tree = tree_of(&upstream);

        let mut batch = ChangeSet::new();
        batch.push(Change::add(1, item(None, "root")));
        batch.push(Change::add(2, item(Some(1), "leaf")));
        upstream.publish(&batch);

        upstream.publish(&ChangeSet::single(Change::remove(1, item(None, "root"))));
        assert!(tree.lookup(&1).is_none());
        assert!(tree.lookup(&2).expect("leaf missing").is_root());

        // The parent coming back re-adopts the waiting child.
        upstream.publish(&ChangeSet::single(Change::add(1, item(None, "root"))));
        assert_eq!(tree.lookup(&2).expect("leaf missing").parent(), Some(&1));
    }

    #[test]
    fn reparenting_moves_the_subtree_edge() {
        let upstream: Subject<ChangeSet<u32, Item>> = Subject::new();
        let tree = tree_of(&upstream);

        let mut batch = ChangeSet::new();
        batch.push(Change::add(1, item(None, "a")));
        batch.push(Change::add(2, item(None, "b")));
        batch.push(Change::add(3, item(Some(1), "child")));
        upstream.publish(&batch);

        upstream.publish(&ChangeSet::single(Change::update(
            3,
            item(Some(2), "child"),
            item(Some(1), "child"),
        )));

        assert!(tree.lookup(&1).expect("a missing").children().is_empty());
        assert_eq!(tree.lookup(&2).expect("b missing").children(), &[3]);
        assert_eq!(tree.lookup(&3).expect("child missing").parent(), Some(&2));
    }
}
