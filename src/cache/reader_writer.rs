//! Edit sessions: serialization of writes and derivation of the final
//! change set.
//!
//! One edit session holds the cache's reentrant mutex for its whole
//! duration (no cross-cache locking). Sessions nest: an `edit` invoked
//! inside another `edit` on the same cache bumps an edit-depth counter
//! and only the outermost level captures and publishes, so nesting
//! yields a single outer change set.

use super::{CacheCore, CoreState};
use crate::change::ChangeSet;
use crate::query::QuerySnapshot;
use crate::{Key, Value};
use std::cell::RefCell;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

impl<K: Key, V: Value> CacheCore<K, V> {
    /// Runs one edit session and, at the outermost level, publishes
    /// the captured batch: preview subscribers first, then the main
    /// change stream, then the distinct-count stream.
    pub(crate) fn edit<F>(&self, session: F)
    where
        F: FnOnce(&mut Updater<'_, K, V>),
    {
        let guard = self.state.lock();
        guard.borrow_mut().edit_depth += 1;

        let outcome = {
            let mut updater = Updater { cell: &*guard };
            catch_unwind(AssertUnwindSafe(|| session(&mut updater)))
        };

        let depth = {
            let mut state = guard.borrow_mut();
            state.edit_depth -= 1;
            state.edit_depth
        };
        if let Err(panic) = outcome {
            // Keep the depth counter consistent, then let the panic
            // continue. Pending changes stay buffered for the next
            // commit.
            resume_unwind(panic);
        }
        if depth > 0 {
            return;
        }

        let (changes, count) = {
            let mut state = guard.borrow_mut();
            let changes = state.cache.capture_changes();
            (changes, state.cache.count())
        };
        if changes.is_empty() {
            return;
        }
        if self.is_completed() {
            log::debug!("dropping a batch of {} changes: cache already completed", changes.len());
            return;
        }

        self.previews.publish(&changes);
        self.changes.publish(&changes);

        let count_changed = {
            let mut state = guard.borrow_mut();
            if state.last_count != Some(count) {
                state.last_count = Some(count);
                true
            } else {
                false
            }
        };
        if count_changed {
            self.counts.publish(&count);
        }
    }
}

/// The mutator handle passed to an edit session.
///
/// Every mutation made through the updater lands in the session's
/// change set; the batch is committed atomically when the outermost
/// session ends.
pub struct Updater<'a, K: Key, V: Value> {
    cell: &'a RefCell<CoreState<K, V>>,
}

impl<'a, K: Key, V: Value> Updater<'a, K, V> {
    /// Inserts or replaces `key`.
    pub fn add_or_update(&mut self, key: K, value: V) {
        self.cell.borrow_mut().cache.add_or_update(key, value);
    }

    /// Inserts or replaces a value whose key comes from the cache's
    /// key selector.
    ///
    /// Panics when the cache was built without a key selector.
    pub fn add_or_update_value(&mut self, value: V) {
        let mut state = self.cell.borrow_mut();
        let selector = match &state.key_selector {
            Some(selector) => selector.clone(),
            None => panic!(
                "it is not legal to call add_or_update_value on a cache built without a key selector"
            ),
        };
        let key = selector(&value);
        state.cache.add_or_update(key, value);
    }

    /// Deletes `key` if present; absent keys are a no-op.
    pub fn remove(&mut self, key: &K) {
        self.cell.borrow_mut().cache.remove(key);
    }

    /// Records a refresh for `key` if present.
    pub fn refresh(&mut self, key: &K) {
        self.cell.borrow_mut().cache.refresh(key);
    }

    /// Records a refresh for every present key.
    pub fn refresh_all(&mut self) {
        self.cell.borrow_mut().cache.refresh_all();
    }

    /// Removes every item, in iteration order.
    pub fn clear(&mut self) {
        self.cell.borrow_mut().cache.clear();
    }

    /// Folds an external change set into this cache.
    pub fn clone_changes(&mut self, changes: &ChangeSet<K, V>) {
        self.cell.borrow_mut().cache.clone_changes(changes);
    }

    /// The value for `key`, if present.
    pub fn lookup(&self, key: &K) -> Option<V> {
        self.cell.borrow().cache.lookup(key).cloned()
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.cell.borrow().cache.contains_key(key)
    }

    /// Number of items currently in the cache (including uncommitted
    /// session mutations).
    pub fn count(&self) -> usize {
        self.cell.borrow().cache.count()
    }

    /// A detached snapshot of the current (mid-session) state.
    pub fn snapshot(&self) -> QuerySnapshot<K, V> {
        self.cell.borrow().cache.snapshot()
    }

    /// The keys currently present, in iteration order.
    pub fn keys(&self) -> Vec<K> {
        self.cell.borrow().cache.data().keys().cloned().collect()
    }
}
