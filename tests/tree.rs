//! Tree reshaping composed with other operators.

use rill::ops::Node;
use rill::{ChangeStreamExt, SourceCache};

#[derive(Clone, PartialEq, Debug)]
struct Task {
    parent: Option<u32>,
    title: &'static str,
}

fn task(parent: Option<u32>, title: &'static str) -> Task {
    Task { parent, title }
}

#[test]
fn roots_can_be_filtered_out_of_the_forest() {
    let cache: SourceCache<u32, Task> = SourceCache::new();
    let roots = cache
        .connect()
        .transform_to_tree(|t: &Task| t.parent)
        .filter(|node: &Node<u32, Task>| node.is_root())
        .as_cache();

    cache.edit(|updater| {
        updater.add_or_update(1, task(None, "epic"));
        updater.add_or_update(2, task(Some(1), "story"));
        updater.add_or_update(3, task(Some(2), "subtask"));
        updater.add_or_update(4, task(None, "chore"));
    });
    assert_eq!(roots.count(), 2);

    // Detaching the story promotes it to a root.
    cache.edit(|updater| {
        updater.add_or_update(2, task(None, "story"));
    });
    assert_eq!(roots.count(), 3);

    // Removing a root drops it from the filtered view; its child is
    // re-rooted and appears.
    cache.edit(|updater| updater.remove(&2));
    assert_eq!(roots.count(), 3);
    assert!(roots.lookup(&3).expect("subtask missing").is_root());
}

#[test]
fn depth_projection_follows_reparenting() {
    let cache: SourceCache<u32, Task> = SourceCache::new();
    let tree = cache
        .connect()
        .transform_to_tree(|t: &Task| t.parent)
        .as_cache();

    cache.edit(|updater| {
        updater.add_or_update(1, task(None, "a"));
        updater.add_or_update(2, task(Some(1), "b"));
    });

    let parent = tree.lookup(&1).expect("parent missing");
    assert_eq!(parent.children(), &[2]);

    cache.edit(|updater| updater.add_or_update(2, task(None, "b")));
    let parent = tree.lookup(&1).expect("parent missing");
    assert!(parent.children().is_empty());
}
