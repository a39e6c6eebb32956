use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use std::sync::atomic::{self, Ordering};

/// A chain node. The hash and key are fixed for the node's lifetime; the
/// value is replaced whole and published with a release store; `next` is
/// rewritten only when a successor is unlinked or the chain is rebuilt
/// during a rehash.
///
/// `Node` deliberately has no `Drop` glue: the value and the link are owned
/// through the epoch collector, and every path that retires a node says so
/// explicitly via [`defer_destroy_node`] or [`destroy_node`].
pub(crate) struct Node<K, V> {
    pub(crate) hash: u32,
    pub(crate) key: K,
    pub(crate) value: Atomic<V>,
    pub(crate) next: Atomic<Node<K, V>>,
}

impl<K, V> Node<K, V> {
    pub(crate) fn new(hash: u32, key: K, value: V) -> Self {
        Self {
            hash,
            key,
            value: Atomic::new(value),
            next: Atomic::null(),
        }
    }

    pub(crate) fn with_next(hash: u32, key: K, value: V, next: Shared<'_, Node<K, V>>) -> Self {
        Self {
            hash,
            key,
            value: Atomic::new(value),
            next: Atomic::from(next),
        }
    }
}

/// Takes the key and value back out of a node that was never published.
pub(crate) fn into_parts<K, V>(node: Owned<Node<K, V>>) -> (K, V) {
    let Node { key, value, .. } = *node.into_box();
    // The value cell was created by us and never shared.
    let value = *unsafe { value.into_owned() }.into_box();
    (key, value)
}

/// Frees `node` and its value once every pinned reader has quiesced.
///
/// # Safety
///
/// The node must already be unreachable from the live table, and must not
/// be passed to this function more than once.
pub(crate) unsafe fn defer_destroy_node<K, V>(guard: &Guard, node: Shared<'_, Node<K, V>>) {
    debug_assert!(!node.is_null());

    unsafe {
        guard.defer_unchecked(move || {
            atomic::fence(Ordering::Acquire);
            let Node { value, .. } = *node.into_owned().into_box();
            drop(value.into_owned());
        });
    }
}

/// Frees `node` and its value immediately.
///
/// # Safety
///
/// No other thread may still reach the node; callers hold exclusive access
/// to the owning partition.
pub(crate) unsafe fn destroy_node<K, V>(node: Shared<'_, Node<K, V>>) {
    debug_assert!(!node.is_null());

    unsafe {
        let Node { value, .. } = *node.into_owned().into_box();
        drop(value.into_owned());
    }
}
