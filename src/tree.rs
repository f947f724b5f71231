//! The handle graph.
//!
//! A tree of named allocator handles. Every structural field (reference
//! counts, parent/child/sibling links) is guarded by one mutex in the tree
//! descriptor; a node's name, backend and counters are immutable after
//! creation and readable without it. The descriptor mutex is always taken
//! first; the leak-report slot and any backend or counter lock are leaf
//! locks.
//!
//! Lifetime rules:
//!
//! * [`Alloc`] is a smart pointer. `Clone` adds an external reference,
//!   `Drop` releases one.
//! * A node is destroyed when its reference count is zero *and* its child
//!   list is empty. Attached children gate destruction instead of pinning
//!   the parent's count, so destruction cascades upward: removing the last
//!   child of an unreferenced parent destroys the parent too, looping until
//!   a live ancestor or the root. Destroying the root frees the tree
//!   descriptor last, after the mutex is released.
//! * Traversal holds at most one outstanding reference: `first_child`
//!   references the child it returns, and [`Alloc::next_sibling`] consumes
//!   the current handle while referencing the next. Dropping a cursor
//!   mid-walk releases correctly.

use std::cell::UnsafeCell;
use std::cmp::Ordering;
use std::fmt;
use std::mem;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::backend::Backend;
use crate::stats::{AllocStats, Counters};
use crate::sys;

/// Aggregate imbalance observed when a handle was destroyed.
#[derive(Clone, Debug)]
pub struct LeakReport {
    /// Dotted path of the destroyed handle.
    pub name: String,
    pub blocks_leaked: u64,
    pub bytes_leaked: u64,
}

type LeakFn = Arc<dyn Fn(&LeakReport) + Send + Sync>;

struct Tree {
    /// Guards every node's `Links` in this tree.
    lock: Mutex<()>,
    /// Leaf lock; taken after `lock` on the destruction path.
    leak: Mutex<Option<LeakFn>>,
    root: UnsafeCell<Option<NonNull<Node>>>,
}

/// Structural state, only touched with the tree mutex held.
struct Links {
    parent: Option<NonNull<Node>>,
    first_child: Option<NonNull<Node>>,
    next_sibling: Option<NonNull<Node>>,
    /// External references. The parent slot does not contribute.
    ref_count: u32,
}

struct Node {
    tree: NonNull<Tree>,
    name: Box<str>,
    backend: Option<Arc<dyn Backend>>,
    counters: Counters,
    links: UnsafeCell<Links>,
}

/// A handle into an allocator tree.
///
/// Allocation requests forward to the node's backend (or straight to the
/// platform heap) and update the node's counters. Handles never retain
/// pointers and never free anything on destruction; outstanding blocks are
/// the caller's responsibility, visible as a counter imbalance.
pub struct Alloc {
    node: NonNull<Node>,
}

// The tree mutex serializes all structural access; immutable node fields
// and the counters are safe to read from any thread.
unsafe impl Send for Alloc {}
unsafe impl Sync for Alloc {}

/// Tree-lock-guarded access to a node's structural state.
///
/// # Safety
///
/// The node's tree mutex must be held, and the returned borrow must end
/// before `links` is called again on the same node.
unsafe fn links<'a>(node: NonNull<Node>) -> &'a mut Links {
    unsafe { &mut *(*node.as_ptr()).links.get() }
}

unsafe fn node_name<'a>(node: NonNull<Node>) -> &'a str {
    unsafe { &(*node.as_ptr()).name }
}

unsafe fn incref(node: NonNull<Node>) {
    let l = unsafe { links(node) };
    l.ref_count = l.ref_count.checked_add(1).expect("max refcount exceeded");
}

/// Sorted unique insertion into the parent's sibling list. Returns false
/// when a sibling with the same name exists.
unsafe fn insert_child(parent: NonNull<Node>, child: NonNull<Node>) -> bool {
    unsafe {
        let name = node_name(child);
        let mut slot = &mut links(parent).first_child;
        while let Some(cur) = *slot {
            match node_name(cur).cmp(name) {
                Ordering::Less => slot = &mut links(cur).next_sibling,
                Ordering::Equal => return false,
                Ordering::Greater => break,
            }
        }
        links(child).next_sibling = *slot;
        *slot = Some(child);
        true
    }
}

unsafe fn unlink_child(parent: NonNull<Node>, child: NonNull<Node>) {
    unsafe {
        let mut slot = &mut links(parent).first_child;
        while let Some(cur) = *slot {
            if cur == child {
                *slot = links(child).next_sibling;
                return;
            }
            slot = &mut links(cur).next_sibling;
        }
        debug_assert!(false, "child missing from its parent's list");
    }
}

unsafe fn full_name_locked(node: NonNull<Node>) -> String {
    let mut names: Vec<&str> = Vec::new();
    let mut cur = Some(node);
    while let Some(n) = cur {
        names.push(unsafe { node_name(n) });
        cur = unsafe { links(n).parent };
    }
    names.reverse();
    names.join(".")
}

/// Release one reference, cascading destruction upward. With
/// `capture_next`, the node's next sibling is referenced (before the
/// release) and returned, which is the traversal step.
///
/// Counter snapshots wait until the tree mutex is released: the per-handle
/// stats mutex of the `locked-stats` build is a leaf lock and must never
/// nest inside the tree mutex. Only the full names are captured under the
/// lock, since they need the ancestor chain.
fn release(node: NonNull<Node>, capture_next: bool) -> Option<NonNull<Node>> {
    let tree_ptr = unsafe { (*node.as_ptr()).tree };
    let mut doomed: Vec<(NonNull<Node>, String)> = Vec::new();
    let mut leak_fn: Option<LeakFn> = None;
    let mut root_died = false;

    let next = {
        let tree = unsafe { tree_ptr.as_ref() };
        let _guard = tree.lock.lock().unwrap_or_else(PoisonError::into_inner);
        unsafe {
            let next = if capture_next {
                links(node).next_sibling.map(|n| {
                    incref(n);
                    n
                })
            } else {
                None
            };

            let l = links(node);
            assert!(l.ref_count > 0, "release of a dead allocator handle");
            l.ref_count -= 1;

            let mut cur = node;
            loop {
                let (ref_count, has_children, parent) = {
                    let l = links(cur);
                    (l.ref_count, l.first_child.is_some(), l.parent)
                };
                if ref_count != 0 || has_children {
                    break;
                }
                doomed.push((cur, full_name_locked(cur)));
                match parent {
                    Some(parent) => {
                        unlink_child(parent, cur);
                        cur = parent;
                    }
                    None => {
                        debug_assert_eq!(*tree.root.get(), Some(cur));
                        root_died = true;
                        break;
                    }
                }
            }

            // Cloned here because the tree descriptor may be gone by the
            // time the reports go out.
            if !doomed.is_empty() {
                leak_fn = tree
                    .leak
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
            }
            next
        }
    };

    // The tree mutex is no longer held; counter snapshots are safe now and
    // the reporter may block.
    for (dead, name) in doomed {
        let node = unsafe { Box::from_raw(dead.as_ptr()) };
        let snap = node.counters.snapshot();
        if snap.live_blocks() != 0 || snap.live_bytes() != 0 {
            let report = LeakReport {
                name,
                blocks_leaked: snap.live_blocks(),
                bytes_leaked: snap.live_bytes(),
            };
            log::warn!(
                "allocator {:?} destroyed with {} blocks ({} bytes) outstanding",
                report.name,
                report.blocks_leaked,
                report.bytes_leaked
            );
            if let Some(report_fn) = leak_fn.as_deref() {
                report_fn(&report);
            }
        }
        log::trace!("destroyed allocator {:?}", node.name);
        drop(node);
    }
    if root_died {
        drop(unsafe { Box::from_raw(tree_ptr.as_ptr()) });
    }

    next
}

impl Alloc {
    /// Create the root of a new allocator tree, backed by the platform
    /// heap.
    pub fn root(name: &str) -> Alloc {
        Self::new_root(name, None)
    }

    /// Create the root of a new allocator tree over a caller-provided
    /// backend.
    pub fn with_backend(name: &str, backend: Arc<dyn Backend>) -> Alloc {
        Self::new_root(name, Some(backend))
    }

    fn new_root(name: &str, backend: Option<Arc<dyn Backend>>) -> Alloc {
        let tree = Box::new(Tree {
            lock: Mutex::new(()),
            leak: Mutex::new(None),
            root: UnsafeCell::new(None),
        });
        let tree = unsafe { NonNull::new_unchecked(Box::into_raw(tree)) };

        let node = Box::new(Node {
            tree,
            name: name.into(),
            backend,
            counters: Counters::new(),
            links: UnsafeCell::new(Links {
                parent: None,
                first_child: None,
                next_sibling: None,
                ref_count: 1,
            }),
        });
        let node = unsafe { NonNull::new_unchecked(Box::into_raw(node)) };
        // Not shared with any other thread yet.
        unsafe { *(*tree.as_ptr()).root.get() = Some(node) };

        log::debug!("created allocator tree rooted at {:?}", name);
        Alloc { node }
    }

    /// Create a child handle. Fails when a sibling with the same name
    /// exists, or when this handle's backend refuses to produce a child
    /// backend; in both cases everything speculatively created is rolled
    /// back.
    pub fn child(&self, name: &str) -> Option<Alloc> {
        let parent = self.node_ref();
        let backend = match &parent.backend {
            Some(b) => Some(b.child(name)?),
            None => None,
        };

        let child = Box::new(Node {
            tree: parent.tree,
            name: name.into(),
            backend,
            counters: Counters::new(),
            links: UnsafeCell::new(Links {
                parent: Some(self.node),
                first_child: None,
                next_sibling: None,
                ref_count: 1,
            }),
        });
        let child = unsafe { NonNull::new_unchecked(Box::into_raw(child)) };

        let inserted = {
            let _guard = self.lock_tree();
            unsafe { insert_child(self.node, child) }
        };
        if !inserted {
            log::debug!(
                "allocator {:?} already has a child named {:?}",
                self.name(),
                name
            );
            // Also rolls back the speculative backend child.
            drop(unsafe { Box::from_raw(child.as_ptr()) });
            return None;
        }
        Some(Alloc { node: child })
    }

    /// The handle's own name.
    pub fn name(&self) -> &str {
        &self.node_ref().name
    }

    /// Dotted path from the root, e.g. `"server.conn.rx"`. Unambiguous
    /// only if names avoid the dot separator, which is not enforced.
    pub fn full_name(&self) -> String {
        let _guard = self.lock_tree();
        unsafe { full_name_locked(self.node) }
    }

    /// Parent handle, referenced on return.
    pub fn parent(&self) -> Option<Alloc> {
        let _guard = self.lock_tree();
        unsafe {
            links(self.node).parent.map(|p| {
                incref(p);
                Alloc { node: p }
            })
        }
    }

    /// First child in name order, referenced on return.
    pub fn first_child(&self) -> Option<Alloc> {
        let _guard = self.lock_tree();
        unsafe {
            links(self.node).first_child.map(|c| {
                incref(c);
                Alloc { node: c }
            })
        }
    }

    /// Step to the next sibling, releasing this handle. Referencing the
    /// next element before the release is what makes walking children safe
    /// while other threads add and remove them.
    pub fn next_sibling(self) -> Option<Alloc> {
        let node = self.node;
        mem::forget(self);
        release(node, true).map(|node| Alloc { node })
    }

    /// Look up a child by name. The walk stops early at the first sibling
    /// ordered after `name`.
    pub fn find_child(&self, name: &str) -> Option<Alloc> {
        let _guard = self.lock_tree();
        unsafe {
            let mut cur = links(self.node).first_child;
            while let Some(c) = cur {
                match node_name(c).cmp(name) {
                    Ordering::Less => cur = links(c).next_sibling,
                    Ordering::Equal => {
                        incref(c);
                        return Some(Alloc { node: c });
                    }
                    Ordering::Greater => return None,
                }
            }
            None
        }
    }

    /// Iterate the children in name order. The cursor follows the
    /// traversal protocol, so dropping it mid-walk releases correctly.
    pub fn children(&self) -> Children {
        Children {
            cur: self.first_child(),
        }
    }

    /// Snapshot of this handle's counters. In the default lock-free build
    /// the fields are loaded one by one; see [`crate::stats`].
    pub fn stats(&self) -> AllocStats {
        self.node_ref().counters.snapshot()
    }

    /// Install a callback invoked whenever a handle in this tree is
    /// destroyed with more allocated than freed. The callback runs on the
    /// destroying thread after the tree mutex is released; it must not
    /// touch the tree.
    pub fn set_leak_report(&self, f: impl Fn(&LeakReport) + Send + Sync + 'static) {
        *self
            .tree_ref()
            .leak
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(f));
    }

    /// Remove the leak callback.
    pub fn clear_leak_report(&self) {
        *self
            .tree_ref()
            .leak
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Allocate `size` bytes.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let node = self.node_ref();
        let out = match &node.backend {
            Some(b) => b.alloc(size),
            None => sys::malloc(size),
        };
        let mut delta = AllocStats::default();
        if out.is_some() {
            delta.blocks_allocated = 1;
            delta.bytes_allocated = size as u64;
        } else {
            delta.blocks_failed = 1;
            delta.bytes_failed = size as u64;
        }
        node.counters.apply(delta);
        out
    }

    /// Allocate a zeroed region of `nmemb * size` bytes.
    pub fn calloc(&self, nmemb: usize, size: usize) -> Option<NonNull<u8>> {
        let node = self.node_ref();
        let out = match &node.backend {
            Some(b) => b.calloc(nmemb, size),
            None => sys::calloc(nmemb, size),
        };
        let bytes = (nmemb as u64).saturating_mul(size as u64);
        let mut delta = AllocStats::default();
        if out.is_some() {
            delta.blocks_allocated = 1;
            delta.bytes_allocated = bytes;
        } else {
            delta.blocks_failed = 1;
            delta.bytes_failed = bytes;
        }
        node.counters.apply(delta);
        out
    }

    /// Resize a block. `old_size` is the size the block was requested
    /// with; it feeds the counters, not the resize itself.
    /// `realloc(None, 0, s)` allocates, `realloc(Some(p), s, 0)` frees and
    /// returns `None`.
    ///
    /// # Safety
    ///
    /// `ptr`, when present, must be a live block obtained through this
    /// handle with `old_size` as its requested size.
    pub unsafe fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        let node = self.node_ref();
        let out = match &node.backend {
            Some(b) => unsafe { b.realloc(ptr, old_size, new_size) },
            None => unsafe { sys::realloc(ptr, new_size) },
        };
        let mut delta = AllocStats::default();
        if old_size > 0 {
            delta.blocks_freed = 1;
            delta.bytes_freed = old_size as u64;
        }
        if new_size > 0 {
            if out.is_some() {
                delta.blocks_allocated = 1;
                delta.bytes_allocated = new_size as u64;
            } else {
                delta.blocks_failed = 1;
                delta.bytes_failed = new_size as u64;
            }
        }
        node.counters.apply(delta);
        out
    }

    /// Return a block. `size` is the size it was requested with.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block obtained through this handle with `size`
    /// as its requested size.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        let node = self.node_ref();
        match &node.backend {
            Some(b) => unsafe { b.free(ptr, size) },
            None => unsafe { sys::free(ptr) },
        }
        node.counters.apply(AllocStats {
            blocks_freed: 1,
            bytes_freed: size as u64,
            ..Default::default()
        });
    }

    fn node_ref(&self) -> &Node {
        unsafe { self.node.as_ref() }
    }

    fn tree_ref(&self) -> &Tree {
        // The tree descriptor outlives every handle into it.
        unsafe { self.node_ref().tree.as_ref() }
    }

    fn lock_tree(&self) -> MutexGuard<'_, ()> {
        self.tree_ref()
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clone for Alloc {
    fn clone(&self) -> Alloc {
        let _guard = self.lock_tree();
        unsafe {
            let l = links(self.node);
            assert!(l.ref_count > 0, "reference to a dead allocator handle");
            l.ref_count = l.ref_count.checked_add(1).expect("max refcount exceeded");
        }
        Alloc { node: self.node }
    }
}

impl Drop for Alloc {
    fn drop(&mut self) {
        release(self.node, false);
    }
}

impl fmt::Debug for Alloc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Alloc")
            .field("name", &self.name())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Cursor over a handle's children; see [`Alloc::children`].
pub struct Children {
    cur: Option<Alloc>,
}

impl Iterator for Children {
    type Item = Alloc;

    fn next(&mut self) -> Option<Alloc> {
        let cur = self.cur.take()?;
        self.cur = cur.clone().next_sibling();
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_has_its_name() {
        let root = Alloc::root("r");
        assert_eq!(root.name(), "r");
        assert_eq!(root.full_name(), "r");
        assert_eq!(root.stats(), AllocStats::default());
    }

    #[test]
    fn children_keep_name_order() {
        let root = Alloc::root("r");
        let kept: Vec<Alloc> = ["mid", "aaa", "zzz"]
            .iter()
            .map(|name| root.child(name).unwrap())
            .collect();
        let names: Vec<String> = root.children().map(|c| c.name().to_owned()).collect();
        assert_eq!(names, ["aaa", "mid", "zzz"]);
        drop(kept);
    }

    #[test]
    fn lookup_stops_early() {
        let root = Alloc::root("r");
        let _b = root.child("b").unwrap();
        let _d = root.child("d").unwrap();
        assert!(root.find_child("c").is_none());
        assert_eq!(root.find_child("d").unwrap().name(), "d");
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let root = Alloc::root("r");
        let first = root.child("x").unwrap();
        assert!(root.child("x").is_none());
        assert_eq!(first.name(), "x");
    }

    #[test]
    fn parent_walks_up() {
        let root = Alloc::root("r");
        let child = root.child("c").unwrap();
        assert_eq!(child.parent().unwrap().name(), "r");
        assert!(root.parent().is_none());
        assert_eq!(child.full_name(), "r.c");
    }

    #[test]
    fn clone_drop_pairs_are_neutral() {
        let root = Alloc::root("r");
        for _ in 0..10 {
            let extra = root.clone();
            drop(extra);
        }
        let p = root.alloc(8).unwrap();
        unsafe { root.free(p, 8) };
        assert_eq!(root.stats().live_blocks(), 0);
    }
}
