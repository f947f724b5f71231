//! Pluggable allocation backends.
//!
//! A backend is the lower layer that actually obtains and releases bytes on
//! behalf of a handle. The tree consumes backends through [`Backend`];
//! sharing one backend across a subtree is an [`Arc`] clone, and tearing a
//! backend down is dropping its last `Arc`.

use std::ptr::NonNull;
use std::sync::Arc;

mod chaos;
mod heap;
mod tracer;

pub use chaos::ChaosAlloc;
pub use heap::SystemHeap;
pub use tracer::{TraceAlloc, TraceEvent, TraceOp, BACKTRACE_MAX};

/// The capability a handle forwards allocation requests to.
///
/// All sizes flow through the interface: `free` and `realloc` receive the
/// caller-reported original size and must not try to re-derive it from the
/// block. Every successful allocation returns a region of at least the
/// requested size, aligned as the platform heap aligns. Failure is `None`;
/// there is no out-of-band error kind.
pub trait Backend: Send + Sync {
    /// Produce the backend for a child handle, or `None` to make the child
    /// creation fail. Backends whose policy covers the whole subtree return
    /// a clone sharing their state.
    fn child(&self, name: &str) -> Option<Arc<dyn Backend>>;

    fn alloc(&self, size: usize) -> Option<NonNull<u8>>;

    fn calloc(&self, nmemb: usize, size: usize) -> Option<NonNull<u8>>;

    /// `realloc(None, 0, S > 0)` behaves as `alloc(S)`; `realloc(Some(p),
    /// S, 0)` behaves as `free(p, S)` and returns `None`. A failed resize
    /// leaves the old region untouched.
    ///
    /// # Safety
    ///
    /// `ptr`, when present, must be a live block previously returned by this
    /// backend, and `old_size` must be the size it was requested with.
    unsafe fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must be a live block previously returned by this backend, and
    /// `size` must be the size it was requested with.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize);
}
