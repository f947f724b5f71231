//! Passthrough backend over the platform heap.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::backend::Backend;
use crate::sys;

/// Forwards every operation to the platform byte allocator.
///
/// `SystemHeap` carries no state, so a child backend is simply a fresh
/// handle on the same heap.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemHeap;

impl Backend for SystemHeap {
    fn child(&self, _name: &str) -> Option<Arc<dyn Backend>> {
        Some(Arc::new(SystemHeap))
    }

    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        sys::malloc(size)
    }

    fn calloc(&self, nmemb: usize, size: usize) -> Option<NonNull<u8>> {
        sys::calloc(nmemb, size)
    }

    unsafe fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        _old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        unsafe { sys::realloc(ptr, new_size) }
    }

    unsafe fn free(&self, ptr: NonNull<u8>, _size: usize) {
        unsafe { sys::free(ptr) }
    }
}
