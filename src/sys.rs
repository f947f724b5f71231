//! Thin wrappers over the platform byte allocator.
//!
//! Every raw `libc` allocation call in the crate goes through this module.
//! Failure is expressed as `None`; alignment is whatever the platform heap
//! provides.

use std::ptr::NonNull;

pub(crate) fn malloc(size: usize) -> Option<NonNull<u8>> {
    NonNull::new(unsafe { libc::malloc(size) }.cast::<u8>())
}

pub(crate) fn calloc(nmemb: usize, size: usize) -> Option<NonNull<u8>> {
    NonNull::new(unsafe { libc::calloc(nmemb, size) }.cast::<u8>())
}

/// `realloc(None, 0) -> None`, `realloc(None, n) -> malloc(n)`,
/// `realloc(Some(p), 0)` frees `p` and returns `None`. On a failed resize
/// the old region is left untouched and `None` is returned.
///
/// # Safety
///
/// `ptr`, when present, must have been returned by this module and not yet
/// freed.
pub(crate) unsafe fn realloc(ptr: Option<NonNull<u8>>, new_size: usize) -> Option<NonNull<u8>> {
    match (ptr, new_size) {
        (None, 0) => None,
        (None, n) => malloc(n),
        (Some(p), 0) => {
            unsafe { free(p) };
            None
        }
        (Some(p), n) => NonNull::new(unsafe { libc::realloc(p.as_ptr().cast(), n) }.cast::<u8>()),
    }
}

/// # Safety
///
/// `ptr` must have been returned by this module and not yet freed.
pub(crate) unsafe fn free(ptr: NonNull<u8>) {
    unsafe { libc::free(ptr.as_ptr().cast()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_roundtrip() {
        let p = malloc(64).unwrap();
        unsafe { free(p) };
    }

    #[test]
    fn calloc_zeroes() {
        let p = calloc(4, 8).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), 32) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { free(p) };
    }

    #[test]
    fn realloc_edges() {
        assert!(unsafe { realloc(None, 0) }.is_none());

        let p = unsafe { realloc(None, 16) }.unwrap();
        let p = unsafe { realloc(Some(p), 32) }.unwrap();
        assert!(unsafe { realloc(Some(p), 0) }.is_none());
    }
}
