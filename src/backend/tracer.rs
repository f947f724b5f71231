//! Event-emitting backend.
//!
//! Performs each operation against the platform heap, then synchronously
//! hands the sink a [`TraceEvent`] describing the operation, the handle's
//! dotted path and a bounded caller back-trace.
//!
//! The sink runs on the allocating thread with no tracer state locked, but
//! it must not allocate through the same tracer (the dispatch would recurse)
//! and must not take locks that other allocating threads may hold.

use std::ptr::{self, NonNull};
use std::sync::Arc;

use arrayvec::ArrayVec;

use crate::backend::Backend;
use crate::sys;

/// Maximum number of caller return addresses captured per event.
pub const BACKTRACE_MAX: usize = 8;

/// The traced operation and its size parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceOp {
    Malloc {
        size: usize,
    },
    Calloc {
        nmemb: usize,
        size: usize,
    },
    Realloc {
        old_ptr: *mut u8,
        old_size: usize,
        new_size: usize,
    },
    Free {
        size: usize,
    },
}

impl TraceOp {
    pub fn kind(&self) -> &'static str {
        match self {
            TraceOp::Malloc { .. } => "malloc",
            TraceOp::Calloc { .. } => "calloc",
            TraceOp::Realloc { .. } => "realloc",
            TraceOp::Free { .. } => "free",
        }
    }
}

/// One traced allocation event.
///
/// `name` and `backtrace` borrow from the dispatching call frame; a sink
/// that wants to keep them must copy them out before returning.
#[derive(Debug)]
pub struct TraceEvent<'a> {
    /// Dotted path of the handle the operation went through.
    pub name: &'a str,
    pub op: TraceOp,
    /// Resulting pointer, or the input pointer for `free`; null when the
    /// operation returned no allocation.
    pub ptr: *mut u8,
    /// Caller instruction pointers, most recent first, at most
    /// [`BACKTRACE_MAX`]. Capture stops at the first null frame.
    pub backtrace: &'a [usize],
}

type TraceSink = Arc<dyn for<'a> Fn(&TraceEvent<'a>) + Send + Sync>;

/// Backend decorating the platform heap with event tracing.
pub struct TraceAlloc {
    name: String,
    sink: TraceSink,
}

impl TraceAlloc {
    pub fn new(name: &str, sink: impl for<'a> Fn(&TraceEvent<'a>) + Send + Sync + 'static) -> Self {
        TraceAlloc {
            name: name.to_owned(),
            sink: Arc::new(sink),
        }
    }

    fn emit(&self, op: TraceOp, ptr: Option<NonNull<u8>>) {
        let frames = capture_backtrace();
        let event = TraceEvent {
            name: &self.name,
            op,
            ptr: ptr.map_or(ptr::null_mut(), NonNull::as_ptr),
            backtrace: &frames,
        };
        (self.sink)(&event);
    }
}

fn capture_backtrace() -> ArrayVec<usize, BACKTRACE_MAX> {
    let mut frames = ArrayVec::new();
    backtrace::trace(|frame| {
        let ip = frame.ip() as usize;
        if ip == 0 {
            return false;
        }
        frames.push(ip);
        !frames.is_full()
    });
    frames
}

impl Backend for TraceAlloc {
    fn child(&self, name: &str) -> Option<Arc<dyn Backend>> {
        Some(Arc::new(TraceAlloc {
            name: format!("{}.{}", self.name, name),
            sink: Arc::clone(&self.sink),
        }))
    }

    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let out = sys::malloc(size);
        self.emit(TraceOp::Malloc { size }, out);
        out
    }

    fn calloc(&self, nmemb: usize, size: usize) -> Option<NonNull<u8>> {
        let out = sys::calloc(nmemb, size);
        self.emit(TraceOp::Calloc { nmemb, size }, out);
        out
    }

    unsafe fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        let out = unsafe { sys::realloc(ptr, new_size) };
        self.emit(
            TraceOp::Realloc {
                old_ptr: ptr.map_or(ptr::null_mut(), NonNull::as_ptr),
                old_size,
                new_size,
            },
            out,
        );
        out
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        self.emit(TraceOp::Free { size }, Some(ptr));
        unsafe { sys::free(ptr) }
    }
}
