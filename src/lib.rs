#![doc = include_str!("../README.md")]

pub mod backend;
pub mod stats;
mod sys;
mod tree;

pub use backend::{Backend, ChaosAlloc, SystemHeap, TraceAlloc, TraceEvent, TraceOp, BACKTRACE_MAX};
pub use stats::AllocStats;
pub use tree::{Alloc, Children, LeakReport};
