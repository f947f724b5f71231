//! Failure-injecting backend.
//!
//! Every allocation-returning operation consults a failure oracle; on a
//! "fail" verdict the call returns `None` without touching the heap. Frees
//! (including realloc-as-free) always reach the heap. The oracle is either
//! a two-state Markov chain, a deterministic success/failure automaton, or
//! a caller-supplied callback.

use std::ptr::NonNull;
use std::sync::{Arc, Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::backend::Backend;
use crate::sys;

enum Oracle {
    Random {
        p_failure: f64,
        p_recovery: f64,
        failing: bool,
        rng: StdRng,
    },
    Step {
        num_success: u32,
        num_failure: u32,
        repeat: bool,
        count: u32,
        failing: bool,
        failed_once: bool,
    },
    Custom(Box<dyn FnMut() -> bool + Send>),
}

impl Oracle {
    fn next_verdict(&mut self) -> bool {
        match self {
            Oracle::Random {
                p_failure,
                p_recovery,
                failing,
                rng,
            } => {
                // The draw is consumed whether or not it transitions.
                let p: f64 = rng.gen();
                if *failing {
                    if p < *p_recovery {
                        *failing = false;
                    }
                } else if p < *p_failure {
                    *failing = true;
                }
                *failing
            }
            Oracle::Step {
                num_success,
                num_failure,
                repeat,
                count,
                failing,
                failed_once,
            } => {
                *count += 1;
                if *failing {
                    if *count > *num_failure {
                        *failing = false;
                        *count = 1;
                    }
                } else if !*failed_once || *repeat {
                    if *count > *num_success {
                        *failing = true;
                        *failed_once = true;
                        *count = 1;
                    }
                }
                *failing
            }
            Oracle::Custom(f) => f(),
        }
    }
}

/// Backend decorating the platform heap with injected allocation failures.
///
/// Child backends share the parent's oracle, so a single policy covers the
/// whole subtree: allocations through any handle advance the same chain.
pub struct ChaosAlloc {
    oracle: Arc<Mutex<Oracle>>,
}

impl ChaosAlloc {
    fn with_oracle(oracle: Oracle) -> Self {
        ChaosAlloc {
            oracle: Arc::new(Mutex::new(oracle)),
        }
    }

    /// Two-state Markov chain. Each call draws a uniform `p` in `[0, 1)`;
    /// a failing oracle recovers when `p < p_recovery`, a healthy one fails
    /// when `p < p_failure`, and the verdict is the state after the
    /// transition.
    pub fn random(p_failure: f64, p_recovery: f64) -> Self {
        Self::random_rng(p_failure, p_recovery, StdRng::from_entropy())
    }

    /// [`ChaosAlloc::random`] with a deterministic seed, for reproducible
    /// failure sequences.
    pub fn random_seeded(p_failure: f64, p_recovery: f64, seed: u64) -> Self {
        Self::random_rng(p_failure, p_recovery, StdRng::seed_from_u64(seed))
    }

    fn random_rng(p_failure: f64, p_recovery: f64, rng: StdRng) -> Self {
        Self::with_oracle(Oracle::Random {
            p_failure,
            p_recovery,
            failing: false,
            rng,
        })
    }

    /// Deterministic alternation: `num_success` successful calls, then
    /// `num_failure` failing calls. With `repeat` the pattern cycles;
    /// without it the oracle succeeds forever after its first failure
    /// phase.
    pub fn step(num_success: u32, num_failure: u32, repeat: bool) -> Self {
        Self::with_oracle(Oracle::Step {
            num_success,
            num_failure,
            repeat,
            count: 0,
            failing: false,
            failed_once: false,
        })
    }

    /// Caller-supplied oracle; `true` means fail the current allocation.
    pub fn custom(f: impl FnMut() -> bool + Send + 'static) -> Self {
        Self::with_oracle(Oracle::Custom(Box::new(f)))
    }

    fn should_fail(&self) -> bool {
        let mut oracle = self.oracle.lock().unwrap_or_else(PoisonError::into_inner);
        let verdict = oracle.next_verdict();
        if verdict {
            log::trace!("chaos oracle verdict: fail");
        }
        verdict
    }
}

impl Backend for ChaosAlloc {
    fn child(&self, _name: &str) -> Option<Arc<dyn Backend>> {
        Some(Arc::new(ChaosAlloc {
            oracle: Arc::clone(&self.oracle),
        }))
    }

    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        if self.should_fail() {
            return None;
        }
        sys::malloc(size)
    }

    fn calloc(&self, nmemb: usize, size: usize) -> Option<NonNull<u8>> {
        if self.should_fail() {
            return None;
        }
        sys::calloc(nmemb, size)
    }

    unsafe fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        _old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        // A shrink to zero is a free; those are never injected.
        if new_size == 0 {
            return unsafe { sys::realloc(ptr, 0) };
        }
        if self.should_fail() {
            return None;
        }
        unsafe { sys::realloc(ptr, new_size) }
    }

    unsafe fn free(&self, ptr: NonNull<u8>, _size: usize) {
        unsafe { sys::free(ptr) }
    }
}
