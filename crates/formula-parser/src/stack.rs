//! Stack growth for recursive tree walks
//!
//! Parsing, interpretation, folding and closure compilation recurse once per
//! nesting level. Deep formulas (hundreds of nested parentheses) would
//! otherwise be bounded by the thread's stack size.

/// If less than this remains, grow the stack (100KB)
const RED_ZONE: usize = 100 * 1024;

/// Size of each new stack segment (1MB)
const STACK_PER_RECURSION: usize = 1024 * 1024;

/// Run `f`, first growing the stack if it is close to exhausted
#[inline]
#[cfg(not(target_arch = "wasm32"))]
pub fn ensure_sufficient_stack<R>(f: impl FnOnce() -> R) -> R {
    stacker::maybe_grow(RED_ZONE, STACK_PER_RECURSION, f)
}

#[inline]
#[cfg(target_arch = "wasm32")]
pub fn ensure_sufficient_stack<R>(f: impl FnOnce() -> R) -> R {
    f()
}
