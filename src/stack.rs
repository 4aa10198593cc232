//! Stack growth for recursive tree walks
//!
//! The AST builder, the restrictor and the evaluator all recurse over
//! user-controlled trees. Each recursive step runs through
//! [`ensure_sufficient_stack`], which switches to a fresh heap-allocated
//! segment when the remaining native stack gets low.

/// Remaining stack below which a new segment is allocated
const RED_ZONE: usize = 100 * 1024;

/// Size of each newly allocated segment
const STACK_PER_RECURSION: usize = 1024 * 1024;

/// Stack reserved for one pest parse, whose recursion is internal to pest
pub const PARSE_STACK_SIZE: usize = 64 * 1024 * 1024;

#[inline]
pub fn ensure_sufficient_stack<R>(f: impl FnOnce() -> R) -> R {
    stacker::maybe_grow(RED_ZONE, STACK_PER_RECURSION, f)
}

/// Run `f` on a dedicated stack of [`PARSE_STACK_SIZE`] bytes
pub fn with_parse_stack<R>(f: impl FnOnce() -> R) -> R {
    stacker::grow(PARSE_STACK_SIZE, f)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depth(n: u64) -> u64 {
        if n == 0 {
            0
        } else {
            ensure_sufficient_stack(|| 1 + depth(n - 1))
        }
    }

    #[test]
    fn test_deep_recursion_does_not_overflow() {
        assert_eq!(depth(200_000), 200_000);
    }
}
