//! Fatal assertions for broken internal invariants.
//!
//! A failed assertion means a caller or the engine itself is wrong, never a
//! runtime condition. It is logged and then aborts the current task with a
//! panic carrying the diagnostic.
//!
//! The macros are crate-private; modules declared after this one in
//! `lib.rs` see them through `#[macro_use]`.

/// Prefix of every fatal assertion message.
pub(crate) const ASSERTION_PREFIX: &str = "INTERNAL ASSERTION FAILED";

/// Logs and panics with an internal assertion failure.
macro_rules! fail {
    ($($arg:tt)+) => {{
        let message = format!($($arg)+);
        tracing::error!(%message, "{}", $crate::assert::ASSERTION_PREFIX);
        panic!("{}: {}", $crate::assert::ASSERTION_PREFIX, message)
    }};
}

/// Fails with the given diagnostic unless `cond` holds.
macro_rules! hard_assert {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            fail!($($arg)+);
        }
    };
}

#[cfg(test)]
mod tests {
    #[test]
    #[should_panic(expected = "INTERNAL ASSERTION FAILED: unreachable state")]
    fn fail_panics_with_diagnostic() {
        fail!("unreachable {}", "state");
    }

    #[test]
    fn passing_assertion_is_silent() {
        hard_assert!(1 + 1 == 2, "math is broken");
    }

    #[test]
    #[should_panic(expected = "INTERNAL ASSERTION FAILED: target 3 missing")]
    fn failing_assertion_panics_with_diagnostic() {
        hard_assert!(false, "target {} missing", 3);
    }
}
