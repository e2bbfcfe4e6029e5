//! Utility macros shared by the builders.

/// Early-returns `Err($error)` when the predicate does not hold.
///
/// Like `assert!`, but for validation paths that must report instead of panic.
///
/// ```ignore
/// ensure!(flat.len() % 2 == 0, ClientError::malformed_input("odd number of header arguments"));
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;
