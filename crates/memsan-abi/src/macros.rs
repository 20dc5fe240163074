//! Helper macros for hook generation.
//!
//! Provides the `hook_fn!` macro that generates `#[unsafe(no_mangle)] pub extern "C" fn`
//! wrappers which resolve the process-wide engine before running the body.

/// Generate an exported hook.
///
/// # Usage
///
/// ```ignore
/// hook_fn! {
///     /// Doc comment for the hook.
///     fn memsan_thing(addr: u64, size: usize) -> c_int [passthrough = 0] |engine| {
///         // body using `engine: &'static Sanitizer`
///     }
/// }
/// ```
///
/// Before `memsan_init`, or while another thread is still constructing the
/// engine, the hook returns the passthrough value without touching anything.
/// Fatal engine paths panic; panics cannot unwind out of `extern "C"`, so the
/// process aborts.
macro_rules! hook_fn {
    (
        $(#[$meta:meta])*
        fn $name:ident( $($arg:ident : $argty:ty),* $(,)? ) -> $ret:ty
        [passthrough = $default:expr] |$engine:ident| $body:block
    ) => {
        $(#[$meta])*
        #[unsafe(no_mangle)]
        pub extern "C" fn $name( $($arg : $argty),* ) -> $ret {
            let Some($engine) = $crate::engine_state::engine() else {
                return $default;
            };
            $body
        }
    };

    // Variant without return type (returns ())
    (
        $(#[$meta:meta])*
        fn $name:ident( $($arg:ident : $argty:ty),* $(,)? ) |$engine:ident| $body:block
    ) => {
        $(#[$meta])*
        #[unsafe(no_mangle)]
        pub extern "C" fn $name( $($arg : $argty),* ) {
            let Some($engine) = $crate::engine_state::engine() else {
                return;
            };
            $body
        }
    };
}

pub(crate) use hook_fn;
