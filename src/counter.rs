//! The pointer-sized integer lvalue a counter access expands to.

use std::ops::{Deref, DerefMut};

/// A handle to one thread's slot of one counter.
///
/// This is the runtime type the [`crate::counter!`] macro hands back: a
/// thin wrapper around a raw pointer into the calling thread's slot of the
/// active stats file. `Deref`/`DerefMut` to `i64` give it lvalue-like
/// ergonomics (`*counter!(M, "x") += 1;`) while keeping the actual access a
/// single load or store - no atomics, because a slot is only ever touched
/// by the one thread that owns it.
///
/// # Safety invariant
///
/// The pointer is only ever produced by [`crate::module::Module`] from the
/// calling thread's own, currently-bound slot, so aliasing across threads
/// cannot happen: every other thread gets a pointer into its own distinct
/// slot. A `Counter` must not outlive the scope of the expression that
/// produced it (do not store one across a potential thread-slot reopen).
pub struct Counter {
    ptr: *mut i64,
}

impl Counter {
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of an `i64` for as long as
    /// the returned `Counter` is used, and must not be concurrently
    /// accessed by any other thread.
    pub(crate) unsafe fn new(ptr: *mut i64) -> Self {
        Counter { ptr }
    }
}

impl Deref for Counter {
    type Target = i64;

    #[inline]
    fn deref(&self) -> &i64 {
        // SAFETY: see the type-level invariant.
        unsafe { &*self.ptr }
    }
}

impl DerefMut for Counter {
    #[inline]
    fn deref_mut(&mut self) -> &mut i64 {
        // SAFETY: see the type-level invariant.
        unsafe { &mut *self.ptr }
    }
}

/// Expands to a pointer-sized signed integer lvalue for the named counter.
///
/// `module` must be a [`crate::Module`] declared with
/// [`crate::stats_module!`]. `name` is a dotted counter name literal; two
/// call sites using the same `module` and the same `name` refer to the
/// same counter - the handle's address differs per thread, but the
/// counter identity (its position in the published name table) is shared.
///
/// ```
/// slotstat::stats_module!(MODULE);
///
/// *slotstat::counter!(MODULE, "demo.hits") += 1;
/// ```
#[macro_export]
macro_rules! counter {
    ($module:expr, $name:literal) => {{
        $crate::__private::inventory::submit! {
            $crate::__private::CounterDecl { module: &$module, name: $name }
        }
        static INDEX: ::std::sync::OnceLock<u32> = ::std::sync::OnceLock::new();
        let module = &$module;
        let idx = *INDEX.get_or_init(|| module.index_of($name));
        // SAFETY: `value_ptr` always returns a pointer into the calling
        // thread's own slot, freshly bound if necessary.
        unsafe { $crate::Counter::new(module.value_ptr(idx)) }
    }};
}
