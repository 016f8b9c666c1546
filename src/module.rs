//! Component A: the per-load-module name registry.
//!
//! A real linker can merge identical weak symbols across translation
//! units and bracket a section with `__start`/`__stop` symbols, giving a
//! load module a zero-runtime-cost, enumerable array of per-name cells.
//! Stable Rust has no portable equivalent reachable from safe code
//! without a build script, but [`inventory`] gets remarkably close: every
//! [`counter!`](crate::counter!) call site submits its `(module, name)`
//! pair from a startup constructor, so by the time any application code
//! runs - even the first line of `main` - every module's full, final
//! counter set is already collected, exactly mirroring the link-time
//! guarantee the spec asks for. A [`Module`] only has to group the
//! already-complete collection by module identity, once, lazily.
//!
//! A `Module` is the Rust stand-in for "one load module": library
//! authors declare one `static` per crate (or subsystem) with
//! [`stats_module!`], matching the spec's "one descriptor per load
//! module" requirement as closely as a single binary's compilation units
//! allow.

use std::sync::{Mutex, OnceLock};

/// One `counter!` call site's declaration, collected at startup.
///
/// Not constructed directly - [`counter!`](crate::counter!) submits one
/// of these per call site.
#[doc(hidden)]
pub struct CounterDecl {
    pub module: &'static Module,
    pub name: &'static str,
}

inventory::collect!(CounterDecl);

/// A load-module's counter name table.
///
/// Declare one per crate (or logical subsystem) with [`stats_module!`]:
///
/// ```
/// slotstat::stats_module!(MODULE);
///
/// fn handle_request() {
///     *slotstat::counter!(MODULE, "demo.requests") += 1;
/// }
/// ```
pub struct Module {
    /// This module's distinct counter names, in first-submission order,
    /// computed once from the global [`CounterDecl`] collection.
    names: OnceLock<Vec<&'static str>>,
}

impl Module {
    /// Creates an empty, unregistered module. Use [`stats_module!`] rather
    /// than calling this directly so the module is linked into the
    /// process-global registry before any counter touches it.
    pub const fn new() -> Self {
        Module {
            names: OnceLock::new(),
        }
    }

    /// This module's distinct counter names, deduplicated by text,
    /// collection order. Computed once: by the time anything calls this,
    /// every [`counter!`](crate::counter!) call site in the binary has
    /// already run its startup submission, so the result never changes.
    fn names(&self) -> &[&'static str] {
        self.names.get_or_init(|| {
            let mut names: Vec<&'static str> = Vec::new();
            for decl in inventory::iter::<CounterDecl> {
                if std::ptr::eq(decl.module, self) && !names.contains(&decl.name) {
                    names.push(decl.name);
                }
            }
            names
        })
    }

    /// Returns the module-local index for `name`. `name` must have been
    /// submitted for this module by at least one `counter!` call site -
    /// true by construction, since [`counter!`](crate::counter!) submits
    /// before it ever asks for an index.
    pub fn index_of(&self, name: &'static str) -> u32 {
        self.names()
            .iter()
            .position(|&n| n == name)
            .expect("counter! submits a module's declaration before indexing it") as u32
    }

    /// Number of distinct counters registered in this module.
    pub(crate) fn value_count(&self) -> u32 {
        self.names().len() as u32
    }

    /// Total byte size of this module's NUL-terminated name blob.
    pub(crate) fn names_blob_len(&self) -> usize {
        self.names().iter().map(|name| name.len() + 1).sum()
    }

    /// Returns the registered names in the order module-local indices
    /// were handed out - the same order the per-thread value array and
    /// the file's name table must agree on.
    pub(crate) fn names_snapshot(&self) -> Vec<&'static str> {
        self.names().to_vec()
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide list of registered modules, in registration order.
///
/// Registration order determines each module's base index into the
/// per-thread value array, and therefore must match the order modules
/// contribute their name strings to the file's name table.
pub(crate) static MODULE_REGISTRY: Mutex<Vec<&'static Module>> = Mutex::new(Vec::new());

/// Links `module` onto the process-global module list.
///
/// Called once per module, from a [`ctor`] constructor emitted by
/// [`stats_module!`] - the closest portable stand-in for a C library's
/// `__attribute__((constructor))` module-registration hook. Constructors
/// run single-threaded before `main`, so no synchronization is required
/// beyond the mutex itself (a plain `Mutex<Vec<_>>` rather than a
/// lock-free list, since there is no concurrent access to guard against
/// at this point in the program).
pub fn register_module(module: &'static Module) {
    MODULE_REGISTRY
        .lock()
        .expect("module registry poisoned")
        .push(module);
}

/// Declares a [`Module`] static and links it into the process-wide
/// registry via a startup constructor.
///
/// ```
/// slotstat::stats_module!(MY_SUBSYSTEM);
/// ```
#[macro_export]
macro_rules! stats_module {
    ($name:ident) => {
        static $name: $crate::Module = $crate::Module::new();

        #[$crate::__private::ctor]
        fn __register_module() {
            $crate::__private::register_module(&$name);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_deduplicated_and_ordered_by_first_submission() {
        static M: Module = Module::new();
        inventory::submit! { CounterDecl { module: &M, name: "a.b.c" } }
        inventory::submit! { CounterDecl { module: &M, name: "a.b.c" } }
        inventory::submit! { CounterDecl { module: &M, name: "a.b.d" } }

        assert_eq!(M.value_count(), 2);
        assert_eq!(M.names_snapshot(), vec!["a.b.c", "a.b.d"]);
        assert_eq!(M.index_of("a.b.c"), 0);
        assert_eq!(M.index_of("a.b.d"), 1);
        assert_eq!(M.names_blob_len(), "a.b.c\0a.b.d\0".len());
    }

    #[test]
    fn distinct_modules_do_not_share_indices() {
        static A: Module = Module::new();
        static B: Module = Module::new();
        inventory::submit! { CounterDecl { module: &A, name: "shared.name" } }
        inventory::submit! { CounterDecl { module: &B, name: "shared.name" } }

        assert_eq!(A.index_of("shared.name"), 0);
        assert_eq!(B.index_of("shared.name"), 0);
        assert_eq!(A.value_count(), 1);
        assert_eq!(B.value_count(), 1);
    }
}
