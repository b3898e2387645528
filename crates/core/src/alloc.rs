//! The allocation seam between the compiler and the runtime heap.
//!
//! `ember-compiler` needs to intern strings and allocate bare `Function`
//! objects while it emits bytecode, but the heap/GC themselves live in
//! `ember-runtime` (which depends on `ember-compiler`, not the other way
//! around). This trait is the shared interface: `ember-runtime::Heap`
//! implements it, and the compiler is generic over "something that can
//! allocate," exactly mirroring how clox shares one allocator between the
//! compiler and the VM because they're the same process and the same GC
//! roots (§4.5: "the compiler chain's current Functions" are GC roots
//! *during* compilation).

use crate::object::ObjRef;
use crate::value::Value;

pub trait Allocator {
    /// Returns the interned string for `bytes`, allocating and inserting
    /// it into the intern set if it isn't already present (§3).
    fn intern_string(&mut self, bytes: &[u8]) -> ObjRef;

    /// Allocates a fresh, empty `Function` object (zero-arity, zero
    /// upvalues, empty chunk) that the compiler then fills in place via
    /// `ObjRef::as_function_mut`.
    fn new_function(&mut self, name: Option<ObjRef>) -> ObjRef;
}

/// The allocation seam a native function body is given instead of direct
/// heap access — the same reasoning as [`Allocator`], one level up: native
/// bodies live in `ember-runtime` next to the heap they'd allocate through,
/// but `ObjNative::function` is a plain `fn` pointer so it has to reach the
/// heap through a trait object rather than a borrow of a concrete `Heap`.
pub trait NativeContext {
    fn alloc_array(&mut self, elements: Box<[Value]>) -> ObjRef;
    fn intern_string(&mut self, bytes: &[u8]) -> ObjRef;
}
