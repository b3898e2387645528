//! Ember Core: value/object model, bytecode chunk, and the interned-string
//! hash map shared between the compiler and the runtime.
//!
//! Key design principles:
//! - `Value`: what the language talks about (nil, bool, number, object ref).
//! - `Obj`: the root of every heap value; a C-style header (mark flag, pin
//!   counter, tag, next-in-allocation-list pointer) followed by
//!   variant-specific payload, mirroring the `Obj`/`ObjString` layering of
//!   the clox family this VM descends from.
//! - `Chunk`: flat bytecode + parallel per-byte source locations + a
//!   constant pool. Stable within a single compilation, nothing more.

pub mod alloc;
pub mod chunk;
pub mod object;
pub mod table;
pub mod value;

pub use alloc::{Allocator, NativeContext};
pub use chunk::{Chunk, Loc, OpCode};
pub use object::{
    fnv1a_hash, NativeFn, Obj, ObjArray, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction,
    ObjInstance, ObjNative, ObjPromise, ObjRef, ObjString, ObjTag, ObjUpvalue, PromiseState,
    StringKey,
};
pub use table::Table;
pub use value::Value;
