//! Heap object model.
//!
//! ## Object layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Obj header (shared by every variant)          │
//! │   mark: bool        — GC mark bit             │
//! │   pin_count: u32     — explicit-root refcount │
//! │   tag: ObjTag        — which variant follows  │
//! │   next: *mut Obj      — intrusive alloc list  │
//! ├──────────────────────────────────────────────┤
//! │ variant payload (ObjString, ObjFunction, ...) │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Every variant struct embeds an `Obj` as its first field so a `*mut Obj`
//! can be reinterpreted as `*mut ObjString` etc. once the tag confirms the
//! variant — the same trick clox plays with C struct layout, expressed here
//! with `#[repr(C)]` and unsafe pointer casts instead of `void*`.

use crate::value::Value;
use std::fmt;
use std::ptr::NonNull;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjTag {
    String,
    Function,
    Upvalue,
    Closure,
    Native,
    Class,
    Instance,
    BoundMethod,
    Promise,
    Array,
}

/// The header every heap object carries. `next` threads every live object
/// into the VM's single allocation list; sweeping walks this list once.
#[repr(C)]
pub struct Obj {
    pub mark: bool,
    pub pin_count: u32,
    pub tag: ObjTag,
    pub next: *mut Obj,
}

impl Obj {
    pub fn new(tag: ObjTag) -> Obj {
        Obj {
            mark: false,
            pin_count: 0,
            tag,
            next: std::ptr::null_mut(),
        }
    }
}

/// A `Copy`, pointer-identity handle to a heap object. Two `ObjRef`s are
/// `==` iff they reference the same allocation (the GC never moves
/// objects), which is exactly the identity equality §3 requires for every
/// object variant except strings — and interning makes identity and
/// content equality coincide for strings too.
#[derive(Clone, Copy)]
pub struct ObjRef(pub NonNull<Obj>);

impl ObjRef {
    /// # Safety
    /// `ptr` must point to a live, fully-initialized `Obj` (or a struct
    /// whose first field is `Obj`).
    pub unsafe fn from_raw(ptr: *mut Obj) -> ObjRef {
        ObjRef(NonNull::new(ptr).expect("ObjRef::from_raw: null pointer"))
    }

    pub fn as_ptr(self) -> *mut Obj {
        self.0.as_ptr()
    }

    pub fn tag(self) -> ObjTag {
        unsafe { (*self.as_ptr()).tag }
    }

    pub fn is_marked(self) -> bool {
        unsafe { (*self.as_ptr()).mark }
    }

    pub fn set_marked(self, marked: bool) {
        unsafe { (*self.as_ptr()).mark = marked }
    }

    pub fn pin(self) {
        unsafe { (*self.as_ptr()).pin_count += 1 }
    }

    pub fn unpin(self) {
        unsafe {
            let obj = &mut *self.as_ptr();
            obj.pin_count = obj.pin_count.saturating_sub(1);
        }
    }

    pub fn is_pinned(self) -> bool {
        unsafe { (*self.as_ptr()).pin_count > 0 }
    }

    /// # Safety
    /// Caller must have checked `self.tag() == ObjTag::String` (etc. for
    /// the other `as_*` accessors below).
    pub unsafe fn as_string(self) -> &'static ObjString {
        unsafe { &*(self.as_ptr() as *const ObjString) }
    }

    pub unsafe fn as_function(self) -> &'static ObjFunction {
        unsafe { &*(self.as_ptr() as *const ObjFunction) }
    }

    /// Mutable access used only while the compiler is still building this
    /// function's chunk; once published into a `Closure` it's treated as
    /// immutable.
    pub unsafe fn as_function_mut(self) -> &'static mut ObjFunction {
        unsafe { &mut *(self.as_ptr() as *mut ObjFunction) }
    }

    pub unsafe fn as_upvalue(self) -> &'static mut ObjUpvalue {
        unsafe { &mut *(self.as_ptr() as *mut ObjUpvalue) }
    }

    pub unsafe fn as_closure(self) -> &'static ObjClosure {
        unsafe { &*(self.as_ptr() as *const ObjClosure) }
    }

    pub unsafe fn as_native(self) -> &'static ObjNative {
        unsafe { &*(self.as_ptr() as *const ObjNative) }
    }

    pub unsafe fn as_class(self) -> &'static mut ObjClass {
        unsafe { &mut *(self.as_ptr() as *mut ObjClass) }
    }

    pub unsafe fn as_instance(self) -> &'static mut ObjInstance {
        unsafe { &mut *(self.as_ptr() as *mut ObjInstance) }
    }

    pub unsafe fn as_bound_method(self) -> &'static ObjBoundMethod {
        unsafe { &*(self.as_ptr() as *const ObjBoundMethod) }
    }

    pub unsafe fn as_promise(self) -> &'static mut ObjPromise {
        unsafe { &mut *(self.as_ptr() as *mut ObjPromise) }
    }

    pub unsafe fn as_array(self) -> &'static mut ObjArray {
        unsafe { &mut *(self.as_ptr() as *mut ObjArray) }
    }
}

impl PartialEq for ObjRef {
    fn eq(&self, other: &Self) -> bool {
        self.as_ptr() == other.as_ptr()
    }
}
impl Eq for ObjRef {}

impl std::hash::Hash for ObjRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_ptr().hash(state);
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({:?}@{:p})", self.tag(), self.as_ptr())
    }
}

// SAFETY: the VM is single-threaded (§5); ObjRef is never shared across an
// OS thread boundary. Marked Send/Sync only so the handful of static
// registries that hold onto Values (native function plumbing) can store
// them without additional indirection.
unsafe impl Send for ObjRef {}
unsafe impl Sync for ObjRef {}

/// FNV-1a, matching clox's string hash so that interned-string identity
/// is a pure function of bytes.
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[repr(C)]
pub struct ObjString {
    pub obj: Obj,
    pub hash: u32,
    pub bytes: Box<[u8]>,
}

impl ObjString {
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes).unwrap_or("<invalid utf-8>")
    }
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
    pub fn len(&self) -> usize {
        self.bytes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[repr(C)]
pub struct ObjFunction {
    pub obj: Obj,
    pub arity: u8,
    pub upvalue_count: u8,
    pub is_async: bool,
    pub name: Option<ObjRef>, // ObjString, None for the top-level script
    pub chunk: crate::chunk::Chunk,
}

/// While open, points at a slot on some coroutine's value stack. Once
/// closed the value is copied inline and `location` is redirected to
/// `closed`.
#[repr(C)]
pub struct ObjUpvalue {
    pub obj: Obj,
    pub location: *mut Value,
    pub closed: Value,
    /// Open-upvalue list link, sorted by decreasing `location` address.
    pub next_open: Option<ObjRef>,
}

impl ObjUpvalue {
    pub fn is_open(&self) -> bool {
        !self.location.is_null()
    }

    pub fn get(&self) -> Value {
        if self.is_open() {
            unsafe { *self.location }
        } else {
            self.closed
        }
    }

    pub fn set(&mut self, v: Value) {
        if self.is_open() {
            unsafe { *self.location = v }
        } else {
            self.closed = v
        }
    }

    /// Copies the referenced stack slot inline and severs the pointer.
    pub fn close(&mut self) {
        if self.is_open() {
            self.closed = unsafe { *self.location };
            self.location = std::ptr::null_mut();
        }
    }
}

#[repr(C)]
pub struct ObjClosure {
    pub obj: Obj,
    pub function: ObjRef, // ObjFunction
    pub upvalues: Box<[ObjRef]>, // ObjUpvalue, fixed length = function.upvalue_count
}

/// A native function body: given a heap-allocation seam and its argument
/// slice, produces a value or an error message (wrapped into a
/// `RuntimeError` by the caller). Natives that need to suspend the calling
/// coroutine (timers, socket I/O) aren't expressible through this signature
/// — the VM special-cases those by name in its call dispatch instead of
/// routing them through `ObjNative` (see `ember-runtime`'s native registry).
pub type NativeFn = fn(&mut dyn crate::alloc::NativeContext, &[Value]) -> Result<Value, String>;

#[repr(C)]
pub struct ObjNative {
    pub obj: Obj,
    pub name: ObjRef, // ObjString
    pub arity: i32,   // -1 means variadic
    pub function: NativeFn,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StringKey(pub ObjRef);

impl StringKey {
    pub fn as_str(&self) -> &str {
        unsafe { self.0.as_string().as_str() }
    }
}

#[repr(C)]
pub struct ObjClass {
    pub obj: Obj,
    pub name: ObjRef, // ObjString
    pub id: u32,      // nonzero, monotonically assigned, used by inline caches
    pub methods: crate::table::Table,
}

#[repr(C)]
pub struct ObjInstance {
    pub obj: Obj,
    pub class: ObjRef, // ObjClass
    pub fields: crate::table::Table,
}

#[repr(C)]
pub struct ObjBoundMethod {
    pub obj: Obj,
    pub receiver: Value,
    pub method: ObjRef, // ObjClosure
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
}

#[repr(C)]
pub struct ObjPromise {
    pub obj: Obj,
    pub state: PromiseState,
    pub value: Value,
    /// Coroutines parked on `Await`, FIFO by registration order. Opaque to
    /// `ember-core`: the runtime casts these back to `*mut Coroutine`.
    /// Coroutines are not GC heap objects (§3 lists them as VM-owned,
    /// reference-managed separately from the mark-sweep object graph), so
    /// this can't be an `ObjRef`.
    pub waiters: Vec<*mut ()>,
    /// A downstream promise to fulfill with the same value once this one
    /// resolves — collapses `async fn` whose return value is itself a
    /// Promise.
    pub chained: Option<ObjRef>, // ObjPromise
}

#[repr(C)]
pub struct ObjArray {
    pub obj: Obj,
    pub elements: Box<[Value]>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_is_deterministic() {
        assert_eq!(fnv1a_hash(b"hello"), fnv1a_hash(b"hello"));
        assert_ne!(fnv1a_hash(b"hello"), fnv1a_hash(b"world"));
    }
}
