//! Allocation, string interning, and mark-and-sweep collection (§4.5).
//!
//! `Heap` owns the intrusive objects list and the intern set. It does not
//! know about coroutines, call frames, or globals — the VM supplies those
//! as additional mark roots when it decides to collect (see `vm::Vm::collect`).
//! The only roots `Heap` tracks itself are explicit pins: the native-function
//! "allocate then suspend" pattern (§4.5 "Pinning") and a temporary pin the
//! compiler's [`Allocator`] implementation applies to every object it
//! creates, since a `Function` under construction isn't reachable from any
//! VM root until compilation finishes and the caller starts running it.

use ember_core::{
    fnv1a_hash, Allocator, Obj, ObjArray, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction,
    ObjInstance, ObjNative, ObjPromise, ObjRef, ObjString, ObjTag, ObjUpvalue, PromiseState,
    Table, Value,
};
use std::mem;

use crate::config::Config;

pub struct Heap {
    objects: *mut Obj,
    strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
    config: Config,
    /// Native "allocate then suspend" pins plus the compiler's temporary
    /// construction-time pins; both just bump the same `pin_count`.
    pins: Vec<ObjRef>,
    pub init_string: ObjRef,
    pub length_string: ObjRef,
}

impl Heap {
    pub fn new(config: Config) -> Heap {
        let mut heap = Heap {
            objects: std::ptr::null_mut(),
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: config.gc_initial_bytes,
            config,
            pins: Vec::new(),
            init_string: ObjRef(std::ptr::NonNull::dangling()),
            length_string: ObjRef(std::ptr::NonNull::dangling()),
        };
        heap.init_string = heap.intern(b"init");
        heap.length_string = heap.intern(b"length");
        heap
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn should_collect(&self) -> bool {
        self.config.gc_stress || self.bytes_allocated >= self.next_gc
    }

    pub fn pins(&self) -> &[ObjRef] {
        &self.pins
    }

    /// Explicit "disable_gc" root (§4.5): keeps `obj` alive regardless of
    /// reachability until [`Heap::unpin`] is called a matching number of
    /// times.
    pub fn pin(&mut self, obj: ObjRef) {
        obj.pin();
        self.pins.push(obj);
    }

    pub fn unpin(&mut self, obj: ObjRef) {
        obj.unpin();
    }

    /// Drops pin-list entries whose `pin_count` has returned to zero.
    /// Cheap to run right before a collection; doesn't need to run eagerly.
    pub fn compact_pins(&mut self) {
        self.pins.retain(|o| o.is_pinned());
    }

    /// Releases every pin left over from compilation. Called once the
    /// compiled script is rooted on the initial coroutine's stack, since
    /// from that point on the VM's own root enumeration keeps it alive.
    pub fn clear_compile_pins(&mut self) {
        for obj in self.pins.drain(..) {
            obj.unpin();
        }
    }

    fn link(&mut self, ptr: *mut Obj, size: usize) {
        unsafe {
            (*ptr).next = self.objects;
        }
        self.objects = ptr;
        self.bytes_allocated += size;
    }

    // ---- allocation (no pinning: callers are expected to root the result
    // onto a VM stack or into a reachable structure before any further
    // allocation can trigger a collection) -------------------------------

    pub fn intern(&mut self, bytes: &[u8]) -> ObjRef {
        let hash = fnv1a_hash(bytes);
        if let Some(existing) = self.strings.find_key(bytes, hash) {
            return existing;
        }
        let obj = Box::new(ObjString {
            obj: Obj::new(ObjTag::String),
            hash,
            bytes: bytes.to_vec().into_boxed_slice(),
        });
        let ptr = Box::into_raw(obj);
        self.link(ptr as *mut Obj, mem::size_of::<ObjString>());
        let r = unsafe { ObjRef::from_raw(ptr as *mut Obj) };
        self.strings.set(r, Value::Nil);
        r
    }

    pub fn alloc_function(&mut self, name: Option<ObjRef>) -> ObjRef {
        let obj = Box::new(ObjFunction {
            obj: Obj::new(ObjTag::Function),
            arity: 0,
            upvalue_count: 0,
            is_async: false,
            name,
            chunk: ember_core::Chunk::new(),
        });
        let ptr = Box::into_raw(obj);
        self.link(ptr as *mut Obj, mem::size_of::<ObjFunction>());
        unsafe { ObjRef::from_raw(ptr as *mut Obj) }
    }

    pub fn alloc_closure(&mut self, function: ObjRef, upvalues: Box<[ObjRef]>) -> ObjRef {
        let obj = Box::new(ObjClosure {
            obj: Obj::new(ObjTag::Closure),
            function,
            upvalues,
        });
        let ptr = Box::into_raw(obj);
        self.link(ptr as *mut Obj, mem::size_of::<ObjClosure>());
        unsafe { ObjRef::from_raw(ptr as *mut Obj) }
    }

    pub fn alloc_native(&mut self, name: ObjRef, arity: i32, function: ember_core::NativeFn) -> ObjRef {
        let obj = Box::new(ObjNative {
            obj: Obj::new(ObjTag::Native),
            name,
            arity,
            function,
        });
        let ptr = Box::into_raw(obj);
        self.link(ptr as *mut Obj, mem::size_of::<ObjNative>());
        unsafe { ObjRef::from_raw(ptr as *mut Obj) }
    }

    pub fn alloc_upvalue(&mut self, location: *mut Value) -> ObjRef {
        let obj = Box::new(ObjUpvalue {
            obj: Obj::new(ObjTag::Upvalue),
            location,
            closed: Value::Nil,
            next_open: None,
        });
        let ptr = Box::into_raw(obj);
        self.link(ptr as *mut Obj, mem::size_of::<ObjUpvalue>());
        unsafe { ObjRef::from_raw(ptr as *mut Obj) }
    }

    pub fn alloc_class(&mut self, name: ObjRef, id: u32) -> ObjRef {
        let obj = Box::new(ObjClass {
            obj: Obj::new(ObjTag::Class),
            name,
            id,
            methods: Table::new(),
        });
        let ptr = Box::into_raw(obj);
        self.link(ptr as *mut Obj, mem::size_of::<ObjClass>());
        unsafe { ObjRef::from_raw(ptr as *mut Obj) }
    }

    pub fn alloc_instance(&mut self, class: ObjRef) -> ObjRef {
        let obj = Box::new(ObjInstance {
            obj: Obj::new(ObjTag::Instance),
            class,
            fields: Table::new(),
        });
        let ptr = Box::into_raw(obj);
        self.link(ptr as *mut Obj, mem::size_of::<ObjInstance>());
        unsafe { ObjRef::from_raw(ptr as *mut Obj) }
    }

    pub fn alloc_bound_method(&mut self, receiver: Value, method: ObjRef) -> ObjRef {
        let obj = Box::new(ObjBoundMethod {
            obj: Obj::new(ObjTag::BoundMethod),
            receiver,
            method,
        });
        let ptr = Box::into_raw(obj);
        self.link(ptr as *mut Obj, mem::size_of::<ObjBoundMethod>());
        unsafe { ObjRef::from_raw(ptr as *mut Obj) }
    }

    pub fn alloc_promise(&mut self) -> ObjRef {
        let obj = Box::new(ObjPromise {
            obj: Obj::new(ObjTag::Promise),
            state: PromiseState::Pending,
            value: Value::Nil,
            waiters: Vec::new(),
            chained: None,
        });
        let ptr = Box::into_raw(obj);
        self.link(ptr as *mut Obj, mem::size_of::<ObjPromise>());
        unsafe { ObjRef::from_raw(ptr as *mut Obj) }
    }

    pub fn alloc_array(&mut self, elements: Box<[Value]>) -> ObjRef {
        let obj = Box::new(ObjArray {
            obj: Obj::new(ObjTag::Array),
            elements,
        });
        let ptr = Box::into_raw(obj);
        self.link(ptr as *mut Obj, mem::size_of::<ObjArray>());
        unsafe { ObjRef::from_raw(ptr as *mut Obj) }
    }

    // ---- mark-phase helpers ---------------------------------------------

    /// Marks `value` and, if it's an object not yet grey/black, pushes its
    /// successors onto `grey_stack` for [`trace`](Heap::trace) to visit.
    pub fn mark_value(value: Value, grey_stack: &mut Vec<ObjRef>) {
        if let Value::Obj(obj) = value {
            Heap::mark_object(obj, grey_stack);
        }
    }

    pub fn mark_object(obj: ObjRef, grey_stack: &mut Vec<ObjRef>) {
        if obj.is_marked() {
            return;
        }
        obj.set_marked(true);
        match obj.tag() {
            // Strings and natives have no outgoing references — "black"
            // immediately, never pushed to the grey stack (§4.5).
            ObjTag::String | ObjTag::Native => {}
            _ => grey_stack.push(obj),
        }
    }

    /// Pops one grey object and marks its successors. Called in a loop
    /// until the grey stack is empty.
    pub fn trace_one(obj: ObjRef, grey_stack: &mut Vec<ObjRef>) {
        match obj.tag() {
            ObjTag::String | ObjTag::Native => {}
            ObjTag::Function => {
                let f = unsafe { obj.as_function() };
                if let Some(name) = f.name {
                    Heap::mark_object(name, grey_stack);
                }
                for c in f.chunk.constants.iter() {
                    Heap::mark_value(*c, grey_stack);
                }
            }
            ObjTag::Upvalue => {
                let u = unsafe { obj.as_upvalue() };
                Heap::mark_value(u.get(), grey_stack);
            }
            ObjTag::Closure => {
                let c = unsafe { obj.as_closure() };
                Heap::mark_object(c.function, grey_stack);
                for up in c.upvalues.iter() {
                    Heap::mark_object(*up, grey_stack);
                }
            }
            ObjTag::Class => {
                let cls = unsafe { obj.as_class() };
                Heap::mark_object(cls.name, grey_stack);
                for (k, v) in cls.methods.iter() {
                    Heap::mark_object(k, grey_stack);
                    Heap::mark_value(v, grey_stack);
                }
            }
            ObjTag::Instance => {
                let inst = unsafe { obj.as_instance() };
                Heap::mark_object(inst.class, grey_stack);
                for (k, v) in inst.fields.iter() {
                    Heap::mark_object(k, grey_stack);
                    Heap::mark_value(v, grey_stack);
                }
            }
            ObjTag::BoundMethod => {
                let bm = unsafe { obj.as_bound_method() };
                Heap::mark_value(bm.receiver, grey_stack);
                Heap::mark_object(bm.method, grey_stack);
            }
            ObjTag::Promise => {
                let p = unsafe { obj.as_promise() };
                if p.state == PromiseState::Fulfilled {
                    Heap::mark_value(p.value, grey_stack);
                }
                if let Some(chained) = p.chained {
                    Heap::mark_object(chained, grey_stack);
                }
            }
            ObjTag::Array => {
                let a = unsafe { obj.as_array() };
                for v in a.elements.iter() {
                    Heap::mark_value(*v, grey_stack);
                }
            }
        }
    }

    /// Weak-key intern cleanup, then sweeps every unmarked object off the
    /// objects list and frees it. Unmarks survivors for the next cycle.
    pub fn sweep(&mut self) {
        self.strings.remove_unmarked_keys();

        let mut prev: *mut Obj = std::ptr::null_mut();
        let mut current = self.objects;
        while !current.is_null() {
            unsafe {
                let next = (*current).next;
                if (*current).mark {
                    (*current).mark = false;
                    prev = current;
                } else {
                    if prev.is_null() {
                        self.objects = next;
                    } else {
                        (*prev).next = next;
                    }
                    self.bytes_allocated -= free_object(current);
                }
                current = next;
            }
        }
        self.next_gc = self.bytes_allocated.max(self.config.gc_initial_bytes) * 2;
    }
}

/// Drops the correctly-typed box behind `ptr` and returns its size.
///
/// # Safety
/// `ptr` must point to a live object matching its own `tag` and must not
/// be referenced again afterward.
unsafe fn free_object(ptr: *mut Obj) -> usize {
    let tag = unsafe { (*ptr).tag };
    match tag {
        ObjTag::String => {
            drop(unsafe { Box::from_raw(ptr as *mut ObjString) });
            mem::size_of::<ObjString>()
        }
        ObjTag::Function => {
            drop(unsafe { Box::from_raw(ptr as *mut ObjFunction) });
            mem::size_of::<ObjFunction>()
        }
        ObjTag::Upvalue => {
            drop(unsafe { Box::from_raw(ptr as *mut ObjUpvalue) });
            mem::size_of::<ObjUpvalue>()
        }
        ObjTag::Closure => {
            drop(unsafe { Box::from_raw(ptr as *mut ObjClosure) });
            mem::size_of::<ObjClosure>()
        }
        ObjTag::Native => {
            drop(unsafe { Box::from_raw(ptr as *mut ObjNative) });
            mem::size_of::<ObjNative>()
        }
        ObjTag::Class => {
            drop(unsafe { Box::from_raw(ptr as *mut ObjClass) });
            mem::size_of::<ObjClass>()
        }
        ObjTag::Instance => {
            drop(unsafe { Box::from_raw(ptr as *mut ObjInstance) });
            mem::size_of::<ObjInstance>()
        }
        ObjTag::BoundMethod => {
            drop(unsafe { Box::from_raw(ptr as *mut ObjBoundMethod) });
            mem::size_of::<ObjBoundMethod>()
        }
        ObjTag::Promise => {
            drop(unsafe { Box::from_raw(ptr as *mut ObjPromise) });
            mem::size_of::<ObjPromise>()
        }
        ObjTag::Array => {
            drop(unsafe { Box::from_raw(ptr as *mut ObjArray) });
            mem::size_of::<ObjArray>()
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut current = self.objects;
        while !current.is_null() {
            unsafe {
                let next = (*current).next;
                free_object(current);
                current = next;
            }
        }
    }
}

impl Allocator for Heap {
    fn intern_string(&mut self, bytes: &[u8]) -> ObjRef {
        let r = self.intern(bytes);
        self.pin(r);
        r
    }

    fn new_function(&mut self, name: Option<ObjRef>) -> ObjRef {
        let r = self.alloc_function(name);
        self.pin(r);
        r
    }
}

impl ember_core::NativeContext for Heap {
    fn alloc_array(&mut self, elements: Box<[Value]>) -> ObjRef {
        Heap::alloc_array(self, elements)
    }

    fn intern_string(&mut self, bytes: &[u8]) -> ObjRef {
        Heap::intern(self, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_deduplicates() {
        let mut heap = Heap::new(Config::default());
        let a = heap.intern(b"hello");
        let b = heap.intern(b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn sweep_frees_unreached_strings() {
        let mut heap = Heap::new(Config::default());
        let s = heap.intern(b"temporary");
        assert!(heap.bytes_allocated() > 0);
        // not marked, not pinned: a sweep with no roots collects it
        heap.sweep();
        let mut grey = Vec::new();
        Heap::mark_object(heap.init_string, &mut grey);
        Heap::mark_object(heap.length_string, &mut grey);
        while let Some(o) = grey.pop() {
            Heap::trace_one(o, &mut grey);
        }
        heap.sweep();
        let _ = s;
    }
}
