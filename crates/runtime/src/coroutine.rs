//! Coroutines and call frames (§3, §4.7).
//!
//! A `Coroutine` is *not* a GC heap object — §3 lists it as VM-owned and
//! reference-managed outside the mark-sweep graph, the same way
//! `ObjPromise::waiters` stores opaque `*mut ()` rather than `ObjRef`s.
//! The scheduler owns every live coroutine through two intrusive doubly
//! linked lists (active, sleeping) threaded through `prev`/`next`, mirroring
//! the descending-address open-upvalue list's intrusive-list idiom instead
//! of reaching for a second allocator.

use ember_core::{ObjRef, Value};
use std::time::Instant;

use crate::config::{MAX_CALL_DEPTH, MAX_STACK_SLOTS};

/// One active call: which closure, where execution resumes, and the base
/// stack slot its locals start at.
pub struct CallFrame {
    pub closure: ObjRef, // ObjClosure
    pub ip: usize,
    pub slot_base: usize,
}

pub struct Coroutine {
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    /// Head of the open-upvalue list for this coroutine's stack, sorted by
    /// descending `location` address (§4.6).
    pub open_upvalues: Option<ObjRef>,
    /// This coroutine's own completion promise; fulfilled when its root
    /// frame returns (§4.6 "Return").
    pub promise: ObjRef, // ObjPromise
    pub sleep_until: Option<Instant>,
    pub prev: *mut Coroutine,
    pub next: *mut Coroutine,
}

impl Coroutine {
    pub fn new(promise: ObjRef) -> Box<Coroutine> {
        Box::new(Coroutine {
            stack: Vec::with_capacity(64),
            frames: Vec::with_capacity(8),
            open_upvalues: None,
            promise,
            sleep_until: None,
            prev: std::ptr::null_mut(),
            next: std::ptr::null_mut(),
        })
    }

    pub fn push(&mut self, value: Value) -> Result<(), String> {
        if self.stack.len() >= MAX_STACK_SLOTS {
            return Err("stack overflow".to_string());
        }
        self.stack.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    pub fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    pub fn check_call_depth(&self) -> Result<(), String> {
        if self.frames.len() >= MAX_CALL_DEPTH {
            Err("call stack overflow".to_string())
        } else {
            Ok(())
        }
    }
}

/// An intrusive doubly linked list of coroutines, used for both the
/// scheduler's active and sleeping lists (§4.7).
#[derive(Default)]
pub struct CoroutineList {
    pub head: *mut Coroutine,
    pub tail: *mut Coroutine,
}

impl CoroutineList {
    pub fn new() -> CoroutineList {
        CoroutineList {
            head: std::ptr::null_mut(),
            tail: std::ptr::null_mut(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub fn push_back(&mut self, co: *mut Coroutine) {
        unsafe {
            (*co).prev = self.tail;
            (*co).next = std::ptr::null_mut();
            if self.tail.is_null() {
                self.head = co;
            } else {
                (*self.tail).next = co;
            }
            self.tail = co;
        }
    }

    /// Splices `co` onto the front of the list so it's the next one the
    /// scheduler picks up — used when a synchronous `Call` spawns a new
    /// coroutine for an `async fn` invocation.
    pub fn push_front(&mut self, co: *mut Coroutine) {
        unsafe {
            (*co).next = self.head;
            (*co).prev = std::ptr::null_mut();
            if self.head.is_null() {
                self.tail = co;
            } else {
                (*self.head).prev = co;
            }
            self.head = co;
        }
    }

    pub fn pop_front(&mut self) -> *mut Coroutine {
        let co = self.head;
        if !co.is_null() {
            self.unlink(co);
        }
        co
    }

    /// Removes `co` from wherever it currently sits in the list. Safe to
    /// call on a coroutine already unlinked (no-op only if the caller
    /// tracks membership separately; here every caller knows `co` is a
    /// member of `self` before calling).
    pub fn unlink(&mut self, co: *mut Coroutine) {
        unsafe {
            let prev = (*co).prev;
            let next = (*co).next;
            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if next.is_null() {
                self.tail = prev;
            } else {
                (*next).prev = prev;
            }
            (*co).prev = std::ptr::null_mut();
            (*co).next = std::ptr::null_mut();
        }
    }

    /// Splices `other` onto the back of `self`, leaving `other` empty.
    pub fn append(&mut self, other: &mut CoroutineList) {
        if other.is_empty() {
            return;
        }
        unsafe {
            (*other.head).prev = self.tail;
        }
        if self.tail.is_null() {
            self.head = other.head;
        } else {
            unsafe { (*self.tail).next = other.head };
        }
        self.tail = other.tail;
        other.head = std::ptr::null_mut();
        other.tail = std::ptr::null_mut();
    }
}
