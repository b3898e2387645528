//! Bytecode dispatch loop, calling convention, and the coroutine scheduler
//! (§4.6, §4.7).

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use ember_core::{ObjRef, ObjTag, OpCode, PromiseState, Table, Value};

use crate::config::Config;
use crate::coroutine::{CallFrame, Coroutine, CoroutineList};
use crate::error::{FatalError, InterpretError, RuntimeError, TraceFrame};
use crate::heap::Heap;
use crate::io::Poller;
use crate::natives;

/// A registered, in-flight native I/O request. Resolved entirely outside
/// the Promise/Await machinery (§9 open question: natives that suspend
/// use the active/sleeping coroutine lists directly, not a Promise — see
/// `DESIGN.md`).
enum PendingIo {
    Accept { server_fd: i32, waiter: *mut Coroutine },
    Read { fd: i32, max_len: usize, waiter: *mut Coroutine },
    Write { fd: i32, data: Vec<u8>, waiter: *mut Coroutine },
}

/// What a `Call`/`Invoke`/`SuperInvoke` did to the calling coroutine.
enum CallEffect {
    /// Completed (synchronously, or started a frame) — keep running `co`.
    Continue,
    /// Spawned a new coroutine for an `async fn` invocation; `co` got the
    /// pending promise pushed where the call was, but is bypassed until
    /// the callee's first suspension or return (§4.7) — see
    /// `dispatch_call_effect`.
    Spawned(*mut Coroutine),
    /// `co` itself parked (sleep, socket I/O) and is already registered
    /// wherever it belongs — stop executing it now.
    Suspended,
}

enum RunOutcome {
    /// Cooperative `yield;` — requeue at the back of the active list.
    Requeue,
    /// Suspended waiting on a pending promise, a native sleep, or I/O;
    /// already parked wherever it belongs.
    Parked,
    Finished(Value),
    Error(RuntimeError),
}

pub struct Vm {
    pub heap: Heap,
    globals: Table,
    next_class_id: u32,
    poller: Poller,
    active: CoroutineList,
    sleeping: CoroutineList,
    /// Coroutines parked on `await` of a still-pending promise. Not in
    /// `active`/`sleeping`/`pending_io`, so `collect` needs this list to
    /// find them as GC roots; `ObjPromise::waiters` only stores opaque
    /// `*mut ()`, not enough on its own to walk a coroutine's stack.
    awaiting: CoroutineList,
    pending_io: HashMap<RawFd, PendingIo>,
    root: *mut Coroutine,
    root_result: Option<Result<Value, InterpretError>>,
}

impl Vm {
    pub fn new(config: Config) -> Result<Vm, FatalError> {
        let mut vm = Vm {
            heap: Heap::new(config),
            globals: Table::new(),
            next_class_id: 1,
            poller: Poller::new()?,
            active: CoroutineList::new(),
            sleeping: CoroutineList::new(),
            awaiting: CoroutineList::new(),
            pending_io: HashMap::new(),
            root: std::ptr::null_mut(),
            root_result: None,
        };
        vm.install_natives();
        Ok(vm)
    }

    fn install_natives(&mut self) {
        for (name, arity, function) in natives::table() {
            let name_ref = self.heap.intern(name.as_bytes());
            let native_ref = self.heap.alloc_native(name_ref, arity, function);
            self.globals.set(name_ref, Value::Obj(native_ref));
        }
    }

    /// Runs a freshly compiled script to completion, including any
    /// fire-and-forget async work it spawned (the scheduler keeps going
    /// until every coroutine, timer, and I/O registration has drained).
    pub fn run(&mut self, script: ObjRef) -> Result<Value, InterpretError> {
        self.heap.clear_compile_pins();

        let closure = self.heap.alloc_closure(script, Box::new([]));
        let promise = self.heap.alloc_promise();
        let mut co = Coroutine::new(promise);
        co.stack.push(Value::Obj(closure));
        co.frames.push(CallFrame { closure, ip: 0, slot_base: 0 });
        let root_ptr = Box::into_raw(co);
        self.root = root_ptr;
        self.active.push_back(root_ptr);

        loop {
            self.wake_timers();
            if let Err(e) = self.drain_io(0) {
                return Err(InterpretError::Fatal(e));
            }

            if let Some(co_ptr) = self.pop_active() {
                match self.run_coroutine(co_ptr) {
                    RunOutcome::Requeue => self.active.push_back(co_ptr),
                    RunOutcome::Parked => {}
                    RunOutcome::Finished(value) => self.finish_coroutine(co_ptr, value),
                    // Any coroutine's unhandled runtime error aborts the
                    // whole run (§5: single-threaded, no isolation between
                    // coroutines).
                    RunOutcome::Error(e) => {
                        unsafe {
                            drop(Box::from_raw(co_ptr));
                        }
                        return Err(InterpretError::Runtime(e));
                    }
                }
                continue;
            }

            if self.active.is_empty() && self.sleeping.is_empty() && self.pending_io.is_empty() {
                // Nothing left to run and nothing left that could ever wake
                // a promise waiter: nobody has anything to fulfill any
                // surviving `await` with, so this is a deadlock rather than
                // a graceful finish.
                if !self.awaiting.is_empty() {
                    return Err(InterpretError::Fatal(FatalError(
                        "deadlock: coroutine awaiting a promise nothing can fulfill".to_string(),
                    )));
                }
                break;
            }

            let wait_ms = self.min_wait_ms();
            if let Err(e) = self.drain_io(wait_ms) {
                return Err(InterpretError::Fatal(e));
            }
        }

        self.root_result
            .take()
            .unwrap_or(Err(InterpretError::Fatal(FatalError(
                "root coroutine never completed".to_string(),
            ))))
    }

    fn pop_active(&mut self) -> Option<*mut Coroutine> {
        let co = self.active.pop_front();
        if co.is_null() {
            None
        } else {
            Some(co)
        }
    }

    fn wake_timers(&mut self) {
        let now = Instant::now();
        let mut co = self.sleeping.head;
        while !co.is_null() {
            let next = unsafe { (*co).next };
            let due = unsafe { (*co).sleep_until }.is_some_and(|t| t <= now);
            if due {
                self.sleeping.unlink(co);
                unsafe {
                    (*co).sleep_until = None;
                    let _ = (*co).push(Value::Nil);
                }
                self.active.push_back(co);
            }
            co = next;
        }
    }

    fn min_wait_ms(&self) -> i32 {
        let mut wait = if self.pending_io.is_empty() { -1 } else { 50 };
        let mut co = self.sleeping.head;
        while !co.is_null() {
            if let Some(deadline) = unsafe { (*co).sleep_until } {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let ms = remaining.as_millis().min(i32::MAX as u128) as i32;
                wait = if wait < 0 { ms } else { wait.min(ms) };
            }
            co = unsafe { (*co).next };
        }
        wait
    }

    fn drain_io(&mut self, timeout_ms: i32) -> Result<(), FatalError> {
        let ready = self.poller.poll(timeout_ms)?;
        for (fd, _events) in ready {
            let Some(pending) = self.pending_io.remove(&fd) else { continue };
            self.complete_io(pending);
        }
        Ok(())
    }

    fn complete_io(&mut self, pending: PendingIo) {
        match pending {
            PendingIo::Accept { server_fd, waiter } => {
                let fd = unsafe { libc::accept(server_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
                let value = if fd >= 0 { Value::Number(fd as f64) } else { Value::Number(-1.0) };
                self.resume_waiter(waiter, value);
            }
            PendingIo::Read { fd, max_len, waiter } => {
                let mut buf = vec![0u8; max_len];
                let n = unsafe {
                    libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                let value = if n > 0 {
                    buf.truncate(n as usize);
                    Value::Obj(self.heap.intern(&buf))
                } else {
                    Value::Nil
                };
                self.resume_waiter(waiter, value);
            }
            PendingIo::Write { fd, data, waiter } => {
                let n = unsafe {
                    libc::write(fd, data.as_ptr() as *const libc::c_void, data.len())
                };
                let value = Value::Number(n.max(0) as f64);
                self.resume_waiter(waiter, value);
            }
        }
    }

    fn resume_waiter(&mut self, waiter: *mut Coroutine, value: Value) {
        unsafe {
            let _ = (*waiter).push(value);
        }
        self.active.push_back(waiter);
    }

    fn finish_coroutine(&mut self, co: *mut Coroutine, value: Value) {
        let is_root = co == self.root;
        let promise = unsafe { (*co).promise };
        self.fulfill_promise(promise, value);
        if is_root {
            self.root_result = Some(Ok(value));
        }
        unsafe {
            drop(Box::from_raw(co));
        }
    }

    fn fulfill_promise(&mut self, promise: ObjRef, value: Value) {
        let p = unsafe { promise.as_promise() };
        if p.state == PromiseState::Fulfilled {
            return;
        }
        p.state = PromiseState::Fulfilled;
        p.value = value;
        let waiters = std::mem::take(&mut p.waiters);
        let chained = p.chained;
        for waiter in waiters {
            let co = waiter as *mut Coroutine;
            self.awaiting.unlink(co);
            unsafe {
                let _ = (*co).push(value);
            }
            self.active.push_back(co);
        }
        if let Some(chained) = chained {
            self.fulfill_promise(chained, value);
        }
    }

    // ---- GC -------------------------------------------------------------

    fn maybe_collect(&mut self, running: *mut Coroutine) {
        if !self.heap.should_collect() {
            return;
        }
        self.collect(running);
    }

    fn collect(&mut self, running: *mut Coroutine) {
        let mut grey = Vec::new();
        self.heap.compact_pins();
        for &obj in self.heap.pins() {
            Heap::mark_object(obj, &mut grey);
        }
        for (k, v) in self.globals.iter() {
            Heap::mark_object(k, &mut grey);
            Heap::mark_value(v, &mut grey);
        }
        Heap::mark_object(self.heap.init_string, &mut grey);
        Heap::mark_object(self.heap.length_string, &mut grey);
        self.mark_coroutine_list(self.active.head, &mut grey);
        self.mark_coroutine_list(self.sleeping.head, &mut grey);
        self.mark_coroutine_list(self.awaiting.head, &mut grey);
        for pending in self.pending_io.values() {
            let waiter = match pending {
                PendingIo::Accept { waiter, .. } => *waiter,
                PendingIo::Read { waiter, .. } => *waiter,
                PendingIo::Write { waiter, .. } => *waiter,
            };
            self.mark_one_coroutine(waiter, &mut grey);
        }
        if !self.root.is_null() {
            self.mark_one_coroutine(self.root, &mut grey);
        }
        // The coroutine currently executing is off the active list (popped
        // before `run_coroutine` started) and may not be the root either.
        if !running.is_null() {
            self.mark_one_coroutine(running, &mut grey);
        }
        while let Some(obj) = grey.pop() {
            Heap::trace_one(obj, &mut grey);
        }
        self.heap.sweep();
    }

    fn mark_coroutine_list(&self, mut co: *mut Coroutine, grey: &mut Vec<ObjRef>) {
        while !co.is_null() {
            self.mark_one_coroutine(co, grey);
            co = unsafe { (*co).next };
        }
    }

    fn mark_one_coroutine(&self, co: *mut Coroutine, grey: &mut Vec<ObjRef>) {
        unsafe {
            Heap::mark_object((*co).promise, grey);
            for v in (*co).stack.iter() {
                Heap::mark_value(*v, grey);
            }
            for frame in (*co).frames.iter() {
                Heap::mark_object(frame.closure, grey);
            }
            let mut uv = (*co).open_upvalues;
            while let Some(uv_ref) = uv {
                Heap::mark_object(uv_ref, grey);
                uv = uv_ref.as_upvalue().next_open;
            }
        }
    }

    // ---- upvalues ---------------------------------------------------------

    fn capture_upvalue(&mut self, co: *mut Coroutine, slot_index: usize) -> ObjRef {
        let location = unsafe { &mut (&mut (*co).stack)[slot_index] as *mut Value };
        unsafe {
            let mut cursor = (*co).open_upvalues;
            while let Some(uv_ref) = cursor {
                let uv = uv_ref.as_upvalue();
                if uv.location == location {
                    return uv_ref;
                }
                if (uv.location as usize) < (location as usize) {
                    break;
                }
                cursor = uv.next_open;
            }
        }
        let created = self.heap.alloc_upvalue(location);
        unsafe {
            let mut prev: Option<ObjRef> = None;
            let mut cursor = (*co).open_upvalues;
            while let Some(uv_ref) = cursor {
                let uv = uv_ref.as_upvalue();
                if (uv.location as usize) < (location as usize) {
                    break;
                }
                prev = Some(uv_ref);
                cursor = uv.next_open;
            }
            created.as_upvalue().next_open = cursor;
            match prev {
                Some(p) => p.as_upvalue().next_open = Some(created),
                None => (*co).open_upvalues = Some(created),
            }
        }
        created
    }

    fn close_upvalues_from(&mut self, co: *mut Coroutine, from: *mut Value) {
        unsafe {
            while let Some(uv_ref) = (*co).open_upvalues {
                let uv = uv_ref.as_upvalue();
                if (uv.location as usize) < (from as usize) {
                    break;
                }
                uv.close();
                (*co).open_upvalues = uv.next_open;
            }
        }
    }

    // ---- dispatch ---------------------------------------------------------

    fn read_u8(co: *mut Coroutine) -> u8 {
        unsafe {
            let frame = (*co).frames.last_mut().unwrap();
            let function = frame.closure.as_closure().function.as_function();
            let byte = function.chunk.code[frame.ip];
            frame.ip += 1;
            byte
        }
    }

    fn read_u16(co: *mut Coroutine) -> u16 {
        let lo = Self::read_u8(co);
        let hi = Self::read_u8(co);
        u16::from_le_bytes([lo, hi])
    }

    fn read_const(co: *mut Coroutine, idx: u8) -> Value {
        unsafe {
            let frame = (*co).frames.last().unwrap();
            let function = frame.closure.as_closure().function.as_function();
            function.chunk.constants[idx as usize]
        }
    }

    fn build_trace(&self, co: *mut Coroutine) -> Vec<TraceFrame> {
        unsafe {
            (*co)
                .frames
                .iter()
                .rev()
                .map(|f| {
                    let function = f.closure.as_closure().function.as_function();
                    let loc = function.chunk.loc_at(f.ip.saturating_sub(1));
                    let name = function
                        .name
                        .map(|n| n.as_string().as_str().to_string())
                        .unwrap_or_else(|| "<script>".to_string());
                    TraceFrame { function_name: name, line: loc.line, column: loc.column }
                })
                .collect()
        }
    }

    fn runtime_error(&self, co: *mut Coroutine, message: impl Into<String>) -> RuntimeError {
        RuntimeError::new(message).with_trace(self.build_trace(co))
    }

    /// Applies a `CallEffect` to `co`'s run loop. A newly spawned async
    /// callee runs immediately, right here, to its first suspension or
    /// return (§4.7) — `co` is bypassed until then, so side effects before
    /// that point are observed in program order before `co` continues.
    fn dispatch_call_effect(
        &mut self,
        co: *mut Coroutine,
        effect: CallEffect,
    ) -> Result<Option<RunOutcome>, String> {
        match effect {
            CallEffect::Continue => Ok(None),
            CallEffect::Suspended => Ok(Some(RunOutcome::Parked)),
            CallEffect::Spawned(spawned) => {
                // `co` is paused mid-instruction, off every scheduler
                // list, while `spawned` runs below — root it on `active`
                // for the duration so a collection triggered by the
                // callee doesn't sweep co's stack out from under it.
                self.active.push_front(co);
                match self.run_coroutine(spawned) {
                    // The callee yielded or parked before completing:
                    // `co` resumes next, ahead of whatever else is
                    // queued, and stays right where it was just put.
                    RunOutcome::Requeue => {
                        self.active.push_back(spawned);
                        Ok(Some(RunOutcome::Parked))
                    }
                    RunOutcome::Parked => Ok(Some(RunOutcome::Parked)),
                    // The callee returned synchronously without ever
                    // suspending: nothing to resume later, so `co` just
                    // keeps going in this same run loop.
                    RunOutcome::Finished(value) => {
                        self.finish_coroutine(spawned, value);
                        self.active.unlink(co);
                        Ok(None)
                    }
                    RunOutcome::Error(e) => {
                        unsafe { drop(Box::from_raw(spawned)) };
                        self.active.unlink(co);
                        Ok(Some(RunOutcome::Error(e)))
                    }
                }
            }
        }
    }

    /// Executes instructions on `co` until it finishes, errors, yields
    /// cooperatively, or suspends on a pending promise/timer/I/O.
    fn run_coroutine(&mut self, co: *mut Coroutine) -> RunOutcome {
        loop {
            self.maybe_collect(co);
            let op = OpCode::from_byte(Self::read_u8(co));
            match self.step(co, op) {
                Ok(Some(outcome)) => return outcome,
                Ok(None) => {}
                Err(msg) => return RunOutcome::Error(self.runtime_error(co, msg)),
            }
        }
    }

    /// Runs one instruction. Returns `Ok(Some(outcome))` when the
    /// coroutine's run loop should stop (finished/parked/yielded),
    /// `Ok(None)` to keep going, or `Err` on a runtime error.
    fn step(&mut self, co: *mut Coroutine, op: OpCode) -> Result<Option<RunOutcome>, String> {
        macro_rules! stack {
            () => {
                unsafe { &mut (*co).stack }
            };
        }
        macro_rules! push {
            ($v:expr) => {
                stack!().push($v)
            };
        }
        macro_rules! pop {
            () => {
                stack!().pop().ok_or_else(|| "stack underflow".to_string())?
            };
        }
        macro_rules! peek {
            ($d:expr) => {{
                let s = stack!();
                s[s.len() - 1 - $d]
            }};
        }
        macro_rules! binary_number {
            ($op:tt) => {{
                let b = pop!();
                let a = pop!();
                match (a.as_number(), b.as_number()) {
                    (Some(a), Some(b)) => push!(Value::Number(a $op b)),
                    _ => return Err("operands must be numbers".to_string()),
                }
            }};
        }

        match op {
            OpCode::Nil => push!(Value::Nil),
            OpCode::True => push!(Value::Bool(true)),
            OpCode::False => push!(Value::Bool(false)),
            OpCode::Const => {
                let idx = Self::read_u8(co);
                push!(Self::read_const(co, idx));
            }
            OpCode::Dup => {
                let v = peek!(0);
                push!(v);
            }
            OpCode::Pop => {
                pop!();
            }
            OpCode::PopN => {
                let n = Self::read_u8(co) as usize;
                let s = stack!();
                let new_len = s.len().saturating_sub(n);
                s.truncate(new_len);
            }
            OpCode::Add => {
                let b = pop!();
                let a = pop!();
                match (a, b) {
                    (Value::Number(x), Value::Number(y)) => push!(Value::Number(x + y)),
                    (Value::Obj(x), Value::Obj(y))
                        if x.tag() == ObjTag::String && y.tag() == ObjTag::String =>
                    {
                        let mut bytes = unsafe { x.as_string().as_bytes().to_vec() };
                        bytes.extend_from_slice(unsafe { y.as_string().as_bytes() });
                        let s = self.heap.intern(&bytes);
                        push!(Value::Obj(s));
                    }
                    _ => return Err("operands must be two numbers or two strings".to_string()),
                }
            }
            OpCode::Sub => binary_number!(-),
            OpCode::Mul => binary_number!(*),
            OpCode::Div => binary_number!(/),
            OpCode::Neg => {
                let v = pop!();
                match v.as_number() {
                    Some(n) => push!(Value::Number(-n)),
                    None => return Err("operand must be a number".to_string()),
                }
            }
            OpCode::Not => {
                let v = pop!();
                push!(Value::Bool(!v.is_truthy()));
            }
            OpCode::Equal => {
                let b = pop!();
                let a = pop!();
                push!(Value::Bool(a == b));
            }
            OpCode::Greater => {
                let b = pop!();
                let a = pop!();
                match (a.as_number(), b.as_number()) {
                    (Some(a), Some(b)) => push!(Value::Bool(a > b)),
                    _ => return Err("operands must be numbers".to_string()),
                }
            }
            OpCode::Less => {
                let b = pop!();
                let a = pop!();
                match (a.as_number(), b.as_number()) {
                    (Some(a), Some(b)) => push!(Value::Bool(a < b)),
                    _ => return Err("operands must be numbers".to_string()),
                }
            }
            OpCode::Incr => {
                let v = pop!();
                match v.as_number() {
                    Some(n) => push!(Value::Number(n + 1.0)),
                    None => return Err("operand must be a number".to_string()),
                }
            }
            OpCode::Decr => {
                let v = pop!();
                match v.as_number() {
                    Some(n) => push!(Value::Number(n - 1.0)),
                    None => return Err("operand must be a number".to_string()),
                }
            }
            OpCode::DefineGlobal => {
                let idx = Self::read_u8(co);
                let name = Self::read_const(co, idx).as_obj().expect("global name constant");
                let value = pop!();
                self.globals.set(name, value);
            }
            OpCode::GetGlobal => {
                let idx = Self::read_u8(co);
                let name = Self::read_const(co, idx).as_obj().expect("global name constant");
                match self.globals.get(name) {
                    Some(v) => push!(v),
                    None => {
                        return Err(format!(
                            "undefined variable '{}'",
                            unsafe { name.as_string().as_str() }
                        ))
                    }
                }
            }
            OpCode::SetGlobal => {
                let idx = Self::read_u8(co);
                let name = Self::read_const(co, idx).as_obj().expect("global name constant");
                if !self.globals.contains(name) {
                    return Err(format!(
                        "undefined variable '{}'",
                        unsafe { name.as_string().as_str() }
                    ));
                }
                let value = peek!(0);
                self.globals.set(name, value);
            }
            OpCode::GetLocal => {
                let idx = Self::read_u8(co) as usize;
                let base = unsafe { (*co).frames.last().unwrap().slot_base };
                push!(stack!()[base + idx]);
            }
            OpCode::SetLocal => {
                let idx = Self::read_u8(co) as usize;
                let base = unsafe { (*co).frames.last().unwrap().slot_base };
                let v = peek!(0);
                stack!()[base + idx] = v;
            }
            OpCode::GetUpvalue => {
                let idx = Self::read_u8(co) as usize;
                let closure = unsafe { (*co).frames.last().unwrap().closure };
                let uv = unsafe { closure.as_closure().upvalues[idx] };
                push!(unsafe { uv.as_upvalue().get() });
            }
            OpCode::SetUpvalue => {
                let idx = Self::read_u8(co) as usize;
                let closure = unsafe { (*co).frames.last().unwrap().closure };
                let uv = unsafe { closure.as_closure().upvalues[idx] };
                let v = peek!(0);
                unsafe { uv.as_upvalue().set(v) };
            }
            OpCode::Jump => {
                let offset = Self::read_u16(co);
                unsafe { (*co).frames.last_mut().unwrap().ip += offset as usize };
            }
            OpCode::JumpIfFalse => {
                let offset = Self::read_u16(co);
                if !peek!(0).is_truthy() {
                    unsafe { (*co).frames.last_mut().unwrap().ip += offset as usize };
                }
            }
            OpCode::JumpIfTrue => {
                let offset = Self::read_u16(co);
                if peek!(0).is_truthy() {
                    unsafe { (*co).frames.last_mut().unwrap().ip += offset as usize };
                }
            }
            OpCode::Loop => {
                let offset = Self::read_u16(co);
                unsafe { (*co).frames.last_mut().unwrap().ip -= offset as usize };
            }
            OpCode::Call => {
                let arg_count = Self::read_u8(co);
                let effect = self.call_value(co, arg_count)?;
                if let Some(outcome) = self.dispatch_call_effect(co, effect)? {
                    return Ok(Some(outcome));
                }
            }
            OpCode::Closure => {
                let idx = Self::read_u8(co);
                let function = Self::read_const(co, idx).as_obj().expect("function constant");
                let upvalue_count = unsafe { function.as_function().upvalue_count } as usize;
                let mut upvalues = Vec::with_capacity(upvalue_count);
                let base = unsafe { (*co).frames.last().unwrap().slot_base };
                for _ in 0..upvalue_count {
                    let is_local = Self::read_u8(co) == 1;
                    let index = Self::read_u8(co) as usize;
                    if is_local {
                        upvalues.push(self.capture_upvalue(co, base + index));
                    } else {
                        let enclosing = unsafe { (*co).frames.last().unwrap().closure };
                        upvalues.push(unsafe { enclosing.as_closure().upvalues[index] });
                    }
                }
                let closure = self.heap.alloc_closure(function, upvalues.into_boxed_slice());
                push!(Value::Obj(closure));
            }
            OpCode::CloseUpvalue => {
                let addr = {
                    let s = stack!();
                    &s[s.len() - 1] as *const Value as *mut Value
                };
                self.close_upvalues_from(co, addr);
                pop!();
            }
            OpCode::Return => {
                let result = pop!();
                let base = unsafe { (*co).frames.last().unwrap().slot_base };
                let base_addr = unsafe { &mut (&mut (*co).stack)[base] as *mut Value };
                self.close_upvalues_from(co, base_addr);
                unsafe { (*co).frames.pop() };
                stack!().truncate(base);
                if unsafe { (*co).frames.is_empty() } {
                    return Ok(Some(RunOutcome::Finished(result)));
                }
                push!(result);
            }
            OpCode::Class => {
                let idx = Self::read_u8(co);
                let name = Self::read_const(co, idx).as_obj().expect("class name constant");
                let id = self.next_class_id;
                self.next_class_id = self.next_class_id.wrapping_add(1);
                let class = self.heap.alloc_class(name, id);
                push!(Value::Obj(class));
            }
            OpCode::Method => {
                let idx = Self::read_u8(co);
                let name = Self::read_const(co, idx).as_obj().expect("method name constant");
                let closure = pop!().as_obj().expect("method closure");
                let class = peek!(0).as_obj().expect("class value");
                unsafe { class.as_class().methods.set(name, Value::Obj(closure)) };
            }
            OpCode::Inherit => {
                let subclass = pop!().as_obj().expect("subclass value");
                let superclass = peek!(0);
                let Value::Obj(superclass) = superclass else {
                    return Err("superclass must be a class".to_string());
                };
                if superclass.tag() != ObjTag::Class {
                    return Err("superclass must be a class".to_string());
                }
                let entries: Vec<_> =
                    unsafe { superclass.as_class().methods.iter().collect() };
                let sub = unsafe { subclass.as_class() };
                for (k, v) in entries {
                    sub.methods.set(k, v);
                }
            }
            OpCode::GetField => {
                let idx = Self::read_u8(co);
                let name = Self::read_const(co, idx).as_obj().expect("field name constant");
                let receiver = pop!();
                push!(self.get_field(receiver, name)?);
            }
            OpCode::SetField => {
                let idx = Self::read_u8(co);
                let name = Self::read_const(co, idx).as_obj().expect("field name constant");
                let value = pop!();
                let receiver = pop!();
                let inst = expect_instance(receiver)?;
                unsafe { inst.as_instance().fields.set(name, value) };
                push!(value);
            }
            OpCode::FieldIncr | OpCode::FieldDecr => {
                let idx = Self::read_u8(co);
                let name = Self::read_const(co, idx).as_obj().expect("field name constant");
                let receiver = pop!();
                let inst = expect_instance(receiver)?;
                let instance = unsafe { inst.as_instance() };
                let old = instance
                    .fields
                    .get(name)
                    .ok_or_else(|| format!("undefined field '{}'", unsafe { name.as_string().as_str() }))?;
                let n = old
                    .as_number()
                    .ok_or_else(|| "field must be a number to increment/decrement".to_string())?;
                let delta = if op == OpCode::FieldIncr { 1.0 } else { -1.0 };
                instance.fields.set(name, Value::Number(n + delta));
                push!(old);
            }
            OpCode::Invoke => {
                let idx = Self::read_u8(co);
                let name = Self::read_const(co, idx).as_obj().expect("method name constant");
                let arg_count = Self::read_u8(co);
                let cache_offset = unsafe { (*co).frames.last().unwrap().ip };
                // skip the 2-byte class-id + pointer-sized cache
                unsafe { (*co).frames.last_mut().unwrap().ip += 2 + std::mem::size_of::<usize>() };
                let effect = self.invoke(co, name, arg_count, Some(cache_offset))?;
                if let Some(outcome) = self.dispatch_call_effect(co, effect)? {
                    return Ok(Some(outcome));
                }
            }
            OpCode::GetSuper => {
                let idx = Self::read_u8(co);
                let name = Self::read_const(co, idx).as_obj().expect("method name constant");
                let superclass = pop!().as_obj().expect("superclass value");
                let this = pop!();
                let method = unsafe { superclass.as_class().methods.get(name) }.ok_or_else(|| {
                    format!("undefined property '{}'", unsafe { name.as_string().as_str() })
                })?;
                let method_ref = method.as_obj().expect("method closure");
                let bound = self.heap.alloc_bound_method(this, method_ref);
                push!(Value::Obj(bound));
            }
            OpCode::SuperInvoke => {
                let idx = Self::read_u8(co);
                let name = Self::read_const(co, idx).as_obj().expect("method name constant");
                let arg_count = Self::read_u8(co);
                let cache_offset = unsafe { (*co).frames.last().unwrap().ip };
                unsafe { (*co).frames.last_mut().unwrap().ip += std::mem::size_of::<usize>() };
                let superclass = pop!().as_obj().expect("superclass value");
                let method_ref = self.resolve_super_method(co, superclass, name, cache_offset)?;
                let effect = self.begin_call(co, method_ref, arg_count)?;
                if let Some(outcome) = self.dispatch_call_effect(co, effect)? {
                    return Ok(Some(outcome));
                }
            }
            OpCode::Print => {
                let v = pop!();
                println!("{}", self.stringify(v));
            }
            OpCode::Concat => {
                let n = Self::read_u8(co) as usize;
                let s = stack!();
                let start = s.len() - n;
                let parts: Vec<Value> = s[start..].to_vec();
                s.truncate(start);
                let mut buf = String::new();
                for v in parts {
                    buf.push_str(&self.stringify(v));
                }
                let interned = self.heap.intern(buf.as_bytes());
                push!(Value::Obj(interned));
            }
            OpCode::Yield => {
                return Ok(Some(RunOutcome::Requeue));
            }
            OpCode::Await => {
                let v = pop!();
                let Value::Obj(promise) = v else {
                    return Err("can only await a promise".to_string());
                };
                if promise.tag() != ObjTag::Promise {
                    return Err("can only await a promise".to_string());
                }
                let p = unsafe { promise.as_promise() };
                if p.state == PromiseState::Fulfilled {
                    push!(p.value);
                } else {
                    p.waiters.push(co as *mut ());
                    self.awaiting.push_back(co);
                    return Ok(Some(RunOutcome::Parked));
                }
            }
            OpCode::Array => {
                let n = Self::read_u8(co) as usize;
                let s = stack!();
                let start = s.len() - n;
                let elements: Vec<Value> = s[start..].to_vec();
                s.truncate(start);
                let arr = self.heap.alloc_array(elements.into_boxed_slice());
                push!(Value::Obj(arr));
            }
            OpCode::ArrayGet => {
                let index = pop!();
                let array = pop!();
                push!(self.array_get(array, index)?);
            }
            OpCode::ArraySet => {
                let value = pop!();
                let index = pop!();
                let array = pop!();
                self.array_set(array, index, value)?;
                push!(value);
            }
            OpCode::ArrayIncr | OpCode::ArrayDecr => {
                let index = pop!();
                let array = pop!();
                let old = self.array_get(array, index)?;
                let n = old.as_number().ok_or_else(|| "array element must be a number".to_string())?;
                let delta = if op == OpCode::ArrayIncr { 1.0 } else { -1.0 };
                self.array_set(array, index, Value::Number(n + delta))?;
                push!(old);
            }
        }
        Ok(None)
    }

    /// `SuperInvoke`'s cache has no class-id slot: the superclass is a
    /// compile-time constant, so the call site is never polymorphic and a
    /// single cached pointer is valid for the lifetime of the chunk.
    fn resolve_super_method(
        &mut self,
        co: *mut Coroutine,
        superclass: ObjRef,
        name: ObjRef,
        cache_offset: usize,
    ) -> Result<ObjRef, String> {
        if let Some(cached) = self.read_super_cache(co, cache_offset) {
            return Ok(cached);
        }
        let method_ref = self.lookup_method(superclass, name)?;
        self.write_super_cache(co, cache_offset, method_ref);
        Ok(method_ref)
    }

    fn read_super_cache(&self, co: *mut Coroutine, offset: usize) -> Option<ObjRef> {
        unsafe {
            let closure = (*co).frames.last().unwrap().closure;
            let function = closure.as_closure().function.as_function();
            let code = &function.chunk.code;
            let mut buf = [0u8; std::mem::size_of::<usize>()];
            let len = buf.len();
            buf.copy_from_slice(&code[offset..offset + len]);
            let raw = usize::from_ne_bytes(buf);
            if raw == 0 {
                None
            } else {
                Some(ObjRef::from_raw(raw as *mut ember_core::Obj))
            }
        }
    }

    fn write_super_cache(&mut self, co: *mut Coroutine, offset: usize, method: ObjRef) {
        unsafe {
            let closure = (*co).frames.last().unwrap().closure;
            let function = closure.as_closure().function.as_function_mut();
            let bytes = (method.as_ptr() as usize).to_ne_bytes();
            function.chunk.code[offset..offset + bytes.len()].copy_from_slice(&bytes);
        }
    }

    /// Looks up `name` on `receiver`: `.length` on a string or array first
    /// (§4.7), then own field, then the class's method table (bound into a
    /// `BoundMethod` on the way out).
    fn get_field(&mut self, receiver: Value, name: ObjRef) -> Result<Value, String> {
        if name == self.heap.length_string {
            if let Value::Obj(o) = receiver {
                match o.tag() {
                    ObjTag::String => return Ok(Value::Number(unsafe { o.as_string() }.len() as f64)),
                    ObjTag::Array => {
                        return Ok(Value::Number(unsafe { o.as_array() }.elements.len() as f64))
                    }
                    _ => {}
                }
            }
        }
        let inst = expect_instance(receiver)?;
        let instance = unsafe { inst.as_instance() };
        if let Some(v) = instance.fields.get(name) {
            return Ok(v);
        }
        let method = unsafe { instance.class.as_class().methods.get(name) }.ok_or_else(|| {
            format!("undefined property '{}'", unsafe { name.as_string().as_str() })
        })?;
        let method_ref = method.as_obj().expect("method closure");
        let bound = self.heap.alloc_bound_method(receiver, method_ref);
        Ok(Value::Obj(bound))
    }

    fn array_get(&self, array: Value, index: Value) -> Result<Value, String> {
        let arr = expect_array(array)?;
        let i = expect_index(index)?;
        let elements = &unsafe { arr.as_array() }.elements;
        elements.get(i).copied().ok_or_else(|| "array index out of bounds".to_string())
    }

    fn array_set(&self, array: Value, index: Value, value: Value) -> Result<(), String> {
        let arr = expect_array(array)?;
        let i = expect_index(index)?;
        let elements = &mut unsafe { arr.as_array() }.elements;
        if i >= elements.len() {
            return Err("array index out of bounds".to_string());
        }
        elements[i] = value;
        Ok(())
    }

    /// Number formatting for `print`/template interpolation: fixed to ten
    /// decimal places, then trailing zeros (and a bare trailing `.`)
    /// trimmed off (§4.6).
    fn stringify(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(n),
            Value::Obj(o) => match o.tag() {
                ObjTag::String => unsafe { o.as_string().as_str().to_string() },
                ObjTag::Function => format!(
                    "<fn {}>",
                    unsafe { o.as_function() }.name.map(|n| unsafe { n.as_string().as_str() }.to_string()).unwrap_or_else(|| "script".to_string())
                ),
                ObjTag::Upvalue => "<upvalue>".to_string(),
                ObjTag::Closure => self.stringify(Value::Obj(unsafe { o.as_closure() }.function)),
                ObjTag::Native => format!("<native fn {}>", unsafe { o.as_native().name.as_string().as_str() }),
                ObjTag::Class => format!("{}", unsafe { o.as_class().name.as_string().as_str() }),
                ObjTag::Instance => {
                    format!("{} instance", unsafe { o.as_instance().class.as_class().name.as_string().as_str() })
                }
                ObjTag::BoundMethod => self.stringify(Value::Obj(unsafe { o.as_bound_method() }.method)),
                ObjTag::Promise => "<promise>".to_string(),
                ObjTag::Array => {
                    let elements = &unsafe { o.as_array() }.elements;
                    const MAX_SHOWN: usize = 100;
                    let shown = elements.iter().take(MAX_SHOWN).map(|v| self.stringify(*v));
                    let mut parts: Vec<String> = shown.collect();
                    if elements.len() > MAX_SHOWN {
                        parts.push(format!("...({} more)", elements.len() - MAX_SHOWN));
                    }
                    format!("[{}]", parts.join(", "))
                }
            },
        }
    }

    /// Dispatches a `Call`. See [`CallEffect`] for what the caller does
    /// with the result.
    fn call_value(&mut self, co: *mut Coroutine, arg_count: u8) -> Result<CallEffect, String> {
        let callee = {
            let s = unsafe { &(*co).stack };
            s[s.len() - 1 - arg_count as usize]
        };
        match callee {
            Value::Obj(o) if o.tag() == ObjTag::Closure => self.begin_call(co, o, arg_count),
            _ => self.call_non_closure(co, callee, arg_count),
        }
    }

    /// Shared tail of `Call`/`Invoke`/`SuperInvoke`: pushes a new frame for
    /// a synchronous closure call, or spawns a coroutine for an async one.
    fn begin_call(
        &mut self,
        co: *mut Coroutine,
        closure: ObjRef,
        arg_count: u8,
    ) -> Result<CallEffect, String> {
        let function = unsafe { closure.as_closure().function.as_function() };
        if function.arity != arg_count {
            return Err(format!(
                "expected {} arguments but got {}",
                function.arity, arg_count
            ));
        }
        let slot_base = unsafe { (*co).stack.len() } - arg_count as usize - 1;
        if function.is_async {
            let promise = self.heap.alloc_promise();
            let mut new_co = Coroutine::new(promise);
            let window: Vec<Value> = {
                let s = unsafe { &mut (*co).stack };
                s.drain(slot_base..).collect()
            };
            new_co.stack.extend(window);
            new_co.frames.push(CallFrame { closure, ip: 0, slot_base: 0 });
            let new_ptr = Box::into_raw(new_co);
            unsafe { (*co).stack.push(Value::Obj(promise)) };
            Ok(CallEffect::Spawned(new_ptr))
        } else {
            unsafe { (*co).check_call_depth() }?;
            unsafe { (*co).frames.push(CallFrame { closure, ip: 0, slot_base }) };
            Ok(CallEffect::Continue)
        }
    }

    /// Handles `Call` when the callee isn't a bare `Closure`: classes,
    /// bound methods, and natives.
    fn call_non_closure(
        &mut self,
        co: *mut Coroutine,
        callee: Value,
        arg_count: u8,
    ) -> Result<CallEffect, String> {
        let slot_base = unsafe { (*co).stack.len() } - arg_count as usize - 1;
        match callee {
            Value::Obj(o) if o.tag() == ObjTag::Class => {
                let instance = self.heap.alloc_instance(o);
                unsafe { (&mut (*co).stack)[slot_base] = Value::Obj(instance) };
                let init_name = self.heap.init_string;
                let init = unsafe { o.as_class().methods.get(init_name) };
                match init {
                    Some(Value::Obj(init_closure)) => self.begin_call(co, init_closure, arg_count),
                    _ => {
                        if arg_count != 0 {
                            return Err(format!("expected 0 arguments but got {arg_count}"));
                        }
                        Ok(CallEffect::Continue)
                    }
                }
            }
            Value::Obj(o) if o.tag() == ObjTag::BoundMethod => {
                let bm = unsafe { o.as_bound_method() };
                unsafe { (&mut (*co).stack)[slot_base] = bm.receiver };
                self.begin_call(co, bm.method, arg_count)
            }
            Value::Obj(o) if o.tag() == ObjTag::Native => {
                let native = unsafe { o.as_native() };
                if native.arity >= 0 && native.arity as u8 != arg_count {
                    return Err(format!(
                        "expected {} arguments but got {}",
                        native.arity, arg_count
                    ));
                }
                let name = unsafe { native.name.as_string().as_str() };
                if self.call_suspending_native(co, name, slot_base)? {
                    return Ok(CallEffect::Suspended);
                }
                let args: Vec<Value> = {
                    let s = unsafe { &(*co).stack };
                    s[slot_base + 1..].to_vec()
                };
                let result = (native.function)(&mut self.heap, &args);
                unsafe { (*co).stack.truncate(slot_base) };
                match result {
                    Ok(v) => {
                        unsafe { (*co).stack.push(v) };
                        Ok(CallEffect::Continue)
                    }
                    Err(msg) => Err(msg),
                }
            }
            _ => Err("can only call functions and classes".to_string()),
        }
    }

    /// Natives that park the calling coroutine instead of returning
    /// synchronously: `sleep`, `serverAccept`, `socketRead`, `socketWrite`.
    /// Returns `true` when `co` was parked (the caller must stop executing
    /// it immediately), `false` for any other native so the normal
    /// synchronous path handles it.
    fn call_suspending_native(
        &mut self,
        co: *mut Coroutine,
        name: &str,
        slot_base: usize,
    ) -> Result<bool, String> {
        let args: Vec<Value> = {
            let s = unsafe { &(*co).stack };
            s[slot_base + 1..].to_vec()
        };
        match name {
            natives::NATIVE_SLEEP => {
                let ms = args[0].as_number().ok_or("sleep expects a number of milliseconds")?;
                unsafe { (*co).stack.truncate(slot_base) };
                unsafe { (*co).sleep_until = Some(Instant::now() + Duration::from_millis(ms.max(0.0) as u64)) };
                self.sleeping.push_back(co);
                Ok(true)
            }
            natives::NATIVE_SERVER_ACCEPT => {
                let fd = args[0].as_number().ok_or("serverAccept expects a server fd")? as i32;
                unsafe { (*co).stack.truncate(slot_base) };
                self.poller.add(fd, libc::EPOLLIN as u32).map_err(|e| e.to_string())?;
                self.pending_io.insert(fd, PendingIo::Accept { server_fd: fd, waiter: co });
                Ok(true)
            }
            natives::NATIVE_SOCKET_READ => {
                let fd = args[0].as_number().ok_or("socketRead expects a socket fd")? as i32;
                let max_len = args.get(1).and_then(Value::as_number).unwrap_or(4096.0) as usize;
                unsafe { (*co).stack.truncate(slot_base) };
                self.poller.add(fd, libc::EPOLLIN as u32).map_err(|e| e.to_string())?;
                self.pending_io.insert(fd, PendingIo::Read { fd, max_len, waiter: co });
                Ok(true)
            }
            natives::NATIVE_SOCKET_WRITE => {
                let fd = args[0].as_number().ok_or("socketWrite expects a socket fd")? as i32;
                let Value::Obj(data_ref) = args[1] else {
                    return Err("socketWrite expects a string payload".to_string());
                };
                if data_ref.tag() != ObjTag::String {
                    return Err("socketWrite expects a string payload".to_string());
                }
                let data = unsafe { data_ref.as_string().as_bytes().to_vec() };
                unsafe { (*co).stack.truncate(slot_base) };
                self.poller.add(fd, libc::EPOLLOUT as u32).map_err(|e| e.to_string())?;
                self.pending_io.insert(fd, PendingIo::Write { fd, data, waiter: co });
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// `Invoke`: dispatches `receiver.name(args)`. A field holding a
    /// callable value shadows the method table, matching plain `GetField`
    /// followed by `Call`. Otherwise consults the monomorphic class/pointer
    /// inline cache before falling back to a table lookup.
    fn invoke(
        &mut self,
        co: *mut Coroutine,
        name: ObjRef,
        arg_count: u8,
        cache_offset: Option<usize>,
    ) -> Result<CallEffect, String> {
        let slot_base = unsafe { (*co).stack.len() } - arg_count as usize - 1;
        let receiver = unsafe { (&(*co).stack)[slot_base] };
        let inst = expect_instance(receiver)?;
        let instance = unsafe { inst.as_instance() };
        if let Some(field_value) = instance.fields.get(name) {
            unsafe { (&mut (*co).stack)[slot_base] = field_value };
            return self.call_value(co, arg_count);
        }
        let class = instance.class;
        let class_id = unsafe { class.as_class().id } as u16;
        let method_ref = if let Some(offset) = cache_offset {
            let cached = self.read_invoke_cache(co, offset);
            if let Some((cached_id, cached_method)) = cached {
                if cached_id == class_id {
                    cached_method
                } else {
                    let m = self.lookup_method(class, name)?;
                    self.write_invoke_cache(co, offset, class_id, m);
                    m
                }
            } else {
                let m = self.lookup_method(class, name)?;
                self.write_invoke_cache(co, offset, class_id, m);
                m
            }
        } else {
            self.lookup_method(class, name)?
        };
        self.begin_call(co, method_ref, arg_count)
    }

    fn lookup_method(&self, class: ObjRef, name: ObjRef) -> Result<ObjRef, String> {
        let method = unsafe { class.as_class().methods.get(name) }.ok_or_else(|| {
            format!("undefined property '{}'", unsafe { name.as_string().as_str() })
        })?;
        Ok(method.as_obj().expect("method closure"))
    }

    fn read_invoke_cache(&self, co: *mut Coroutine, offset: usize) -> Option<(u16, ObjRef)> {
        unsafe {
            let closure = (*co).frames.last().unwrap().closure;
            let function = closure.as_closure().function.as_function();
            let code = &function.chunk.code;
            let class_id = u16::from_le_bytes([code[offset], code[offset + 1]]);
            if class_id == 0 {
                return None;
            }
            let ptr_bytes = &code[offset + 2..offset + 2 + std::mem::size_of::<usize>()];
            let mut buf = [0u8; std::mem::size_of::<usize>()];
            buf.copy_from_slice(ptr_bytes);
            let ptr = usize::from_ne_bytes(buf) as *mut ember_core::Obj;
            Some((class_id, ObjRef::from_raw(ptr)))
        }
    }

    fn write_invoke_cache(&mut self, co: *mut Coroutine, offset: usize, class_id: u16, method: ObjRef) {
        unsafe {
            let closure = (*co).frames.last().unwrap().closure;
            let function = closure.as_closure().function.as_function_mut();
            let id_bytes = class_id.to_le_bytes();
            function.chunk.code[offset] = id_bytes[0];
            function.chunk.code[offset + 1] = id_bytes[1];
            let ptr_bytes = (method.as_ptr() as usize).to_ne_bytes();
            function.chunk.code[offset + 2..offset + 2 + ptr_bytes.len()]
                .copy_from_slice(&ptr_bytes);
        }
    }
}

fn expect_instance(v: Value) -> Result<ObjRef, String> {
    match v {
        Value::Obj(o) if o.tag() == ObjTag::Instance => Ok(o),
        other => Err(format!("only instances have properties, got {}", other.type_name())),
    }
}

fn expect_array(v: Value) -> Result<ObjRef, String> {
    match v {
        Value::Obj(o) if o.tag() == ObjTag::Array => Ok(o),
        other => Err(format!("expected an array, got {}", other.type_name())),
    }
}

fn expect_index(v: Value) -> Result<usize, String> {
    match v.as_number() {
        Some(n) if n >= 0.0 && n.fract() == 0.0 => Ok(n as usize),
        _ => Err("array index must be a non-negative integer".to_string()),
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    let s = format!("{n:.10}");
    let s = s.trim_end_matches('0');
    let s = s.trim_end_matches('.');
    s.to_string()
}
