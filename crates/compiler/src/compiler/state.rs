//! Per-function compiling context (§4.3): the stackable `Compiler` record
//! that tracks locals, upvalues, the function under construction, and
//! (via `loops`) the innermost enclosing loop's break/continue targets.

use ember_core::ObjRef;

pub const MAX_LOCALS: usize = 256;
pub const MAX_UPVALUES: usize = 256;
pub const UNINITIALIZED_DEPTH: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnKind {
    Script,
    Function,
    Method,
    Initializer,
}

pub struct Local {
    pub name: String,
    pub depth: i32,
    pub is_captured: bool,
}

#[derive(Clone, Copy)]
pub struct UpvalueSlot {
    pub index: u8,
    pub is_local: bool,
}

/// Offsets a loop's `break`/`continue` need. `break_jumps` collects every
/// `Jump` emitted by a `break` inside this loop so they can all be patched
/// to the loop's exit once the loop is fully compiled.
pub struct LoopCtx {
    pub continue_target: usize,
    pub locals_at_loop_start: usize,
    pub break_jumps: Vec<usize>,
}

pub struct ClassCtx {
    pub has_superclass: bool,
}

pub struct FnState {
    pub enclosing: Option<Box<FnState>>,
    pub function: ObjRef, // ObjFunction being built
    pub kind: FnKind,
    pub locals: Vec<Local>,
    pub upvalues: Vec<UpvalueSlot>,
    pub scope_depth: u32,
    pub loops: Vec<LoopCtx>,
}

impl FnState {
    pub fn new(function: ObjRef, kind: FnKind, enclosing: Option<Box<FnState>>) -> FnState {
        // Slot 0 is reserved: `this` for methods/initializers, the
        // closure itself for plain functions (never read as a local, just
        // keeps the calling convention's slot numbering uniform).
        let slot0_name = if matches!(kind, FnKind::Method | FnKind::Initializer) {
            "this"
        } else {
            ""
        };
        FnState {
            enclosing,
            function,
            kind,
            locals: vec![Local {
                name: slot0_name.to_string(),
                depth: 0,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        }
    }

    pub fn function_mut(&self) -> &'static mut ember_core::ObjFunction {
        unsafe { self.function.as_function_mut() }
    }

    pub fn chunk_mut(&self) -> &'static mut ember_core::Chunk {
        &mut self.function_mut().chunk
    }
}
