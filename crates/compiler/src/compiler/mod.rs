//! Single-pass Pratt compiler: consumes tokens from the `Lexer` and emits
//! bytecode directly into the function currently under construction. See
//! spec §4.3 for the full design; this module is split the way the
//! teacher's codegen is split — a driver (`mod.rs`) plus focused pieces
//! (`expr.rs` for the precedence-climbing expression grammar, `stmt.rs`
//! for statements, scopes, functions, and classes).

mod expr;
mod state;
mod stmt;

pub use state::{FnKind, MAX_LOCALS, MAX_UPVALUES};

use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::lexer::{Lexer, Pos, Token, TokenKind};
use crate::precedence::Precedence;
use ember_core::{Allocator, Chunk, Loc, ObjRef, OpCode, Value};
use state::{FnState, UNINITIALIZED_DEPTH};

pub struct Compiler<'a> {
    lexer: Lexer,
    previous: Token,
    current: Token,
    diagnostics: DiagnosticSink,
    fn_state: Box<FnState>,
    class_stack: Vec<state::ClassCtx>,
    alloc: &'a mut dyn Allocator,
}

/// Compiles `source` into a root `Function` (the "script"). On failure,
/// returns every accumulated diagnostic rather than stopping at the first
/// (§4.3 panic-mode recovery).
pub fn compile(source: &str, alloc: &mut dyn Allocator) -> Result<ObjRef, Vec<Diagnostic>> {
    let script = alloc.new_function(None);
    {
        let f = unsafe { script.as_function_mut() };
        f.arity = 0;
        f.upvalue_count = 0;
        f.is_async = false;
    }
    let mut compiler = Compiler {
        lexer: Lexer::new(source),
        previous: Token {
            kind: TokenKind::Eof,
            lexeme: String::new(),
            string_value: Vec::new(),
            number_value: 0.0,
            pos: Pos::default(),
        },
        current: Token {
            kind: TokenKind::Eof,
            lexeme: String::new(),
            string_value: Vec::new(),
            number_value: 0.0,
            pos: Pos::default(),
        },
        diagnostics: DiagnosticSink::new(),
        fn_state: Box::new(FnState::new(script, FnKind::Script, None)),
        class_stack: Vec::new(),
        alloc,
    };
    compiler.advance();
    while !compiler.check(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.consume(TokenKind::Eof, "expect end of expression");
    let function = compiler.end_function();
    if compiler.diagnostics.had_error() {
        Err(compiler.diagnostics.into_diagnostics())
    } else {
        Ok(function)
    }
}

impl<'a> Compiler<'a> {
    // ---- token stream plumbing ----------------------------------------

    fn advance(&mut self) {
        std::mem::swap(&mut self.previous, &mut self.current);
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let msg = self.current.lexeme.clone();
            self.error_at_current(&msg);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.diagnostics.error_at(self.current.pos, message);
    }

    fn error(&mut self, message: &str) {
        self.diagnostics.error_at(self.previous.pos, message);
    }

    /// Skips tokens until a statement boundary, so one malformed
    /// declaration doesn't cascade into a screen of follow-on errors
    /// (§4.3).
    fn synchronize(&mut self) {
        self.diagnostics.clear_panic();
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Async
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return
                | TokenKind::Switch => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- bytecode emission ----------------------------------------------

    fn loc(&self) -> Loc {
        Loc {
            line: self.previous.pos.line,
            column: self.previous.pos.column,
        }
    }

    fn chunk(&self) -> &'static mut Chunk {
        self.fn_state.chunk_mut()
    }

    fn emit_op(&mut self, op: OpCode) {
        let loc = self.loc();
        self.chunk().write_op(op, loc);
    }

    fn emit_u8(&mut self, byte: u8) {
        let loc = self.loc();
        self.chunk().write_u8(byte, loc);
    }

    fn emit_op_u8(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_u8(byte);
    }

    fn emit_u16_placeholder(&mut self) -> usize {
        let loc = self.loc();
        self.chunk().write_u16(0xFFFF, loc);
        self.chunk().len() - 2
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_u16_placeholder()
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump_len = self.chunk().len() - offset - 2;
        if jump_len > u16::MAX as usize {
            self.error("jump offset exceeds 65535 bytes");
            return;
        }
        self.chunk().patch_u16(offset, jump_len as u16);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk().len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("loop body too large (exceeds 65535 bytes)");
            let loc = self.loc();
            self.chunk().write_u16(0, loc);
            return;
        }
        let loc = self.loc();
        self.chunk().write_u16(offset as u16, loc);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.chunk().add_constant(value) {
            Ok(idx) => idx,
            Err(msg) => {
                self.error(&msg);
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_op_u8(OpCode::Const, idx);
    }

    fn intern(&mut self, bytes: &[u8]) -> ObjRef {
        self.alloc.intern_string(bytes)
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let s = self.intern(name.as_bytes());
        self.make_constant(Value::Obj(s))
    }

    // ---- scopes / locals --------------------------------------------------

    fn begin_scope(&mut self) {
        self.fn_state.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.fn_state.scope_depth -= 1;
        let depth = self.fn_state.scope_depth as i32;
        let mut pop_count: u8 = 0;
        while let Some(local) = self.fn_state.locals.last() {
            if local.depth <= depth {
                break;
            }
            if local.is_captured {
                if pop_count > 0 {
                    self.emit_op_u8(OpCode::PopN, pop_count);
                    pop_count = 0;
                }
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                pop_count = pop_count.saturating_add(1);
            }
            self.fn_state.locals.pop();
        }
        if pop_count > 0 {
            self.emit_op_u8(OpCode::PopN, pop_count);
        }
    }

    fn add_local(&mut self, name: String) {
        if self.fn_state.locals.len() >= state::MAX_LOCALS {
            self.error("too many local variables in one function");
            return;
        }
        self.fn_state.locals.push(state::Local {
            name,
            depth: UNINITIALIZED_DEPTH,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        if self.fn_state.scope_depth == 0 {
            return;
        }
        if let Some(local) = self.fn_state.locals.last_mut() {
            local.depth = self.fn_state.scope_depth as i32;
        }
    }

    fn declare_variable(&mut self, name: &str) {
        if self.fn_state.scope_depth == 0 {
            return;
        }
        for local in self.fn_state.locals.iter().rev() {
            if local.depth != UNINITIALIZED_DEPTH && local.depth < self.fn_state.scope_depth as i32
            {
                break;
            }
            if local.name == name {
                self.error("a variable with this name already exists in this scope");
                return;
            }
        }
        self.add_local(name.to_string());
    }

    /// Parses `var x` / parameter / class / function name, returning the
    /// global-name constant index (meaningless for locals).
    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        let name = self.previous.lexeme.clone();
        self.declare_variable(&name);
        if self.fn_state.scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(&name)
    }

    fn define_variable(&mut self, global: u8) {
        if self.fn_state.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_u8(OpCode::DefineGlobal, global);
    }

    fn resolve_local(fn_state: &FnState, name: &str) -> Option<Result<u8, ()>> {
        for (i, local) in fn_state.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == UNINITIALIZED_DEPTH {
                    return Some(Err(()));
                }
                return Some(Ok(i as u8));
            }
        }
        None
    }

    fn add_upvalue(fn_state: &mut FnState, index: u8, is_local: bool) -> Result<u8, String> {
        for (i, existing) in fn_state.upvalues.iter().enumerate() {
            if existing.index == index && existing.is_local == is_local {
                return Ok(i as u8);
            }
        }
        if fn_state.upvalues.len() >= state::MAX_UPVALUES {
            return Err("too many captured variables in one function".to_string());
        }
        fn_state.upvalues.push(state::UpvalueSlot { index, is_local });
        fn_state.function_mut().upvalue_count = fn_state.upvalues.len() as u8;
        Ok((fn_state.upvalues.len() - 1) as u8)
    }

    /// Recursively searches enclosing compilers for `name`, threading an
    /// upvalue chain down to the current function when found. Marks the
    /// captured local so its scope-close emits `CloseUpvalue` instead of a
    /// plain pop.
    fn resolve_upvalue(fn_state: &mut FnState, name: &str) -> Result<Option<u8>, String> {
        let Some(enclosing) = fn_state.enclosing.as_mut() else {
            return Ok(None);
        };
        if let Some(res) = Self::resolve_local(enclosing, name) {
            match res {
                Ok(local_idx) => {
                    enclosing.locals[local_idx as usize].is_captured = true;
                    return Self::add_upvalue(fn_state, local_idx, true).map(Some);
                }
                Err(()) => return Err("can't read local variable in its own initializer".into()),
            }
        }
        if let Some(upvalue_idx) = Self::resolve_upvalue(enclosing, name)? {
            return Self::add_upvalue(fn_state, upvalue_idx, false).map(Some);
        }
        Ok(None)
    }

    /// Resolves `name` to the local/upvalue/global get+set opcode pair and
    /// their shared operand byte. Shared by plain reads, `=` assignment,
    /// postfix `++`/`--`, and prefix `--`.
    fn resolve_named_ops(&mut self, name: &str) -> (OpCode, OpCode, u8) {
        match Self::resolve_local(&self.fn_state, name) {
            Some(Ok(idx)) => (OpCode::GetLocal, OpCode::SetLocal, idx),
            Some(Err(())) => {
                self.error("can't read local variable in its own initializer");
                (OpCode::GetLocal, OpCode::SetLocal, 0)
            }
            None => match Self::resolve_upvalue(&mut self.fn_state, name) {
                Ok(Some(idx)) => (OpCode::GetUpvalue, OpCode::SetUpvalue, idx),
                Ok(None) => {
                    let idx = self.identifier_constant(name);
                    (OpCode::GetGlobal, OpCode::SetGlobal, idx)
                }
                Err(msg) => {
                    self.error(&msg);
                    (OpCode::GetGlobal, OpCode::SetGlobal, 0)
                }
            },
        }
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let (get_op, set_op, arg) = self.resolve_named_ops(name);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_u8(set_op, arg);
        } else if can_assign && self.match_postfix_incr_decr() {
            let is_incr = self.previous.kind == TokenKind::PlusPlus;
            self.emit_op_u8(get_op, arg);
            self.emit_op(OpCode::Dup);
            self.emit_op(if is_incr { OpCode::Incr } else { OpCode::Decr });
            self.emit_op_u8(set_op, arg);
            self.emit_op(OpCode::Pop);
        } else {
            self.emit_op_u8(get_op, arg);
        }
    }

    fn match_postfix_incr_decr(&mut self) -> bool {
        self.match_token(TokenKind::PlusPlus) || self.match_token(TokenKind::MinusMinus)
    }

    // ---- function compiling -------------------------------------------

    fn push_fn_state(&mut self, kind: FnKind, name: Option<ObjRef>, is_async: bool) {
        let function = self.alloc.new_function(name);
        {
            let f = unsafe { function.as_function_mut() };
            f.is_async = is_async;
        }
        let new_state = Box::new(FnState::new(function, kind, None));
        let old_state = std::mem::replace(&mut self.fn_state, new_state);
        self.fn_state.enclosing = Some(old_state);
    }

    /// Emits the implicit trailing return, pops the function context back
    /// to its enclosing one, and — for a non-top-level function — emits
    /// the enclosing `Closure` instruction with its upvalue descriptor
    /// list.
    fn end_function(&mut self) -> ObjRef {
        self.emit_implicit_return();
        let function = self.fn_state.function;
        let upvalues: Vec<_> = self.fn_state.upvalues.iter().copied().collect();
        let enclosing = self.fn_state.enclosing.take();
        match enclosing {
            Some(enclosing) => {
                self.fn_state = enclosing;
                let const_idx = self.make_constant(Value::Obj(function));
                self.emit_op_u8(OpCode::Closure, const_idx);
                for up in upvalues {
                    self.emit_u8(if up.is_local { 1 } else { 0 });
                    self.emit_u8(up.index);
                }
            }
            None => {
                // top-level script: nothing encloses it, nothing to emit.
            }
        }
        function
    }

    fn emit_implicit_return(&mut self) {
        if self.fn_state.kind == FnKind::Initializer {
            self.emit_op_u8(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn current_fn_is_async(&self) -> bool {
        self.fn_state.function_mut().is_async
    }

    fn in_class(&self) -> bool {
        !self.class_stack.is_empty()
    }
}
