//! Statement grammar: declarations, control flow, functions, and classes
//! (§4.3).

use super::state::{self, FnKind, LoopCtx};
use super::Compiler;
use crate::lexer::TokenKind;
use ember_core::{OpCode, Value};

const MAX_SWITCH_CASES: usize = 128;

impl<'a> Compiler<'a> {
    pub(super) fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Async) {
            self.consume(TokenKind::Fun, "expect 'fun' after 'async'");
            self.fun_declaration(true);
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration(false);
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.diagnostics.is_panicking() {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("expect variable name");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "expect ';' after variable declaration");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self, is_async: bool) {
        let global = self.parse_variable("expect function name");
        self.mark_initialized();
        self.compile_function(FnKind::Function, is_async);
        self.define_variable(global);
    }

    /// Compiles a function body: `self.previous` must already be the
    /// identifier token naming it (the caller either just ran
    /// `parse_variable` or consumed a method name).
    fn compile_function(&mut self, kind: FnKind, is_async: bool) {
        let name = self.previous.lexeme.clone();
        let name_ref = self.intern(name.as_bytes());
        self.push_fn_state(kind, Some(name_ref), is_async);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "expect '(' after function name");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.fn_state.function_mut().arity == 255 {
                    self.error("can't have more than 255 parameters");
                }
                self.fn_state.function_mut().arity += 1;
                let constant = self.parse_variable("expect parameter name");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expect ')' after parameters");
        self.consume(TokenKind::LeftBrace, "expect '{' before function body");
        self.block();
        self.end_function();
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expect class name");
        let class_name = self.previous.lexeme.clone();
        let name_const = self.identifier_constant(&class_name);
        self.declare_variable(&class_name);
        self.emit_op_u8(OpCode::Class, name_const);
        self.define_variable(name_const);

        let mut has_superclass = false;
        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "expect superclass name");
            let super_name = self.previous.lexeme.clone();
            if super_name == class_name {
                self.error("a class can't inherit from itself");
            }
            self.variable(false);
            self.begin_scope();
            self.add_local("super".to_string());
            self.define_variable(0);

            self.named_variable(&class_name, false);
            self.emit_op(OpCode::Inherit);
            has_superclass = true;
        }

        self.class_stack.push(state::ClassCtx { has_superclass });

        self.named_variable(&class_name, false);
        self.consume(TokenKind::LeftBrace, "expect '{' before class body");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "expect '}' after class body");
        self.emit_op(OpCode::Pop);

        if has_superclass {
            self.end_scope();
        }
        self.class_stack.pop();
    }

    fn method(&mut self) {
        let is_async = self.match_token(TokenKind::Async);
        self.consume(TokenKind::Identifier, "expect method name");
        let name = self.previous.lexeme.clone();
        let name_const = self.identifier_constant(&name);
        let kind = if name == "init" {
            FnKind::Initializer
        } else {
            FnKind::Method
        };
        self.compile_function(kind, is_async);
        self.emit_op_u8(OpCode::Method, name_const);
    }

    // ---- statements ------------------------------------------------------

    pub(super) fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Switch) {
            self.switch_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::Yield) {
            self.consume(TokenKind::Semicolon, "expect ';' after 'yield'");
            self.emit_op(OpCode::Yield);
        } else {
            self.expression_statement();
        }
    }

    pub(super) fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "expect '}' after block");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expect ';' after value");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expect ';' after expression");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "expect '(' after 'if'");
        self.expression();
        self.consume(TokenKind::RightParen, "expect ')' after condition");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().len();
        self.fn_state.loops.push(LoopCtx {
            continue_target: loop_start,
            locals_at_loop_start: self.fn_state.locals.len(),
            break_jumps: Vec::new(),
        });

        self.consume(TokenKind::LeftParen, "expect '(' after 'while'");
        self.expression();
        self.consume(TokenKind::RightParen, "expect ')' after condition");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.finish_loop();
    }

    /// Desugars to a `while` loop. A missing condition clause defaults to
    /// `true` (an open question in the original design resolved this way
    /// for consistency with `while (true)`).
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "expect '(' after 'for'");

        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().len();

        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "expect ';' after loop condition");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        let mut continue_target = loop_start;
        if !self.check(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk().len();
            continue_target = increment_start;
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "expect ')' after for clauses");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        } else {
            self.consume(TokenKind::RightParen, "expect ')' after for clauses");
        }

        self.fn_state.loops.push(LoopCtx {
            continue_target,
            locals_at_loop_start: self.fn_state.locals.len(),
            break_jumps: Vec::new(),
        });

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.finish_loop();
        self.end_scope();
    }

    /// Patches every `break` jump recorded for the innermost loop to land
    /// here, then pops the loop context.
    fn finish_loop(&mut self) {
        let loop_ctx = self.fn_state.loops.pop().expect("loop context pushed by caller");
        for jump in loop_ctx.break_jumps {
            self.patch_jump(jump);
        }
    }

    fn break_statement(&mut self) {
        if self.fn_state.loops.is_empty() {
            self.error("'break' used outside a loop");
            self.consume(TokenKind::Semicolon, "expect ';' after 'break'");
            return;
        }
        self.consume(TokenKind::Semicolon, "expect ';' after 'break'");
        let locals_at_start = self.fn_state.loops.last().unwrap().locals_at_loop_start;
        self.emit_scope_unwind(locals_at_start);
        let jump = self.emit_jump(OpCode::Jump);
        self.fn_state.loops.last_mut().unwrap().break_jumps.push(jump);
    }

    fn continue_statement(&mut self) {
        if self.fn_state.loops.is_empty() {
            self.error("'continue' used outside a loop");
            self.consume(TokenKind::Semicolon, "expect ';' after 'continue'");
            return;
        }
        self.consume(TokenKind::Semicolon, "expect ';' after 'continue'");
        let loop_ctx = self.fn_state.loops.last().unwrap();
        let locals_at_start = loop_ctx.locals_at_loop_start;
        let target = loop_ctx.continue_target;
        self.emit_scope_unwind(locals_at_start);
        self.emit_loop(target);
    }

    /// Pops every local declared since `locals_at_start` without touching
    /// `self.fn_state.locals` itself — `break`/`continue` jump out from
    /// inside nested blocks whose own `end_scope` never runs.
    fn emit_scope_unwind(&mut self, locals_at_start: usize) {
        let count = self.fn_state.locals.len().saturating_sub(locals_at_start);
        if count > 0 {
            self.emit_op_u8(OpCode::PopN, count.min(u8::MAX as usize) as u8);
        }
    }

    fn return_statement(&mut self) {
        if self.fn_state.kind == FnKind::Script {
            self.error("can't return from top-level code");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_implicit_return();
            return;
        }
        if self.fn_state.kind == FnKind::Initializer {
            self.error("can't return a value from an initializer");
        }
        self.expression();
        self.consume(TokenKind::Semicolon, "expect ';' after return value");
        self.emit_op(OpCode::Return);
    }

    /// `switch (subject) { case c1: ...; case c2: ...; default: ...; }`.
    /// Case labels must be constant literals (checked at compile time); at
    /// most `MAX_SWITCH_CASES` of them. No fallthrough — each arm jumps to
    /// the end of the switch once its body completes.
    fn switch_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "expect '(' after 'switch'");
        self.expression();
        self.consume(TokenKind::RightParen, "expect ')' after switch subject");
        self.consume(TokenKind::LeftBrace, "expect '{' before switch body");

        let mut end_jumps = Vec::new();
        let mut case_count = 0usize;
        let mut seen_default = false;

        while self.match_token(TokenKind::Case) {
            case_count += 1;
            if case_count > MAX_SWITCH_CASES {
                self.error("switch has too many cases");
            }
            if seen_default {
                self.error("'case' can't follow 'default'");
            }
            let value = self.constant_case_value();
            self.consume(TokenKind::Colon, "expect ':' after case value");

            self.emit_op(OpCode::Dup);
            self.emit_constant(value);
            self.emit_op(OpCode::Equal);
            let skip_jump = self.emit_jump(OpCode::JumpIfFalse);
            self.emit_op(OpCode::Pop); // matched: discard equality bool
            self.emit_op(OpCode::Pop); // and the duplicated subject
            while !self.check(TokenKind::Case)
                && !self.check(TokenKind::Default)
                && !self.check(TokenKind::RightBrace)
            {
                self.declaration();
            }
            end_jumps.push(self.emit_jump(OpCode::Jump));
            self.patch_jump(skip_jump);
            self.emit_op(OpCode::Pop); // unmatched: discard equality bool
        }

        if self.match_token(TokenKind::Default) {
            seen_default = true;
            self.consume(TokenKind::Colon, "expect ':' after 'default'");
            self.emit_op(OpCode::Pop); // reached unconditionally: discard subject
            while !self.check(TokenKind::RightBrace) {
                self.declaration();
            }
        } else {
            // no default matched: discard the subject left on the stack
            self.emit_op(OpCode::Pop);
        }

        for jump in end_jumps {
            self.patch_jump(jump);
        }
        self.consume(TokenKind::RightBrace, "expect '}' after switch body");
        let _ = seen_default;
    }

    fn constant_case_value(&mut self) -> Value {
        let negative = self.match_token(TokenKind::Minus);
        if self.match_token(TokenKind::Number) {
            let n = self.previous.number_value;
            Value::Number(if negative { -n } else { n })
        } else if negative {
            self.error("expect a constant number after '-' in case label");
            Value::Nil
        } else if self.match_token(TokenKind::StringLit) {
            let bytes = self.previous.string_value.clone();
            let s = self.intern(&bytes);
            Value::Obj(s)
        } else if self.match_token(TokenKind::True) {
            Value::Bool(true)
        } else if self.match_token(TokenKind::False) {
            Value::Bool(false)
        } else if self.match_token(TokenKind::Nil) {
            Value::Nil
        } else {
            self.error("case label must be a constant literal");
            Value::Nil
        }
    }
}
