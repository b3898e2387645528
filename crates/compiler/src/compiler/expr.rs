//! Expression grammar: precedence-climbing Pratt parser (§4.3).

use super::Compiler;
use crate::lexer::TokenKind;
use crate::precedence::Precedence;
use ember_core::{OpCode, Value};

type PrefixFn<'a> = fn(&mut Compiler<'a>, bool);
type InfixFn<'a> = fn(&mut Compiler<'a>, bool);

struct Rule<'a> {
    prefix: Option<PrefixFn<'a>>,
    infix: Option<InfixFn<'a>>,
    precedence: Precedence,
}

fn rule<'a>(kind: TokenKind) -> Rule<'a> {
    use TokenKind::*;
    match kind {
        LeftParen => Rule { prefix: Some(Compiler::grouping), infix: Some(Compiler::call), precedence: Precedence::Call },
        LeftBracket => Rule { prefix: Some(Compiler::array_literal), infix: Some(Compiler::index_access), precedence: Precedence::Call },
        Dot => Rule { prefix: None, infix: Some(Compiler::dot), precedence: Precedence::Call },
        Minus => Rule { prefix: Some(Compiler::unary), infix: Some(Compiler::binary), precedence: Precedence::Term },
        Plus => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Term },
        Slash => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Factor },
        Star => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Factor },
        Bang => Rule { prefix: Some(Compiler::unary), infix: None, precedence: Precedence::None },
        MinusMinus => Rule { prefix: Some(Compiler::unary), infix: None, precedence: Precedence::None },
        BangEqual => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Equality },
        EqualEqual => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Equality },
        Greater => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Comparison },
        GreaterEqual => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Comparison },
        Less => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Comparison },
        LessEqual => Rule { prefix: None, infix: Some(Compiler::binary), precedence: Precedence::Comparison },
        Identifier => Rule { prefix: Some(Compiler::variable), infix: None, precedence: Precedence::None },
        StringLit => Rule { prefix: Some(Compiler::string_literal), infix: None, precedence: Precedence::None },
        TemplateStart => Rule { prefix: Some(Compiler::template_string), infix: None, precedence: Precedence::None },
        Number => Rule { prefix: Some(Compiler::number_literal), infix: None, precedence: Precedence::None },
        And => Rule { prefix: None, infix: Some(Compiler::and_), precedence: Precedence::And },
        Or => Rule { prefix: None, infix: Some(Compiler::or_), precedence: Precedence::Or },
        Question => Rule { prefix: None, infix: Some(Compiler::ternary), precedence: Precedence::Conditional },
        False => Rule { prefix: Some(Compiler::literal), infix: None, precedence: Precedence::None },
        True => Rule { prefix: Some(Compiler::literal), infix: None, precedence: Precedence::None },
        Nil => Rule { prefix: Some(Compiler::literal), infix: None, precedence: Precedence::None },
        This => Rule { prefix: Some(Compiler::this_), infix: None, precedence: Precedence::None },
        Super => Rule { prefix: Some(Compiler::super_), infix: None, precedence: Precedence::None },
        Await => Rule { prefix: Some(Compiler::await_expr), infix: None, precedence: Precedence::None },
        _ => Rule { prefix: None, infix: None, precedence: Precedence::None },
    }
}

impl<'a> Compiler<'a> {
    pub(super) fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    pub(super) fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule(self.previous.kind).prefix else {
            self.error("expect expression");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            let infix = rule(self.previous.kind)
                .infix
                .expect("precedence table: token has precedence but no infix rule");
            infix(self, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("invalid assignment target");
        }
    }

    fn number_literal(&mut self, _can_assign: bool) {
        let n = self.previous.number_value;
        self.emit_constant(Value::Number(n));
    }

    fn string_literal(&mut self, _can_assign: bool) {
        let bytes = self.previous.string_value.clone();
        let s = self.intern(&bytes);
        self.emit_constant(Value::Obj(s));
    }

    /// `"chunk0{expr1}chunk1{expr2}chunk2"` lexes as
    /// `TemplateStart(chunk0) expr1 TemplateEnd [TemplateStart(chunk_i) expr_{i+1} TemplateEnd]* StringLit(last_chunk)`.
    /// Each chunk (even an empty one) and each expression is pushed, then
    /// `Concat n` stringifies and joins them all (§4.6).
    fn template_string(&mut self, _can_assign: bool) {
        let mut count = 0u16;
        let first_chunk = self.previous.string_value.clone();
        let s = self.intern(&first_chunk);
        self.emit_constant(Value::Obj(s));
        count += 1;
        loop {
            self.expression();
            count += 1;
            // the lexer only ever hands us a StringLit or another
            // TemplateStart immediately after a TemplateEnd; `advance()`
            // here plays the role of consuming that TemplateEnd token
            // which the lexer emits in place of `}`.
            self.consume(TokenKind::TemplateEnd, "expect '}' to close interpolation");
            if self.match_token(TokenKind::TemplateStart) {
                let chunk = self.previous.string_value.clone();
                let s = self.intern(&chunk);
                self.emit_constant(Value::Obj(s));
                count += 1;
                continue;
            }
            self.consume(TokenKind::StringLit, "expect end of template string");
            let chunk = self.previous.string_value.clone();
            let s = self.intern(&chunk);
            self.emit_constant(Value::Obj(s));
            count += 1;
            break;
        }
        if count > u8::MAX as u16 {
            self.error("template string has too many interpolations");
            return;
        }
        self.emit_op_u8(OpCode::Concat, count as u8);
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "expect ')' after expression");
    }

    fn array_literal(&mut self, _can_assign: bool) {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                count += 1;
                if count > u8::MAX as u16 {
                    self.error("too many elements in array literal");
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "expect ']' after array elements");
        self.emit_op_u8(OpCode::Array, count as u8);
    }

    fn unary(&mut self, _can_assign: bool) {
        let op_kind = self.previous.kind;
        if op_kind == TokenKind::MinusMinus {
            self.prefix_decrement();
            return;
        }
        self.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenKind::Minus => self.emit_op(OpCode::Neg),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    /// `--x` decrements `x` in place and evaluates to the new value,
    /// mirroring `named_variable`'s postfix handling but without the
    /// `Dup`/extra `Pop` since the set opcodes leave their stored value on
    /// the stack (assignment-expression convention, §4.6).
    fn prefix_decrement(&mut self) {
        if !self.match_token(TokenKind::Identifier) {
            self.error("prefix '--' requires a variable name");
            return;
        }
        let name = self.previous.lexeme.clone();
        let (get_op, set_op, arg) = self.resolve_named_ops(&name);
        self.emit_op_u8(get_op, arg);
        self.emit_op(OpCode::Decr);
        self.emit_op_u8(set_op, arg);
    }

    fn binary(&mut self, _can_assign: bool) {
        let op_kind = self.previous.kind;
        let next_prec = rule(op_kind).precedence.next();
        self.parse_precedence(next_prec);
        match op_kind {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Sub),
            TokenKind::Star => self.emit_op(OpCode::Mul),
            TokenKind::Slash => self.emit_op(OpCode::Div),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => unreachable!(),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    /// `cond ? a : b`. `JumpIfFalse`/`Jump` never pop their own operand —
    /// each arm below explicitly pops the condition after testing it, so
    /// the stack depth reaching either arm's push is identical (§9 open
    /// question on ternary stack balance).
    fn ternary(&mut self, _can_assign: bool) {
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Assignment);
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        self.consume(TokenKind::Colon, "expect ':' in ternary expression");
        self.parse_precedence(Precedence::Conditional);
        self.patch_jump(else_jump);
    }

    fn await_expr(&mut self, _can_assign: bool) {
        if !self.current_fn_is_async() {
            self.error("'await' used outside an async function");
        }
        self.parse_precedence(Precedence::Unary);
        self.emit_op(OpCode::Await);
    }

    pub(super) fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.clone();
        self.named_variable(&name, can_assign);
    }

    fn this_(&mut self, _can_assign: bool) {
        if !self.in_class() {
            self.error("'this' used outside a class method");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        if !self.in_class() {
            self.error("'super' used outside a class");
        } else if !self.class_stack.last().unwrap().has_superclass {
            self.error("'super' used in a class with no superclass");
        }
        self.consume(TokenKind::Dot, "expect '.' after 'super'");
        self.consume(TokenKind::Identifier, "expect superclass method name");
        let name = self.previous.lexeme.clone();
        let method_const = self.identifier_constant(&name);

        self.named_variable("this", false);
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable("super", false);
            self.emit_op_u8(OpCode::SuperInvoke, method_const);
            self.emit_u8(arg_count);
            // single-slot method-pointer cache, zeroed at compile time (§4.2)
            for _ in 0..std::mem::size_of::<usize>() {
                self.emit_u8(0);
            }
        } else {
            self.named_variable("super", false);
            self.emit_op_u8(OpCode::GetSuper, method_const);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                count += 1;
                if count > u8::MAX as u16 {
                    self.error("can't have more than 255 arguments");
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expect ')' after arguments");
        count as u8
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op_u8(OpCode::Call, arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "expect property name after '.'");
        let name = self.previous.lexeme.clone();
        let name_const = self.identifier_constant(&name);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_u8(OpCode::SetField, name_const);
        } else if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_op_u8(OpCode::Invoke, name_const);
            self.emit_u8(arg_count);
            // inline cache: 2-byte class id + pointer-sized slot, zeroed (§4.2)
            self.emit_u8(0);
            self.emit_u8(0);
            for _ in 0..std::mem::size_of::<usize>() {
                self.emit_u8(0);
            }
        } else if can_assign && self.match_postfix_incr_decr() {
            let is_incr = self.previous.kind == TokenKind::PlusPlus;
            // atomic: pops the instance, reads+writes the field in place,
            // pushes the pre-increment value (mirrors ArrayIncr/ArrayDecr)
            self.emit_op_u8(if is_incr { OpCode::FieldIncr } else { OpCode::FieldDecr }, name_const);
        } else {
            self.emit_op_u8(OpCode::GetField, name_const);
        }
    }

    fn index_access(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "expect ']' after index");
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::ArraySet);
        } else if can_assign && self.match_postfix_incr_decr() {
            let is_incr = self.previous.kind == TokenKind::PlusPlus;
            self.emit_op(if is_incr { OpCode::ArrayIncr } else { OpCode::ArrayDecr });
        } else {
            self.emit_op(OpCode::ArrayGet);
        }
    }
}
