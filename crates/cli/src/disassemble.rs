//! Bytecode listing for `--disassemble`/`-d` (§4.2, §6).
//!
//! Walks a compiled `Function`'s chunk instruction-by-instruction, printing
//! offset, source position, opcode mnemonic, and resolved operand(s). Dives
//! into nested `Function` constants (from `Closure`) so a whole script
//! disassembles in one pass, the way the original `clox` disassembler does.

use ember_core::{Chunk, ObjRef, ObjTag, OpCode, Value};

pub fn disassemble_script(script: ObjRef) {
    let name = unsafe { script.as_function() }
        .name
        .map(|n| unsafe { n.as_string().as_str() }.to_string())
        .unwrap_or_else(|| "script".to_string());
    disassemble_function(script, &name);
}

fn disassemble_function(function: ObjRef, name: &str) {
    println!("== {name} ==");
    let chunk = &unsafe { function.as_function() }.chunk;
    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, offset);
    }

    // Recurse into any function constants this chunk closes over.
    for constant in &chunk.constants {
        if let Value::Obj(o) = constant {
            if o.tag() == ObjTag::Function {
                let nested_name = unsafe { o.as_function() }
                    .name
                    .map(|n| unsafe { n.as_string().as_str() }.to_string())
                    .unwrap_or_else(|| "anonymous".to_string());
                disassemble_function(*o, &nested_name);
            }
        }
    }
}

fn disassemble_instruction(chunk: &Chunk, offset: usize) -> usize {
    let loc = chunk.loc_at(offset);
    print!("{offset:04}  {}:{:<4} ", loc.line, loc.column);

    let op = OpCode::from_byte(chunk.code[offset]);
    match op {
        OpCode::Const => constant_op("Const", chunk, offset),
        OpCode::DefineGlobal => constant_op("DefineGlobal", chunk, offset),
        OpCode::GetGlobal => constant_op("GetGlobal", chunk, offset),
        OpCode::SetGlobal => constant_op("SetGlobal", chunk, offset),
        OpCode::GetField => constant_op("GetField", chunk, offset),
        OpCode::SetField => constant_op("SetField", chunk, offset),
        OpCode::FieldIncr => constant_op("FieldIncr", chunk, offset),
        OpCode::FieldDecr => constant_op("FieldDecr", chunk, offset),
        OpCode::GetSuper => constant_op("GetSuper", chunk, offset),
        OpCode::Class => constant_op("Class", chunk, offset),
        OpCode::Method => constant_op("Method", chunk, offset),

        OpCode::GetLocal => byte_op("GetLocal", chunk, offset),
        OpCode::SetLocal => byte_op("SetLocal", chunk, offset),
        OpCode::GetUpvalue => byte_op("GetUpvalue", chunk, offset),
        OpCode::SetUpvalue => byte_op("SetUpvalue", chunk, offset),
        OpCode::Call => byte_op("Call", chunk, offset),
        OpCode::PopN => byte_op("PopN", chunk, offset),
        OpCode::Concat => byte_op("Concat", chunk, offset),

        OpCode::Jump => jump_op("Jump", 1, chunk, offset),
        OpCode::JumpIfFalse => jump_op("JumpIfFalse", 1, chunk, offset),
        OpCode::JumpIfTrue => jump_op("JumpIfTrue", 1, chunk, offset),
        OpCode::Loop => jump_op("Loop", -1, chunk, offset),

        OpCode::Closure => closure_op(chunk, offset),

        OpCode::Invoke => invoke_op("Invoke", chunk, offset),
        OpCode::SuperInvoke => super_invoke_op(chunk, offset),

        _ => simple_op(mnemonic(op), offset),
    }
}

fn mnemonic(op: OpCode) -> &'static str {
    match op {
        OpCode::Nil => "Nil",
        OpCode::True => "True",
        OpCode::False => "False",
        OpCode::Dup => "Dup",
        OpCode::Pop => "Pop",
        OpCode::Add => "Add",
        OpCode::Sub => "Sub",
        OpCode::Mul => "Mul",
        OpCode::Div => "Div",
        OpCode::Neg => "Neg",
        OpCode::Not => "Not",
        OpCode::Equal => "Equal",
        OpCode::Greater => "Greater",
        OpCode::Less => "Less",
        OpCode::Incr => "Incr",
        OpCode::Decr => "Decr",
        OpCode::CloseUpvalue => "CloseUpvalue",
        OpCode::Return => "Return",
        OpCode::Inherit => "Inherit",
        OpCode::Print => "Print",
        OpCode::Yield => "Yield",
        OpCode::Await => "Await",
        OpCode::Array => "Array",
        OpCode::ArrayGet => "ArrayGet",
        OpCode::ArraySet => "ArraySet",
        OpCode::ArrayIncr => "ArrayIncr",
        OpCode::ArrayDecr => "ArrayDecr",
        _ => "<unhandled>",
    }
}

fn simple_op(name: &str, offset: usize) -> usize {
    println!("{name}");
    offset + 1
}

fn constant_op(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let idx = chunk.code[offset + 1];
    println!("{name:<14} {idx:4} '{}'", format_constant(chunk.constants[idx as usize]));
    offset + 2
}

fn byte_op(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.code[offset + 1];
    println!("{name:<14} {slot:4}");
    offset + 2
}

fn jump_op(name: &str, sign: i32, chunk: &Chunk, offset: usize) -> usize {
    let jump = chunk.read_u16(offset + 1) as i32;
    let target = offset as i32 + 3 + sign * jump;
    println!("{name:<14} {offset:4} -> {target}");
    offset + 3
}

fn closure_op(chunk: &Chunk, offset: usize) -> usize {
    let idx = chunk.code[offset + 1];
    let mut cursor = offset + 2;
    println!("Closure        {idx:4} '{}'", format_constant(chunk.constants[idx as usize]));
    let function = chunk.constants[idx as usize].as_obj().expect("function constant");
    let upvalue_count = unsafe { function.as_function() }.upvalue_count;
    for _ in 0..upvalue_count {
        let is_local = chunk.code[cursor];
        let index = chunk.code[cursor + 1];
        println!(
            "{cursor:04}      |                     {} {index}",
            if is_local == 1 { "local" } else { "upvalue" }
        );
        cursor += 2;
    }
    cursor
}

fn invoke_op(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let const_idx = chunk.code[offset + 1];
    let arg_count = chunk.code[offset + 2];
    println!(
        "{name:<14} ({arg_count} args) '{}'",
        format_constant(chunk.constants[const_idx as usize])
    );
    offset + 3 + 2 + std::mem::size_of::<usize>()
}

fn super_invoke_op(chunk: &Chunk, offset: usize) -> usize {
    let const_idx = chunk.code[offset + 1];
    let arg_count = chunk.code[offset + 2];
    println!(
        "SuperInvoke    ({arg_count} args) '{}'",
        format_constant(chunk.constants[const_idx as usize])
    );
    offset + 3 + std::mem::size_of::<usize>()
}

fn format_constant(value: Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Obj(o) => match o.tag() {
            ObjTag::String => unsafe { o.as_string().as_str() }.to_string(),
            ObjTag::Function => unsafe { o.as_function() }
                .name
                .map(|n| unsafe { n.as_string().as_str() }.to_string())
                .unwrap_or_else(|| "<script>".to_string()),
            _ => format!("<{:?}>", o.tag()),
        },
    }
}
