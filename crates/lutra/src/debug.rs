//! Bytecode disassembler.
//!
//! Renders a chunk one instruction per line, with byte offsets, source
//! lines, and operands decoded. Wired to the `print-code` feature (dump
//! each function after a successful compile) and the `trace-execution`
//! feature (dump each instruction as the VM reaches it). Output goes to
//! stderr so program output stays clean.

use crate::chunk::{Chunk, OpCode};
use crate::heap::Heap;
use crate::value::render;

pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) {
    eprintln!("== {} ==", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset);
    }
}

/// Print the instruction at `offset` and return the offset of the next one.
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> usize {
    eprint!("{:04} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        eprint!("   | ");
    } else {
        eprint!("{:4} ", chunk.lines[offset]);
    }

    let byte = chunk.code[offset];
    let Some(op) = OpCode::from_byte(byte) else {
        eprintln!("unknown opcode {}", byte);
        return offset + 1;
    };

    match op {
        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => constant_instruction(heap, chunk, op, offset),
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => byte_instruction(chunk, op, offset),
        OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(chunk, op, 1, offset),
        OpCode::Loop => jump_instruction(chunk, op, -1, offset),
        OpCode::Invoke | OpCode::SuperInvoke => invoke_instruction(heap, chunk, op, offset),
        OpCode::Closure => closure_instruction(heap, chunk, offset),
        _ => {
            eprintln!("{:?}", op);
            offset + 1
        }
    }
}

fn constant_instruction(heap: &Heap, chunk: &Chunk, op: OpCode, offset: usize) -> usize {
    let constant = chunk.code[offset + 1];
    let value = chunk.constants[constant as usize];
    eprintln!("{:<16} {:4} '{}'", format!("{:?}", op), constant, render(heap, value));
    offset + 2
}

fn byte_instruction(chunk: &Chunk, op: OpCode, offset: usize) -> usize {
    let slot = chunk.code[offset + 1];
    eprintln!("{:<16} {:4}", format!("{:?}", op), slot);
    offset + 2
}

fn jump_instruction(chunk: &Chunk, op: OpCode, sign: i64, offset: usize) -> usize {
    let jump = u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]) as i64;
    let target = offset as i64 + 3 + sign * jump;
    eprintln!("{:<16} {:4} -> {}", format!("{:?}", op), offset, target);
    offset + 3
}

fn invoke_instruction(heap: &Heap, chunk: &Chunk, op: OpCode, offset: usize) -> usize {
    let constant = chunk.code[offset + 1];
    let arg_count = chunk.code[offset + 2];
    let value = chunk.constants[constant as usize];
    eprintln!(
        "{:<16} ({} args) {:4} '{}'",
        format!("{:?}", op),
        arg_count,
        constant,
        render(heap, value)
    );
    offset + 3
}

fn closure_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.code[offset + 1];
    let value = chunk.constants[constant as usize];
    eprintln!("{:<16} {:4} '{}'", "Closure", constant, render(heap, value));

    let mut offset = offset + 2;
    let function = value.as_obj().unwrap();
    for _ in 0..heap.function(function).upvalue_count {
        let is_local = chunk.code[offset];
        let index = chunk.code[offset + 1];
        eprintln!(
            "{:04}    |                     {} {}",
            offset,
            if is_local == 1 { "local" } else { "upvalue" },
            index
        );
        offset += 2;
    }
    offset
}
