//! Human-readable bytecode listings, used by trace mode.

use std::io::{self, Write};

use super::chunk::Chunk;
use super::heap::Heap;
use super::object::Obj;
use super::opcode::OpCode;

/// Print every instruction of `chunk` under a `== name ==` header.
pub fn disassemble_chunk(
    heap: &Heap,
    chunk: &Chunk,
    name: &str,
    out: &mut dyn Write,
) -> io::Result<()> {
    writeln!(out, "== {} ==", name)?;
    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(heap, chunk, offset, out)?;
    }
    Ok(())
}

/// Print the instruction at `offset` and return the offset just past it.
pub fn disassemble_instruction(
    heap: &Heap,
    chunk: &Chunk,
    offset: usize,
    out: &mut dyn Write,
) -> io::Result<usize> {
    write!(out, "{:04} ", offset)?;
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        write!(out, "   | ")?;
    } else {
        write!(out, "{:4} ", chunk.lines[offset])?;
    }

    let Some(op) = OpCode::from_u8(chunk.code[offset]) else {
        writeln!(out, "Unknown opcode {}", chunk.code[offset])?;
        return Ok(offset + 1);
    };

    match op {
        OpCode::Return
        | OpCode::Nil
        | OpCode::True
        | OpCode::False
        | OpCode::Pop
        | OpCode::Equal
        | OpCode::Greater
        | OpCode::Less
        | OpCode::Add
        | OpCode::Subtract
        | OpCode::Multiply
        | OpCode::Divide
        | OpCode::Not
        | OpCode::Negate
        | OpCode::Print
        | OpCode::CloseUpvalue
        | OpCode::Inherit => {
            writeln!(out, "{}", op.name())?;
            Ok(offset + 1)
        }

        OpCode::PopN | OpCode::Call => {
            let operand = chunk.code[offset + 1];
            writeln!(out, "{:<16} {:4}", op.name(), operand)?;
            Ok(offset + 2)
        }

        OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue => {
            let displacement =
                i16::from_le_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]);
            let target = (offset as isize + 3 + displacement as isize) as usize;
            writeln!(out, "{:<16} {:4} -> {}", op.name(), offset, target)?;
            Ok(offset + 3)
        }

        OpCode::GetLocal
        | OpCode::GetLocal16
        | OpCode::GetLocal24
        | OpCode::SetLocal
        | OpCode::SetLocal16
        | OpCode::SetLocal24
        | OpCode::GetUpvalue
        | OpCode::GetUpvalue16
        | OpCode::GetUpvalue24
        | OpCode::SetUpvalue
        | OpCode::SetUpvalue16
        | OpCode::SetUpvalue24 => {
            let width = op.index_width().unwrap_or(1);
            let slot = read_index(chunk, offset + 1, width);
            writeln!(out, "{:<16} {:4}", op.name(), slot)?;
            Ok(offset + 1 + width)
        }

        OpCode::Constant
        | OpCode::Constant16
        | OpCode::Constant24
        | OpCode::Class
        | OpCode::Class16
        | OpCode::Class24
        | OpCode::Method
        | OpCode::Method16
        | OpCode::Method24
        | OpCode::DefineGlobal
        | OpCode::DefineGlobal16
        | OpCode::DefineGlobal24
        | OpCode::GetGlobal
        | OpCode::GetGlobal16
        | OpCode::GetGlobal24
        | OpCode::SetGlobal
        | OpCode::SetGlobal16
        | OpCode::SetGlobal24
        | OpCode::GetProperty
        | OpCode::GetProperty16
        | OpCode::GetProperty24
        | OpCode::SetProperty
        | OpCode::SetProperty16
        | OpCode::SetProperty24
        | OpCode::GetSuper
        | OpCode::GetSuper16
        | OpCode::GetSuper24 => {
            let width = op.index_width().unwrap_or(1);
            let index = read_index(chunk, offset + 1, width);
            write!(out, "{:<16} {:4} '", op.name(), index)?;
            heap.write_value(chunk.constants[index], out)?;
            writeln!(out, "'")?;
            Ok(offset + 1 + width)
        }

        OpCode::Invoke | OpCode::Invoke16 | OpCode::Invoke24 => {
            let width = op.index_width().unwrap_or(1);
            let index = read_index(chunk, offset + 1, width);
            let argc = chunk.code[offset + 1 + width];
            write!(out, "{:<16} ({} args) {:4} '", op.name(), argc, index)?;
            heap.write_value(chunk.constants[index], out)?;
            writeln!(out, "'")?;
            Ok(offset + 2 + width)
        }

        OpCode::Closure | OpCode::Closure16 | OpCode::Closure24 => {
            let width = op.index_width().unwrap_or(1);
            let index = read_index(chunk, offset + 1, width);
            write!(out, "{:<16} {:4} ", op.name(), index)?;
            heap.write_value(chunk.constants[index], out)?;
            writeln!(out)?;

            let mut next = offset + 1 + width;
            let upvalue_count = chunk.constants[index]
                .as_obj()
                .map_or(0, |r| match heap.get(r) {
                    Obj::Function(f) => f.upvalue_count,
                    _ => 0,
                });
            for _ in 0..upvalue_count {
                let word = u16::from_le_bytes([chunk.code[next], chunk.code[next + 1]]);
                let kind = if word & 0x8000 != 0 { "local" } else { "upvalue" };
                let source = word & 0x7FFF;
                writeln!(
                    out,
                    "{:04}      |                     {} {}",
                    next, kind, source
                )?;
                next += 2;
            }
            Ok(next)
        }
    }
}

fn read_index(chunk: &Chunk, start: usize, width: usize) -> usize {
    let mut index = 0usize;
    for i in 0..width {
        index |= (chunk.code[start + i] as usize) << (8 * i);
    }
    index
}
