//! Bytecode instruction definitions.
//!
//! Opcodes are single bytes. Fifteen instruction families take a constant or
//! slot index and come in three widths at consecutive opcode values: the base
//! opcode reads a 1-byte operand, base+1 a 2-byte operand, base+2 a 3-byte
//! operand, all little-endian. Jumps carry a 16-bit signed displacement that
//! is added to the instruction pointer after the operand is read.

/// Bytecode instructions for the Opal VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Return,
    Nil,
    True,
    False,
    Pop,
    /// Pop N values; N is a 1-byte operand.
    PopN,
    Equal,
    Greater,
    Less,
    Add,
    Subtract,
    Multiply,
    Divide,
    Not,
    Negate,
    Print,
    /// Relative jump; 16-bit signed displacement.
    Jump,
    /// Jump if the top of stack is falsy. Does not pop.
    JumpIfFalse,
    /// Jump if the top of stack is truthy. Does not pop.
    JumpIfTrue,
    /// Call with N arguments; N is a 1-byte operand.
    Call,
    /// Close the open upvalue for the top stack slot, then pop it.
    CloseUpvalue,
    /// Copy the superclass's methods into the subclass above it.
    Inherit,

    // Variable-width families. Each family must keep its three widths at
    // consecutive values; the VM and disassembler rely on the layout.
    Constant,
    Constant16,
    Constant24,
    Class,
    Class16,
    Class24,
    Method,
    Method16,
    Method24,
    /// Fused property call: index operand, then a 1-byte argument count.
    Invoke,
    Invoke16,
    Invoke24,
    /// Closure construction: index operand, then one 16-bit descriptor per
    /// upvalue (high bit: capture a local; low 15 bits: source index).
    Closure,
    Closure16,
    Closure24,
    DefineGlobal,
    DefineGlobal16,
    DefineGlobal24,
    GetGlobal,
    GetGlobal16,
    GetGlobal24,
    SetGlobal,
    SetGlobal16,
    SetGlobal24,
    GetLocal,
    GetLocal16,
    GetLocal24,
    SetLocal,
    SetLocal16,
    SetLocal24,
    GetUpvalue,
    GetUpvalue16,
    GetUpvalue24,
    SetUpvalue,
    SetUpvalue16,
    SetUpvalue24,
    GetProperty,
    GetProperty16,
    GetProperty24,
    SetProperty,
    SetProperty16,
    SetProperty24,
    GetSuper,
    GetSuper16,
    GetSuper24,
}

/// Number of defined opcodes; bytes below this decode via `from_u8`.
const OPCODE_COUNT: u8 = OpCode::GetSuper24 as u8 + 1;

/// Lookup table for byte → opcode decoding, indexed by discriminant.
static OPCODES: [OpCode; OPCODE_COUNT as usize] = [
    OpCode::Return,
    OpCode::Nil,
    OpCode::True,
    OpCode::False,
    OpCode::Pop,
    OpCode::PopN,
    OpCode::Equal,
    OpCode::Greater,
    OpCode::Less,
    OpCode::Add,
    OpCode::Subtract,
    OpCode::Multiply,
    OpCode::Divide,
    OpCode::Not,
    OpCode::Negate,
    OpCode::Print,
    OpCode::Jump,
    OpCode::JumpIfFalse,
    OpCode::JumpIfTrue,
    OpCode::Call,
    OpCode::CloseUpvalue,
    OpCode::Inherit,
    OpCode::Constant,
    OpCode::Constant16,
    OpCode::Constant24,
    OpCode::Class,
    OpCode::Class16,
    OpCode::Class24,
    OpCode::Method,
    OpCode::Method16,
    OpCode::Method24,
    OpCode::Invoke,
    OpCode::Invoke16,
    OpCode::Invoke24,
    OpCode::Closure,
    OpCode::Closure16,
    OpCode::Closure24,
    OpCode::DefineGlobal,
    OpCode::DefineGlobal16,
    OpCode::DefineGlobal24,
    OpCode::GetGlobal,
    OpCode::GetGlobal16,
    OpCode::GetGlobal24,
    OpCode::SetGlobal,
    OpCode::SetGlobal16,
    OpCode::SetGlobal24,
    OpCode::GetLocal,
    OpCode::GetLocal16,
    OpCode::GetLocal24,
    OpCode::SetLocal,
    OpCode::SetLocal16,
    OpCode::SetLocal24,
    OpCode::GetUpvalue,
    OpCode::GetUpvalue16,
    OpCode::GetUpvalue24,
    OpCode::SetUpvalue,
    OpCode::SetUpvalue16,
    OpCode::SetUpvalue24,
    OpCode::GetProperty,
    OpCode::GetProperty16,
    OpCode::GetProperty24,
    OpCode::SetProperty,
    OpCode::SetProperty16,
    OpCode::SetProperty24,
    OpCode::GetSuper,
    OpCode::GetSuper16,
    OpCode::GetSuper24,
];

impl OpCode {
    /// Decode a byte into an opcode. Returns `None` for undefined bytes.
    #[inline]
    pub fn from_u8(byte: u8) -> Option<OpCode> {
        OPCODES.get(byte as usize).copied()
    }

    /// Width in bytes of this opcode's index operand within its family
    /// (1, 2, or 3), or `None` for opcodes outside the indexed families.
    #[inline]
    pub fn index_width(self) -> Option<usize> {
        let byte = self as u8;
        if byte < OpCode::Constant as u8 {
            return None;
        }
        Some(((byte - OpCode::Constant as u8) % 3) as usize + 1)
    }

    /// The base (1-byte-operand) opcode of this opcode's family.
    #[inline]
    pub fn family_base(self) -> OpCode {
        let byte = self as u8;
        if byte < OpCode::Constant as u8 {
            return self;
        }
        let base = byte - (byte - OpCode::Constant as u8) % 3;
        OPCODES[base as usize]
    }

    /// Disassembly name, matching the classic OP_ spelling.
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Return => "OP_RETURN",
            OpCode::Nil => "OP_NIL",
            OpCode::True => "OP_TRUE",
            OpCode::False => "OP_FALSE",
            OpCode::Pop => "OP_POP",
            OpCode::PopN => "OP_POPN",
            OpCode::Equal => "OP_EQUAL",
            OpCode::Greater => "OP_GREATER",
            OpCode::Less => "OP_LESS",
            OpCode::Add => "OP_ADD",
            OpCode::Subtract => "OP_SUBTRACT",
            OpCode::Multiply => "OP_MULTIPLY",
            OpCode::Divide => "OP_DIVIDE",
            OpCode::Not => "OP_NOT",
            OpCode::Negate => "OP_NEGATE",
            OpCode::Print => "OP_PRINT",
            OpCode::Jump => "OP_JUMP",
            OpCode::JumpIfFalse => "OP_JUMP_IF_FALSE",
            OpCode::JumpIfTrue => "OP_JUMP_IF_TRUE",
            OpCode::Call => "OP_CALL",
            OpCode::CloseUpvalue => "OP_CLOSE_UPVALUE",
            OpCode::Inherit => "OP_INHERIT",
            OpCode::Constant => "OP_CONSTANT",
            OpCode::Constant16 => "OP_CONSTANT_16",
            OpCode::Constant24 => "OP_CONSTANT_24",
            OpCode::Class => "OP_CLASS",
            OpCode::Class16 => "OP_CLASS_16",
            OpCode::Class24 => "OP_CLASS_24",
            OpCode::Method => "OP_METHOD",
            OpCode::Method16 => "OP_METHOD_16",
            OpCode::Method24 => "OP_METHOD_24",
            OpCode::Invoke => "OP_INVOKE",
            OpCode::Invoke16 => "OP_INVOKE_16",
            OpCode::Invoke24 => "OP_INVOKE_24",
            OpCode::Closure => "OP_CLOSURE",
            OpCode::Closure16 => "OP_CLOSURE_16",
            OpCode::Closure24 => "OP_CLOSURE_24",
            OpCode::DefineGlobal => "OP_DEFINE_GLOBAL",
            OpCode::DefineGlobal16 => "OP_DEFINE_GLOBAL_16",
            OpCode::DefineGlobal24 => "OP_DEFINE_GLOBAL_24",
            OpCode::GetGlobal => "OP_GET_GLOBAL",
            OpCode::GetGlobal16 => "OP_GET_GLOBAL_16",
            OpCode::GetGlobal24 => "OP_GET_GLOBAL_24",
            OpCode::SetGlobal => "OP_SET_GLOBAL",
            OpCode::SetGlobal16 => "OP_SET_GLOBAL_16",
            OpCode::SetGlobal24 => "OP_SET_GLOBAL_24",
            OpCode::GetLocal => "OP_GET_LOCAL",
            OpCode::GetLocal16 => "OP_GET_LOCAL_16",
            OpCode::GetLocal24 => "OP_GET_LOCAL_24",
            OpCode::SetLocal => "OP_SET_LOCAL",
            OpCode::SetLocal16 => "OP_SET_LOCAL_16",
            OpCode::SetLocal24 => "OP_SET_LOCAL_24",
            OpCode::GetUpvalue => "OP_GET_UPVALUE",
            OpCode::GetUpvalue16 => "OP_GET_UPVALUE_16",
            OpCode::GetUpvalue24 => "OP_GET_UPVALUE_24",
            OpCode::SetUpvalue => "OP_SET_UPVALUE",
            OpCode::SetUpvalue16 => "OP_SET_UPVALUE_16",
            OpCode::SetUpvalue24 => "OP_SET_UPVALUE_24",
            OpCode::GetProperty => "OP_GET_PROPERTY",
            OpCode::GetProperty16 => "OP_GET_PROPERTY_16",
            OpCode::GetProperty24 => "OP_GET_PROPERTY_24",
            OpCode::SetProperty => "OP_SET_PROPERTY",
            OpCode::SetProperty16 => "OP_SET_PROPERTY_16",
            OpCode::SetProperty24 => "OP_SET_PROPERTY_24",
            OpCode::GetSuper => "OP_GET_SUPER",
            OpCode::GetSuper16 => "OP_GET_SUPER_16",
            OpCode::GetSuper24 => "OP_GET_SUPER_24",
        }
    }
}
