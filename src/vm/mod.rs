//! The runtime: values, objects, the heap and its collector, bytecode
//! chunks, and the virtual machine.

mod chunk;
pub mod disasm;
mod heap;
mod object;
mod opcode;
mod table;
mod value;
#[allow(clippy::module_inception)]
mod vm;

pub use chunk::{Chunk, MAX_CONSTANTS};
pub use heap::{GcStats, Heap, Roots, GC_FLOOR};
pub use object::{
    hash_string, NativeFn, Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance,
    ObjNative, ObjRef, ObjStr, ObjUpvalue, StrRef, STRING_MAX_LEN,
};
pub use opcode::OpCode;
pub use table::Table;
pub use value::{values_equal, Value};
pub use vm::{InterpretError, RuntimeError, FRAMES_MAX, STACK_MAX, VM};
