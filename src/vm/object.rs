//! Heap object variants and handles.

use super::chunk::Chunk;
use super::table::Table;
use super::value::Value;

/// Handle to a heap object: an index into the heap's slot vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjRef(pub u32);

/// Handle to an interned string. Carries the cached FNV-1a hash so table
/// probing never has to read the heap; two `StrRef`s are equal exactly when
/// they point at the same object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrRef {
    pub obj: ObjRef,
    pub hash: u32,
}

/// A native function installed by the embedder.
pub type NativeFn = fn(&[Value]) -> Value;

/// Strings longer than this cannot be constructed at runtime.
pub const STRING_MAX_LEN: usize = 0x7FFF_FF00;

/// A heap object. Every allocation is one of these variants; the mark bit
/// lives in the heap's slot header, not here.
#[derive(Debug)]
pub enum Obj {
    Str(ObjStr),
    Function(ObjFunction),
    Native(ObjNative),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

/// An immutable, always-interned string with its cached hash.
#[derive(Debug)]
pub struct ObjStr {
    pub hash: u32,
    pub text: Box<str>,
}

/// A compiled function: arity, upvalue count, bytecode, optional name.
#[derive(Debug)]
pub struct ObjFunction {
    pub arity: usize,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    pub name: Option<StrRef>,
}

impl ObjFunction {
    pub fn new(name: Option<StrRef>) -> Self {
        Self {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name,
        }
    }
}

#[derive(Debug)]
pub struct ObjNative {
    pub function: NativeFn,
}

/// A function paired with the upvalue cells it captured.
#[derive(Debug)]
pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// A captured variable. Open upvalues reference a live stack slot; closing
/// one copies the slot's value into the upvalue itself.
#[derive(Debug)]
pub enum ObjUpvalue {
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct ObjClass {
    pub name: StrRef,
    pub methods: Table,
}

#[derive(Debug)]
pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: Table,
}

/// A method already bound to its receiver.
#[derive(Debug)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

/// FNV-1a over the string's bytes.
pub fn hash_string(s: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in s.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_known_values() {
        // Reference values for the 32-bit FNV-1a parameters.
        assert_eq!(hash_string(""), 2166136261);
        assert_eq!(hash_string("a"), 0xe40c292c);
        assert_eq!(hash_string("foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_str_ref_identity() {
        let a = StrRef {
            obj: ObjRef(1),
            hash: 42,
        };
        let b = StrRef {
            obj: ObjRef(1),
            hash: 42,
        };
        let c = StrRef {
            obj: ObjRef(2),
            hash: 42,
        };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
