//! Runtime values.
//!
//! A `Value` is a small tagged scalar: numbers, booleans and null are
//! immediate, everything heap-shaped is a `HeapRef` handle owned by the
//! GC. Values are `Copy`; the register file, operand stack, globals and
//! heap objects all hold plain copies of the handle.

use serde::{Deserialize, Serialize};

/// Index into the GC's object table.
pub type HeapRef = u32;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
    Str(HeapRef),
    Array(HeapRef),
    Map(HeapRef),
    Struct(HeapRef),
    Class(HeapRef),
    /// Opaque pointer produced by the FFI.
    Ptr(usize),
    /// A function by module index (lambdas, function references).
    Func(u32),
}

impl Value {
    /// Tag name used in fault messages.
    pub fn tag(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Null => "null",
            Value::Str(_) => "str",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Struct(_) => "struct",
            Value::Class(_) => "class",
            Value::Ptr(_) => "ptr",
            Value::Func(_) => "function",
        }
    }

    /// Heap handle, if this value is heap-backed.
    pub fn heap_ref(&self) -> Option<HeapRef> {
        match self {
            Value::Str(r) | Value::Array(r) | Value::Map(r) | Value::Struct(r)
            | Value::Class(r) => Some(*r),
            _ => None,
        }
    }

    /// The 64-bit payload handed to JIT-compiled code. Integer-family
    /// values pass their numeric payload; heap handles pass the index.
    /// A verified-supported function only ever computes with the integer
    /// payloads, so the lossy cases are never observed.
    pub fn payload_i64(&self) -> i64 {
        match self {
            Value::Int(v) => *v,
            Value::Float(v) => v.to_bits() as i64,
            Value::Bool(b) => *b as i64,
            Value::Null => 0,
            Value::Str(r) | Value::Array(r) | Value::Map(r) | Value::Struct(r)
            | Value::Class(r) => *r as i64,
            Value::Ptr(p) => *p as i64,
            Value::Func(f) => *f as i64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_is_small_and_copy() {
        // The register file copies values around freely; keep them word-pair sized.
        assert!(std::mem::size_of::<Value>() <= 16);
        let v = Value::Int(7);
        let w = v;
        assert_eq!(v, w);
    }

    #[test]
    fn test_payload_of_int_family() {
        assert_eq!(Value::Int(-3).payload_i64(), -3);
        assert_eq!(Value::Bool(true).payload_i64(), 1);
        assert_eq!(Value::Null.payload_i64(), 0);
        assert_eq!(Value::Array(9).payload_i64(), 9);
    }

    #[test]
    fn test_heap_ref() {
        assert_eq!(Value::Str(4).heap_ref(), Some(4));
        assert_eq!(Value::Int(4).heap_ref(), None);
    }
}
