//! The tagged `Value` type (spec.md §3 Value). Immediate variants carry
//! their payload inline; heap-backed variants carry a `HeapId` whose
//! referent's `ObjKind` always matches the variant here by construction.

use crate::heap::HeapId;

/// Index into a `Context`'s native-function table. Kept immediate (no heap
/// allocation) since native functions are installed once by the host and
/// live for the context's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeFnId(pub u32);

#[derive(Debug, Clone, Copy)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Native(NativeFnId),
    Heap(HeapId),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "number",
            Value::Float(_) => "number",
            Value::Native(_) => "function",
            Value::Heap(_) => "object",
        }
    }

    /// Truthiness used by `if`/`while`/`&&`/`||`/`JUMPIFFALSE` etc.
    /// Everything is truthy except `null` and `false`.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Null | Value::Bool(false))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric value unified across `Int`/`Float`/`Bool`, or `None` for
    /// non-numeric values. Type-promotion for arithmetic/compare lives
    /// here, not in individual opcodes (spec.md §3 invariant).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Truncated 64-bit integer view used by bitwise/shift/modulus ops.
    pub fn as_i64_truncated(&self) -> Option<i64> {
        self.as_f64().map(|f| f as i64)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_) | Value::Bool(_))
    }
}
