//! Ordering and equality opcodes (spec.md §4.5.3). `COMPAREPLAIN`/`COMPAREEQUAL`
//! push a numeric "compare result"; `ISEQUAL`/`NOTEQUAL`/`GREATERTHAN`/
//! `GREATEREQUAL` turn that result into a bool. Keeping both stages means
//! the ordering/equality rules live here once rather than once per opcode.

use crate::bytecode::op::Op;
use crate::errors::ApeError;
use crate::heap::{HeapId, ObjData};
use crate::value::Value;

use super::Vm;

pub fn exec(vm: &mut Vm, op: Op) -> Result<(), ApeError> {
    match op {
        Op::ComparePlain => compare_plain(vm),
        Op::CompareEqual => compare_equal(vm),
        Op::IsEqual => finish(vm, |n| n == 0.0),
        Op::NotEqual => finish(vm, |n| n != 0.0),
        Op::GreaterThan => finish(vm, |n| n > 0.0),
        Op::GreaterEqual => finish(vm, |n| n >= 0.0),
        _ => unreachable!("compare::exec called with non-compare opcode {op:?}"),
    }
}

fn finish(vm: &mut Vm, pred: impl Fn(f64) -> bool) -> Result<(), ApeError> {
    let result = vm.pop();
    let n = result.as_f64().expect("compare-result on stack must be numeric");
    vm.push(Value::Bool(pred(n)))
}

fn string_bytes(vm: &Vm, v: Value) -> Option<String> {
    if let Value::Heap(id) = v {
        if let ObjData::String(s) = vm.heap().get(id) {
            return Some(s.bytes.clone());
        }
    }
    None
}

fn compare_plain(vm: &mut Vm) -> Result<(), ApeError> {
    let b = vm.pop();
    let a = vm.pop();
    if a.is_number() && b.is_number() {
        return vm.push(Value::Float(a.as_f64().unwrap() - b.as_f64().unwrap()));
    }
    if let (Some(sa), Some(sb)) = (string_bytes(vm, a), string_bytes(vm, b)) {
        let ordering = match sa.cmp(&sb) {
            std::cmp::Ordering::Less => -1.0,
            std::cmp::Ordering::Equal => 0.0,
            std::cmp::Ordering::Greater => 1.0,
        };
        return vm.push(Value::Float(ordering));
    }
    if a.is_null() && b.is_null() {
        return vm.push(Value::Float(0.0));
    }
    if let (Value::Heap(ia), Value::Heap(ib)) = (a, b) {
        return vm.push(Value::Float(if ia == ib { 0.0 } else { 1.0 }));
    }
    Err(vm.runtime_error(format!("cannot compare {} and {}", a.type_name(), b.type_name())))
}

fn compare_equal(vm: &mut Vm) -> Result<(), ApeError> {
    let b = vm.pop();
    let a = vm.pop();
    let equal = values_equal(vm, a, b);
    vm.push(Value::Float(if equal { 0.0 } else { 1.0 }))
}

/// Structural equality per spec.md §3: numbers/bools unify by value, strings
/// by content, arrays/maps recursively by contents; everything else (script
/// functions, externals, errors) falls back to heap-slot identity.
pub(super) fn values_equal(vm: &Vm, a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Native(x), Value::Native(y)) => x == y,
        (Value::Heap(ia), Value::Heap(ib)) => heap_values_equal(vm, ia, ib),
        _ if a.is_number() && b.is_number() => a.as_f64() == b.as_f64(),
        _ => false,
    }
}

fn heap_values_equal(vm: &Vm, ia: HeapId, ib: HeapId) -> bool {
    if ia == ib {
        return true;
    }
    match (vm.heap().get(ia), vm.heap().get(ib)) {
        (ObjData::String(x), ObjData::String(y)) => x.bytes == y.bytes,
        (ObjData::Array(x), ObjData::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(xv, yv)| values_equal(vm, *xv, *yv))
        }
        (ObjData::Map(x), ObjData::Map(y)) => {
            x.entries.len() == y.entries.len()
                && x.entries.iter().all(|(k, v)| {
                    y.entries.iter().any(|(k2, v2)| values_equal(vm, *k, *k2) && values_equal(vm, *v, *v2))
                })
        }
        _ => false,
    }
}
