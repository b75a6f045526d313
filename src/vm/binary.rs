//! Arithmetic, bitwise/shift, and unary opcodes (spec.md §4.5.3).

use crate::bytecode::op::Op;
use crate::errors::ApeError;
use crate::heap::{ObjData, StringObj};
use crate::value::Value;

use super::Vm;

fn string_contents(vm: &Vm, v: Value) -> Option<String> {
    if let Value::Heap(id) = v {
        if let ObjData::String(s) = vm.heap().get(id) {
            return Some(s.bytes.clone());
        }
    }
    None
}

pub fn exec(vm: &mut Vm, op: Op) -> Result<(), ApeError> {
    let b = vm.pop();
    let a = vm.pop();
    match op {
        Op::Add => add(vm, a, b),
        Op::Sub => numeric(vm, a, b, "subtract", |x, y| x - y),
        Op::Mul => numeric(vm, a, b, "multiply", |x, y| x * y),
        Op::Div => divide(vm, a, b),
        Op::Mod => modulus(vm, a, b),
        Op::BitAnd => integral(vm, a, b, |x, y| x & y),
        Op::BitOr => integral(vm, a, b, |x, y| x | y),
        Op::BitXor => integral(vm, a, b, |x, y| x ^ y),
        Op::LeftShift => integral(vm, a, b, |x, y| x.wrapping_shl((y & 63) as u32)),
        Op::RightShift => integral(vm, a, b, |x, y| x.wrapping_shr((y & 63) as u32)),
        _ => unreachable!("binary::exec called with non-binary opcode {op:?}"),
    }
}

fn add(vm: &mut Vm, a: Value, b: Value) -> Result<(), ApeError> {
    if a.is_number() && b.is_number() {
        return vm.push(Value::Float(a.as_f64().unwrap() + b.as_f64().unwrap()));
    }
    if let (Some(sa), Some(sb)) = (string_contents(vm, a), string_contents(vm, b)) {
        let joined = sa + &sb;
        let id = vm.heap_mut().allocate(ObjData::String(StringObj::new(joined)));
        return vm.push(Value::Heap(id));
    }
    Err(vm.runtime_error(format!("cannot add {} and {}", a.type_name(), b.type_name())))
}

fn numeric(vm: &mut Vm, a: Value, b: Value, verb: &str, f: impl Fn(f64, f64) -> f64) -> Result<(), ApeError> {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => vm.push(Value::Float(f(x, y))),
        _ => Err(vm.runtime_error(format!("cannot {verb} {} and {}", a.type_name(), b.type_name()))),
    }
}

fn divide(vm: &mut Vm, a: Value, b: Value) -> Result<(), ApeError> {
    if !a.is_number() || !b.is_number() {
        return Err(vm.runtime_error(format!("cannot divide {} and {}", a.type_name(), b.type_name())));
    }
    let y = b.as_f64().unwrap();
    if y == 0.0 {
        return Err(vm.runtime_error("division by zero"));
    }
    vm.push(Value::Float(a.as_f64().unwrap() / y))
}

fn modulus(vm: &mut Vm, a: Value, b: Value) -> Result<(), ApeError> {
    if !a.is_number() || !b.is_number() {
        return Err(vm.runtime_error(format!("cannot modulus {} and {}", a.type_name(), b.type_name())));
    }
    let y = b.as_i64_truncated().unwrap();
    if y == 0 {
        return Err(vm.runtime_error("division by zero"));
    }
    let x = a.as_i64_truncated().unwrap();
    vm.push(Value::Float((x % y) as f64))
}

fn integral(vm: &mut Vm, a: Value, b: Value, f: impl Fn(i64, i64) -> i64) -> Result<(), ApeError> {
    match (a.as_i64_truncated(), b.as_i64_truncated()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => vm.push(Value::Float(f(x, y) as f64)),
        _ => Err(vm.runtime_error(format!("cannot apply a bitwise operator to {} and {}", a.type_name(), b.type_name()))),
    }
}

pub fn exec_unary(vm: &mut Vm, op: Op) -> Result<(), ApeError> {
    let a = vm.pop();
    match op {
        Op::Minus => match a.as_f64() {
            Some(n) if a.is_number() => vm.push(Value::Float(-n)),
            _ => Err(vm.runtime_error(format!("cannot negate {}", a.type_name()))),
        },
        Op::Not => vm.push(Value::Bool(!a.is_truthy())),
        _ => unreachable!("binary::exec_unary called with non-unary opcode {op:?}"),
    }
}
