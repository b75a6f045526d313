//! `CALL`, `MKFUNCTION`, and free-variable access (spec.md §4.5.1, §4.5.3).

use crate::bytecode::code::Constant;
use crate::errors::ApeError;
use crate::heap::{FunctionObj, ObjData};
use crate::value::Value;

use super::{Frame, Vm};

/// `CALL argc`: the callee sits below its `argc` arguments on the stack
/// (never popped by the caller) so the new frame's locals region starts
/// exactly where the arguments already are.
pub fn call(vm: &mut Vm, argc: u16) -> Result<(), ApeError> {
    let argc = argc as usize;
    if vm.stack.len() < argc + 1 {
        return Err(vm.runtime_error("CALL with fewer operands than its argument count: malformed bytecode"));
    }
    let callee_index = vm.stack.len() - argc - 1;
    let callee = vm.stack[callee_index];
    match callee {
        Value::Heap(id) => match vm.heap().get(id) {
            ObjData::Function(f) => {
                let (function_id, expected, num_locals) = (f.function_id, f.num_args as usize, f.num_locals as usize);
                if argc != expected {
                    return Err(vm.runtime_error(format!("wrong number of arguments: expected {expected}, got {argc}")));
                }
                if vm.frames.len() >= vm.config.max_frames {
                    return Err(vm.runtime_error("call stack overflow"));
                }
                let base_pointer = callee_index + 1;
                for _ in argc..num_locals {
                    vm.push(Value::Null)?;
                }
                let this_base = vm.this_stack.len();
                vm.frames.push(Frame { function_id: Some(function_id), closure: Some(id), ip: 0, base_pointer, recover_ip: None, this_base });
                Ok(())
            }
            _ => Err(vm.runtime_error(format!("{} is not callable", callee.type_name()))),
        },
        Value::Native(native_id) => {
            let native = vm.natives[native_id.0 as usize].clone();
            let args: Vec<Value> = vm.stack[callee_index + 1..].to_vec();
            let result = native(vm, &args)?;
            vm.stack.truncate(callee_index);
            vm.push(result)
        }
        _ => Err(vm.runtime_error(format!("{} is not callable", callee.type_name()))),
    }
}

/// `MKFUNCTION pool_idx num_free`: free variables were pushed in capture
/// order (one `GET*` per free symbol, per spec.md §4.4.2), so popping them
/// off yields reverse order — flip back before attaching to the closure.
pub fn mk_function(vm: &mut Vm, pool_idx: u16, num_free: u16) -> Result<(), ApeError> {
    let num_free = num_free as usize;
    let mut free_vars = Vec::with_capacity(num_free);
    for _ in 0..num_free {
        free_vars.push(vm.pop());
    }
    free_vars.reverse();
    let function_id = match vm.unit.constant(pool_idx) {
        Constant::Function(id) => *id,
        Constant::Str(_) => unreachable!("MKFUNCTION pool index must reference a function constant"),
    };
    let proto = vm.unit.function(function_id);
    let obj = FunctionObj { name: proto.name.clone(), function_id, num_locals: proto.num_locals, num_args: proto.num_params, free_vars };
    let id = vm.heap_mut().allocate(ObjData::Function(obj));
    vm.push(Value::Heap(id))
}

pub fn get_free(vm: &mut Vm, index: u16) -> Result<(), ApeError> {
    let closure_id = vm.current_frame().closure.expect("GETFREE outside of a closure frame");
    let value = match vm.heap().get(closure_id) {
        ObjData::Function(f) => f.free_vars[index as usize],
        _ => unreachable!("frame closure is always a script-function object"),
    };
    vm.push(value)
}

pub fn set_free(vm: &mut Vm, index: u16) -> Result<(), ApeError> {
    let closure_id = vm.current_frame().closure.expect("SETFREE outside of a closure frame");
    let value = vm.pop();
    match vm.heap_mut().get_mut(closure_id) {
        ObjData::Function(f) => f.free_vars[index as usize] = value,
        _ => unreachable!("frame closure is always a script-function object"),
    }
    Ok(())
}
