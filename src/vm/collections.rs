//! Array/map/string aggregate opcodes (spec.md §4.5.3).

use crate::errors::ApeError;
use crate::heap::{hash_key, MapObj, ObjData, ObjKind, StringObj};
use crate::value::Value;

use super::compare::values_equal;
use super::Vm;

pub fn mk_array(vm: &mut Vm, n: u16) -> Result<(), ApeError> {
    let n = n as usize;
    let mut items = Vec::with_capacity(n);
    for _ in 0..n {
        items.push(vm.pop());
    }
    items.reverse();
    let id = vm.heap_mut().allocate(ObjData::Array(items));
    vm.push(Value::Heap(id))
}

pub fn map_start(_vm: &mut Vm, _n: u16) -> Result<(), ApeError> {
    // Sentinel only: MAPEND does the actual gather, matching how the
    // compiler emits it purely as a bracket around the key/value pairs.
    Ok(())
}

pub fn map_end(vm: &mut Vm, n: u16) -> Result<(), ApeError> {
    let count = n as usize * 2;
    let mut flat = Vec::with_capacity(count);
    for _ in 0..count {
        flat.push(vm.pop());
    }
    flat.reverse();
    let mut map = MapObj::default();
    for pair in flat.chunks(2) {
        let (key, value) = (pair[0], pair[1]);
        let Some(hash) = hash_key(vm.heap(), &key) else {
            return Err(vm.runtime_error(format!("{} is not a hashable map key", key.type_name())));
        };
        if let Some(idx) = map.find(hash, |existing| values_equal(vm, *existing, key)) {
            map.insert_at(idx, value);
        } else {
            map.push(hash, key, value);
        }
    }
    let id = vm.heap_mut().allocate(ObjData::Map(map));
    vm.push(Value::Heap(id))
}

/// Resolves a possibly-negative array/string index against `len`. Returns
/// `None` when the resolved position is still negative (out of range on the
/// low end).
fn resolve_index(i: i64, len: usize) -> Option<usize> {
    let resolved = if i < 0 { i + len as i64 } else { i };
    if resolved < 0 {
        None
    } else {
        Some(resolved as usize)
    }
}

pub fn get_index(vm: &mut Vm) -> Result<(), ApeError> {
    let index = vm.pop();
    let collection = vm.pop();
    let Value::Heap(id) = collection else {
        return Err(vm.runtime_error(format!("cannot index a value of type {}", collection.type_name())));
    };
    match vm.heap().kind_of(id) {
        ObjKind::Array => {
            let Some(i) = index.as_i64_truncated() else {
                return Err(vm.runtime_error("array index must be a number"));
            };
            let value = match vm.heap().get(id) {
                ObjData::Array(items) => resolve_index(i, items.len()).and_then(|idx| items.get(idx).copied()),
                _ => unreachable!(),
            }
            .unwrap_or(Value::Null);
            vm.push(value)
        }
        ObjKind::Map => {
            let Some(hash) = hash_key(vm.heap(), &index) else {
                return Err(vm.runtime_error(format!("{} is not a hashable map key", index.type_name())));
            };
            let value = match vm.heap().get(id) {
                ObjData::Map(m) => m.find(hash, |k| values_equal(vm, *k, index)).map(|idx| m.entries[idx].1),
                _ => unreachable!(),
            }
            .unwrap_or(Value::Null);
            vm.push(value)
        }
        ObjKind::String => {
            let Some(i) = index.as_i64_truncated() else {
                return Err(vm.runtime_error("string index must be a number"));
            };
            let byte = match vm.heap().get(id) {
                ObjData::String(s) => {
                    let bytes = s.bytes.as_bytes();
                    resolve_index(i, bytes.len()).and_then(|idx| bytes.get(idx).copied())
                }
                _ => unreachable!(),
            };
            match byte {
                Some(b) => {
                    let owned = String::from_utf8_lossy(&[b]).into_owned();
                    let new_id = vm.heap_mut().allocate(ObjData::String(StringObj::new(owned)));
                    vm.push(Value::Heap(new_id))
                }
                None => vm.push(Value::Null),
            }
        }
        _ => Err(vm.runtime_error(format!("cannot index a value of type {}", collection.type_name()))),
    }
}

pub fn set_index(vm: &mut Vm) -> Result<(), ApeError> {
    let value = vm.pop();
    let index = vm.pop();
    let collection = vm.pop();
    let Value::Heap(id) = collection else {
        return Err(vm.runtime_error(format!("cannot index-assign a value of type {}", collection.type_name())));
    };
    match vm.heap().kind_of(id) {
        ObjKind::Array => {
            let Some(i) = index.as_i64_truncated() else {
                return Err(vm.runtime_error("array index must be a number"));
            };
            let len = match vm.heap().get(id) {
                ObjData::Array(items) => items.len(),
                _ => unreachable!(),
            };
            let Some(resolved) = resolve_index(i, len) else {
                return Err(vm.runtime_error("array index out of range"));
            };
            match vm.heap_mut().get_mut(id) {
                ObjData::Array(items) => {
                    if resolved >= items.len() {
                        items.resize(resolved + 1, Value::Null);
                    }
                    items[resolved] = value;
                }
                _ => unreachable!(),
            }
            vm.push(value)
        }
        ObjKind::Map => {
            let Some(hash) = hash_key(vm.heap(), &index) else {
                return Err(vm.runtime_error(format!("{} is not a hashable map key", index.type_name())));
            };
            let existing = match vm.heap().get(id) {
                ObjData::Map(m) => m.find(hash, |k| values_equal(vm, *k, index)),
                _ => unreachable!(),
            };
            match vm.heap_mut().get_mut(id) {
                ObjData::Map(m) => match existing {
                    Some(idx) => m.insert_at(idx, value),
                    None => m.push(hash, index, value),
                },
                _ => unreachable!(),
            }
            vm.push(value)
        }
        _ => Err(vm.runtime_error(format!("cannot index-assign a value of type {}", collection.type_name()))),
    }
}

pub fn len(vm: &mut Vm) -> Result<(), ApeError> {
    let v = vm.pop();
    let n = match v {
        Value::Heap(id) => match vm.heap().get(id) {
            ObjData::String(s) => Some(s.bytes.as_bytes().len()),
            ObjData::Array(a) => Some(a.len()),
            ObjData::Map(m) => Some(m.entries.len()),
            _ => None,
        },
        _ => None,
    };
    match n {
        Some(n) => vm.push(Value::Float(n as f64)),
        None => Err(vm.runtime_error(format!("{} has no length", v.type_name()))),
    }
}

/// `GETVALUEAT`: "array-like at(i)", used by `for...in` lowering. Arrays and
/// strings yield the element/byte at position `i`; maps yield the i-th
/// *key* in insertion order, since `for (k in map)` binds the key.
pub fn get_value_at(vm: &mut Vm) -> Result<(), ApeError> {
    let index = vm.pop();
    let collection = vm.pop();
    let Some(i) = index.as_i64_truncated().filter(|&i| i >= 0) else {
        return Err(vm.runtime_error("GETVALUEAT index must be a non-negative number"));
    };
    let i = i as usize;
    let Value::Heap(id) = collection else {
        return Err(vm.runtime_error(format!("cannot iterate a value of type {}", collection.type_name())));
    };
    match vm.heap().kind_of(id) {
        ObjKind::Array => {
            let value = match vm.heap().get(id) {
                ObjData::Array(items) => items.get(i).copied(),
                _ => unreachable!(),
            }
            .unwrap_or(Value::Null);
            vm.push(value)
        }
        ObjKind::Map => {
            let value = match vm.heap().get(id) {
                ObjData::Map(m) => m.entries.get(i).map(|(k, _)| *k),
                _ => unreachable!(),
            }
            .unwrap_or(Value::Null);
            vm.push(value)
        }
        ObjKind::String => {
            let byte = match vm.heap().get(id) {
                ObjData::String(s) => s.bytes.as_bytes().get(i).copied(),
                _ => unreachable!(),
            };
            match byte {
                Some(b) => {
                    let owned = String::from_utf8_lossy(&[b]).into_owned();
                    let new_id = vm.heap_mut().allocate(ObjData::String(StringObj::new(owned)));
                    vm.push(Value::Heap(new_id))
                }
                None => vm.push(Value::Null),
            }
        }
        _ => Err(vm.runtime_error(format!("cannot iterate a value of type {}", collection.type_name()))),
    }
}
