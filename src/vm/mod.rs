//! The bytecode interpreter: fetch/decode/execute loop, call frames, and
//! the value/this stacks (spec.md §4.5). Grounded on `ouros/src/vm/mod.rs`'s
//! frame-stack shape; the calling convention (callee's own stack slot
//! becomes the new frame's implicit slot -1, base_pointer = sp - num_args)
//! follows the same book-standard design `ouros` itself uses.

mod binary;
mod call;
mod collections;
mod compare;

use std::rc::Rc;
use std::time::Instant;

use crate::bytecode::code::{CompilationUnit, FunctionId};
use crate::bytecode::op::Op;
use crate::errors::{ApeError, ErrorKind, ErrorList};
use crate::heap::{ErrorObj, Heap, HeapId, ObjData};
use crate::position::SourcePosition;
use crate::resource::ExecutionConfig;
use crate::value::{NativeFnId, Value};

pub type NativeFn = dyn Fn(&mut Vm, &[Value]) -> Result<Value, ApeError>;

struct Frame {
    function_id: Option<FunctionId>,
    closure: Option<HeapId>,
    ip: usize,
    base_pointer: usize,
    recover_ip: Option<usize>,
    /// `this_stack` height when this frame was entered. A dot-call's
    /// `PushThis` (emitted in the *caller's* frame, around `CALL`) only
    /// gets its matching `PopThis` once that call returns normally; if the
    /// callee faults, abandoning this frame during `recover` unwinding must
    /// restore `this_stack` to this height or the receiver leaks onto it
    /// permanently (spec.md §8 invariant 5).
    this_base: usize,
}

/// A single "ran out of budget" condition distinct from a scripted
/// `ApeError`: the VM stops immediately rather than trying recover/retry.
pub enum StopReason {
    Timeout,
}

pub struct Vm<'u> {
    unit: &'u CompilationUnit,
    heap: Heap,
    globals: Vec<Value>,
    stack: Vec<Value>,
    this_stack: Vec<Value>,
    frames: Vec<Frame>,
    natives: Vec<Rc<NativeFn>>,
    config: ExecutionConfig,
    errors: ErrorList,
    last_popped: Value,
    started_at: Option<Instant>,
    instructions_since_timeout_check: u32,
}

impl<'u> Vm<'u> {
    pub fn new(unit: &'u CompilationUnit, config: ExecutionConfig) -> Self {
        let heap = Heap::new(config.gc_threshold);
        Self {
            unit,
            heap,
            globals: vec![Value::Null; unit.num_module_globals as usize],
            stack: Vec::with_capacity(config.stack_size.min(256)),
            this_stack: Vec::new(),
            frames: vec![Frame { function_id: None, closure: None, ip: 0, base_pointer: 0, recover_ip: None, this_base: 0 }],
            natives: Vec::new(),
            config,
            errors: ErrorList::new(),
            last_popped: Value::Null,
            started_at: None,
            instructions_since_timeout_check: 0,
        }
    }

    pub fn register_native(&mut self, f: Rc<NativeFn>) -> NativeFnId {
        let id = NativeFnId(self.natives.len() as u32);
        self.natives.push(f);
        id
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn get_global(&self, index: u16) -> Option<Value> {
        self.globals.get(index as usize).copied()
    }

    pub fn set_global(&mut self, index: u16, value: Value) {
        if let Some(slot) = self.globals.get_mut(index as usize) {
            *slot = value;
        }
    }

    pub fn push(&mut self, value: Value) -> Result<(), ApeError> {
        if self.stack.len() >= self.config.stack_size {
            return Err(self.runtime_error("stack overflow"));
        }
        self.stack.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Value {
        let v = self.stack.pop().expect("operand stack underflow: malformed bytecode");
        self.last_popped = v;
        v
    }

    /// The most recently popped value, exposed to the host after `run`
    /// returns (spec.md glossary "last popped" — used to surface a bare
    /// top-level expression's value without an explicit `return`).
    pub fn last_popped(&self) -> Value {
        self.last_popped
    }

    fn current_frame(&self) -> &Frame {
        self.frames.last().expect("frame stack is never empty")
    }

    fn current_frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("frame stack is never empty")
    }

    fn current_code(&self) -> &'u crate::bytecode::code::Code {
        match self.current_frame().function_id {
            Some(id) => &self.unit.function(id).code,
            None => &self.unit.main,
        }
    }

    fn current_position(&self) -> SourcePosition {
        let code = self.current_code();
        let ip = self.current_frame().ip.min(code.positions.len().saturating_sub(1));
        code.positions.get(ip).cloned().unwrap_or_else(|| code.positions[0].clone())
    }

    pub fn runtime_error(&self, message: impl Into<String>) -> ApeError {
        ApeError::new(ErrorKind::Runtime, message.into(), self.current_position())
    }

    pub fn errors(&self) -> &ErrorList {
        &self.errors
    }

    /// Runs from the module's top-level code until it returns (falls off
    /// the end, or executes an explicit `return`). Re-entrant: calling
    /// `run` again continues from wherever the frame stack left off, which
    /// a host uses to drive multiple top-level statements against one
    /// persistent context (spec.md §6).
    pub fn run(&mut self) -> Result<Value, ApeError> {
        self.started_at = Some(Instant::now());
        let base_frame_depth = self.frames.len();
        loop {
            if self.frames.len() < base_frame_depth {
                return Ok(self.last_popped);
            }
            match self.step() {
                Ok(true) => continue,
                Ok(false) => return Ok(self.last_popped),
                Err(err) => match self.unwind_to_handler(err.clone()) {
                    Some(()) => continue,
                    None => return Err(err),
                },
            }
        }
    }

    /// Executes exactly one instruction. Returns `Ok(false)` when the
    /// outermost frame has finished (nothing left to do).
    fn step(&mut self) -> Result<bool, ApeError> {
        self.check_timeout()?;

        // Borrowed from `self.unit: &'u CompilationUnit`, not from `self`
        // itself, so this coexists with the `&mut self` calls below.
        let code = self.current_code();

        let ip = self.current_frame().ip;
        if ip >= code.instructions.len() {
            if self.frames.len() == 1 {
                return Ok(false);
            }
            self.do_return(Value::Null)?;
            return Ok(true);
        }

        let raw = code.instructions[ip];
        let op = Op::from_u16(raw).ok_or_else(|| self.runtime_error("malformed opcode word"))?;
        let operand_base = ip + 1;
        let operands = &code.instructions[operand_base..operand_base + op.num_operands()];
        self.current_frame_mut().ip = ip + op.width();

        self.execute(op, operands)?;
        Ok(true)
    }

    fn check_timeout(&mut self) -> Result<(), ApeError> {
        let Some(budget) = self.config.max_execution_time else { return Ok(()) };
        self.instructions_since_timeout_check += 1;
        if self.instructions_since_timeout_check < self.config.timeout_check_interval {
            return Ok(());
        }
        self.instructions_since_timeout_check = 0;
        let elapsed = self.started_at.map(|t| t.elapsed()).unwrap_or_default();
        if elapsed >= budget {
            return Err(ApeError::new(ErrorKind::Timeout, "execution timed out".to_string(), self.current_position()));
        }
        Ok(())
    }

    fn execute(&mut self, op: Op, operands: &[u16]) -> Result<(), ApeError> {
        match op {
            Op::Constant => {
                let value = self.load_constant(operands[0]);
                self.push(value)
            }
            Op::Dup => {
                let top = *self.stack.last().expect("DUP on empty stack");
                self.push(top)
            }
            Op::Pop => {
                self.pop();
                Ok(())
            }
            Op::Null => self.push(Value::Null),
            Op::True => self.push(Value::Bool(true)),
            Op::False => self.push(Value::Bool(false)),
            Op::MkNumber => {
                let bits = (operands[0] as u64) << 48 | (operands[1] as u64) << 32 | (operands[2] as u64) << 16 | (operands[3] as u64);
                self.push(Value::Float(f64::from_bits(bits)))
            }

            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod | Op::BitAnd | Op::BitOr | Op::BitXor | Op::LeftShift | Op::RightShift => {
                binary::exec(self, op)
            }
            Op::Minus | Op::Not => binary::exec_unary(self, op),

            Op::ComparePlain | Op::CompareEqual | Op::IsEqual | Op::NotEqual | Op::GreaterThan | Op::GreaterEqual => {
                compare::exec(self, op)
            }

            Op::MkArray => collections::mk_array(self, operands[0]),
            Op::MapStart => collections::map_start(self, operands[0]),
            Op::MapEnd => collections::map_end(self, operands[0]),
            Op::GetIndex => collections::get_index(self),
            Op::SetIndex => collections::set_index(self),
            Op::Len => collections::len(self),
            Op::GetValueAt => collections::get_value_at(self),

            Op::GetModuleGlobal | Op::GetContextGlobal => {
                let v = self.get_global(operands[0]).unwrap_or(Value::Null);
                self.push(v)
            }
            Op::SetModuleGlobal | Op::DefModuleGlobal => {
                let v = self.pop();
                self.set_global(operands[0], v);
                Ok(())
            }
            Op::GetLocal => {
                let idx = self.current_frame().base_pointer + operands[0] as usize;
                let v = self.stack[idx];
                self.push(v)
            }
            Op::SetLocal | Op::DefLocal => {
                let idx = self.current_frame().base_pointer + operands[0] as usize;
                let v = self.pop();
                self.stack[idx] = v;
                Ok(())
            }
            Op::GetFree => call::get_free(self, operands[0]),
            Op::SetFree => call::set_free(self, operands[0]),
            Op::GetThis => {
                let v = *self.this_stack.last().unwrap_or(&Value::Null);
                self.push(v)
            }
            Op::CurrentFunction => {
                let v = self.current_frame().closure.map(Value::Heap).unwrap_or(Value::Null);
                self.push(v)
            }
            Op::PushThis => {
                let v = self.pop();
                self.this_stack.push(v);
                Ok(())
            }
            Op::PopThis => {
                self.this_stack.pop();
                Ok(())
            }

            Op::Jump => {
                self.current_frame_mut().ip = operands[0] as usize;
                Ok(())
            }
            Op::JumpIfTrue => {
                let v = self.pop();
                if v.is_truthy() {
                    self.current_frame_mut().ip = operands[0] as usize;
                }
                Ok(())
            }
            Op::JumpIfFalse => {
                let v = self.pop();
                if !v.is_truthy() {
                    self.current_frame_mut().ip = operands[0] as usize;
                }
                Ok(())
            }
            Op::Call => call::call(self, operands[0]),
            Op::ReturnValue => {
                let v = self.pop();
                self.do_return(v)
            }
            Op::ReturnNothing => self.do_return(Value::Null),
            Op::SetRecover => {
                self.current_frame_mut().recover_ip = Some(operands[0] as usize);
                Ok(())
            }
            Op::MkFunction => call::mk_function(self, operands[0], operands[1]),
        }
    }

    fn do_return(&mut self, value: Value) -> Result<(), ApeError> {
        let frame = self.frames.pop().expect("RETURN with no active frame");
        self.stack.truncate(frame.base_pointer.saturating_sub(1));
        if self.frames.is_empty() {
            // Returning from the outermost (module) frame: there is no
            // caller left to consume a pushed value, so record it directly
            // instead of leaving it stranded on an otherwise-empty stack
            // (spec.md §8 invariant 5: sp == 0 after a successful run).
            self.last_popped = value;
        } else {
            self.push(value)?;
        }
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        Ok(())
    }

    /// Materializes a `CONSTANT` pool entry as a `Value`. String constants
    /// allocate a fresh heap string object on every execution rather than
    /// being interned once — simplest correct behavior, and matches the
    /// copy-on-read semantics of an immutable string literal; a repeatedly
    /// executed loop body pays one allocation per iteration, reclaimed by
    /// the ordinary GC like any other string.
    fn load_constant(&mut self, index: u16) -> Value {
        let bytes = match self.unit.constant(index) {
            crate::bytecode::code::Constant::Str(s) => s.to_string(),
            crate::bytecode::code::Constant::Function(_) => {
                unreachable!("MKFUNCTION handles function constants, not CONSTANT")
            }
        };
        let id = self.heap.allocate(ObjData::String(crate::heap::StringObj::new(bytes)));
        Value::Heap(id)
    }

    /// Unwinds the frame stack looking for a `recover` handler, starting
    /// at the frame that raised `error`. Returns `Some(())` if a handler
    /// was found and execution should resume; `None` if the error should
    /// propagate out of `run` entirely.
    fn unwind_to_handler(&mut self, error: ApeError) -> Option<()> {
        loop {
            let frame = self.frames.last()?;
            if frame.recover_ip.is_some() {
                let base_pointer = frame.base_pointer;
                let this_base = frame.this_base;
                // The local-slot region (params + locals, pre-filled with
                // null at CALL) was live when the fault hit mid-expression,
                // so it must be rebuilt before DEFLOCAL for the bound error
                // name can write into its slot — truncating to just
                // `base_pointer` would leave that slot out of bounds.
                let num_locals = match frame.function_id {
                    Some(id) => self.unit.function(id).num_locals as usize,
                    None => 0,
                };
                let frame = self.frames.last_mut().unwrap();
                let handler_ip = frame.recover_ip.take().unwrap();
                frame.ip = handler_ip;
                self.stack.truncate(base_pointer);
                self.stack.resize(base_pointer + num_locals, Value::Null);
                // A dot-call's `PushThis` has no matching `PopThis` if its
                // CALL never returned normally; drop whatever it left behind.
                self.this_stack.truncate(this_base);
                // Recorded even though execution continues, so a host can
                // enumerate every fault a script hit via `recover`, not just
                // the one that ultimately escaped `run` (spec.md §6).
                self.errors.push(error.clone());
                let error_value = self.wrap_error(error);
                self.stack.push(error_value);
                return Some(());
            }
            let base_pointer = frame.base_pointer;
            let this_base = frame.this_base;
            self.frames.pop();
            self.stack.truncate(base_pointer.saturating_sub(1));
            self.this_stack.truncate(this_base);
            if self.frames.is_empty() {
                return None;
            }
        }
    }

    fn wrap_error(&mut self, error: ApeError) -> Value {
        let id = self.heap.allocate(ObjData::Error(ErrorObj { inner: error }));
        Value::Heap(id)
    }

    pub fn collect_garbage(&mut self) {
        let mut roots: Vec<Value> = Vec::new();
        roots.extend_from_slice(&self.stack);
        roots.extend_from_slice(&self.this_stack);
        roots.extend_from_slice(&self.globals);
        for frame in &self.frames {
            if let Some(id) = frame.closure {
                roots.push(Value::Heap(id));
            }
        }
        roots.push(self.last_popped);
        self.heap.collect(roots);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compiler::{self, CompilerConfig};

    /// Testable property 5: a successful run leaves both stacks empty.
    #[test]
    fn stacks_are_empty_after_a_successful_run() {
        let unit = compiler::compile_source(
            "function adder(x) { return function(y) { return x + y; }; } const f = adder(10); return f(5);",
            "test.ape",
            CompilerConfig::default(),
            None,
            &[],
        )
        .unwrap();
        let mut vm = Vm::new(&unit, ExecutionConfig::default());
        let result = vm.run().unwrap();
        assert_eq!(result.as_f64(), Some(15.0));
        assert_eq!(vm.stack.len(), 0);
        assert_eq!(vm.this_stack.len(), 0);
    }

    /// Regression test: a dot-call (`recv.method()`) pushes its receiver onto
    /// `this_stack` before `CALL` and only pops it after `CALL` returns
    /// normally. If the callee faults, that `PopThis` never runs; unwinding
    /// to an ancestor `recover` must still restore `this_stack` to what it
    /// was before the dot-call, or the receiver leaks permanently.
    #[test]
    fn this_stack_does_not_leak_when_a_dot_call_faults_under_recover() {
        let unit = compiler::compile_source(
            "function f() { var a = [1,2,3]; recover (e) { return e; } a.bogus(); } return f();",
            "test.ape",
            CompilerConfig::default(),
            None,
            &[],
        )
        .unwrap();
        let mut vm = Vm::new(&unit, ExecutionConfig::default());
        vm.run().unwrap();
        assert_eq!(vm.stack.len(), 0);
        assert_eq!(vm.this_stack.len(), 0);
    }

    #[test]
    fn stacks_are_empty_after_a_recovered_error() {
        let unit = compiler::compile_source(
            "function f() { recover (e) { return e; } 1/0; } return f();",
            "test.ape",
            CompilerConfig::default(),
            None,
            &[],
        )
        .unwrap();
        let mut vm = Vm::new(&unit, ExecutionConfig::default());
        vm.run().unwrap();
        assert_eq!(vm.stack.len(), 0);
        assert_eq!(vm.this_stack.len(), 0);
        assert_eq!(vm.errors().len(), 1);
    }
}
