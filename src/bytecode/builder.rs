//! Per-function-body code builder: emit, forward-jump back-patching, and
//! the last-opcode/break-continue bookkeeping the compiler needs for
//! control-flow lowering (spec.md §3 "Compilation scope", §4.4.3).
//! Grounded on `ouros/src/bytecode/builder.rs`'s `CodeBuilder::emit`/
//! `patch_jump` shape.

use crate::bytecode::code::Code;
use crate::bytecode::op::Op;
use crate::position::SourcePosition;

/// One active loop: `continue` jumps straight to `continue_ip` (known as
/// soon as the loop header is emitted); `break` sites aren't known until
/// the loop's end IP is reached, so they're collected and patched as a
/// batch when the loop is exited.
struct LoopCtx {
    continue_ip: usize,
    break_sites: Vec<usize>,
}

pub struct CodeBuilder {
    code: Code,
    last_op: Option<Op>,
    loops: Vec<LoopCtx>,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self { code: Code::default(), last_op: None, loops: Vec::new() }
    }

    /// Current instruction pointer, in words — the offset the next `emit`
    /// call will write to.
    pub fn ip(&self) -> usize {
        self.code.instructions.len()
    }

    pub fn last_op(&self) -> Option<Op> {
        self.last_op
    }

    /// Writes the opcode word followed by `operands`, all tagged with
    /// `position`, and returns the IP of the opcode word (useful for
    /// later back-patching).
    pub fn emit(&mut self, op: Op, operands: &[u16], position: &SourcePosition) -> usize {
        debug_assert_eq!(operands.len(), op.num_operands());
        let ip = self.ip();
        self.code.instructions.push(op as u16);
        self.code.positions.push(position.clone());
        for &operand in operands {
            self.code.instructions.push(operand);
            self.code.positions.push(position.clone());
        }
        self.last_op = Some(op);
        ip
    }

    /// Overwrites the single operand word of the jump instruction at `ip`
    /// with `target` (the jump's own opcode word is at `ip`; its operand
    /// word is at `ip + 1`).
    pub fn patch_jump(&mut self, ip: usize, target: usize) {
        self.code.instructions[ip + 1] = target as u16;
    }

    pub fn enter_loop(&mut self, continue_ip: usize) {
        self.loops.push(LoopCtx { continue_ip, break_sites: Vec::new() });
    }

    /// Patches every `break` site recorded since the matching `enter_loop`
    /// to jump to `end_ip` (the first instruction after the loop body).
    pub fn exit_loop(&mut self, end_ip: usize) {
        let ctx = self.loops.pop().expect("exit_loop without matching enter_loop");
        for ip in ctx.break_sites {
            self.patch_jump(ip, end_ip);
        }
    }

    pub fn current_continue_ip(&self) -> Option<usize> {
        self.loops.last().map(|l| l.continue_ip)
    }

    /// Records a `Jump` instruction (already emitted with a placeholder
    /// operand) at `ip` as a break site of the innermost loop. Returns
    /// `false` if there is no enclosing loop.
    pub fn record_break(&mut self, ip: usize) -> bool {
        match self.loops.last_mut() {
            Some(ctx) => {
                ctx.break_sites.push(ip);
                true
            }
            None => false,
        }
    }

    pub fn finish(self) -> Code {
        self.code
    }

    /// Appends another function's already-finished code, rebasing its
    /// internal jump/recover targets by the splice point. Used to inline
    /// an included module's top-level code at its `include` site within
    /// the importing module's code (spec.md §4.4.5).
    pub fn splice(&mut self, code: Code) {
        let base = self.ip() as u16;
        let mut i = 0;
        while i < code.instructions.len() {
            let word = code.instructions[i];
            let op = Op::from_u16(word).expect("spliced code contains a malformed opcode word");
            self.code.instructions.push(word);
            self.code.positions.push(code.positions[i].clone());
            i += 1;
            for operand_index in 0..op.num_operands() {
                let operand = code.instructions[i];
                let is_target = operand_index == 0 && matches!(op, Op::Jump | Op::JumpIfTrue | Op::JumpIfFalse | Op::SetRecover);
                let adjusted = if is_target { operand.wrapping_add(base) } else { operand };
                self.code.instructions.push(adjusted);
                self.code.positions.push(code.positions[i].clone());
                i += 1;
            }
            self.last_op = Some(op);
        }
    }
}

impl Default for CodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
