//! Opcodes (spec.md §4.4.1/§4.5.3). Instructions are a stream of 16-bit
//! words: one word for the opcode, then a fixed number of 16-bit operand
//! words per opcode. Grounded on `ouros/src/bytecode/op.rs`'s opcode-table
//! shape, renamed to this language's opcode set.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Op {
    Constant,
    Dup,
    Pop,
    Null,
    True,
    False,
    MkNumber,

    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Minus,
    Not,

    BitOr,
    BitXor,
    BitAnd,
    LeftShift,
    RightShift,

    ComparePlain,
    CompareEqual,
    IsEqual,
    NotEqual,
    GreaterThan,
    GreaterEqual,

    MkArray,
    MapStart,
    MapEnd,
    GetIndex,
    SetIndex,
    Len,
    GetValueAt,

    GetModuleGlobal,
    SetModuleGlobal,
    DefModuleGlobal,
    GetContextGlobal,
    GetLocal,
    DefLocal,
    SetLocal,
    GetFree,
    SetFree,
    GetThis,
    CurrentFunction,
    /// Pops the value stack, pushes onto the this-stack. Emitted around
    /// dot-calls so `GetThis` inside the callee sees the receiver
    /// (spec.md §4.5.4 leaves the exact mechanism unspecified).
    PushThis,
    /// Pops the this-stack, discarding the value. Paired with `PushThis`.
    PopThis,

    Jump,
    JumpIfTrue,
    JumpIfFalse,
    Call,
    ReturnValue,
    ReturnNothing,
    SetRecover,

    MkFunction,
}

impl Op {
    /// Number of 16-bit operand words following the opcode word.
    pub fn num_operands(self) -> usize {
        match self {
            Op::Constant => 1,
            Op::Dup | Op::Pop | Op::Null | Op::True | Op::False => 0,
            Op::MkNumber => 4,
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod | Op::Minus | Op::Not => 0,
            Op::BitOr | Op::BitXor | Op::BitAnd | Op::LeftShift | Op::RightShift => 0,
            Op::ComparePlain | Op::CompareEqual => 0,
            Op::IsEqual | Op::NotEqual | Op::GreaterThan | Op::GreaterEqual => 0,
            Op::MkArray => 1,
            Op::MapStart | Op::MapEnd => 1,
            Op::GetIndex | Op::SetIndex | Op::Len | Op::GetValueAt => 0,
            Op::GetModuleGlobal | Op::SetModuleGlobal | Op::DefModuleGlobal => 1,
            Op::GetContextGlobal => 1,
            Op::GetLocal | Op::DefLocal | Op::SetLocal => 1,
            Op::GetFree | Op::SetFree => 1,
            Op::GetThis | Op::CurrentFunction | Op::PushThis | Op::PopThis => 0,
            Op::Jump | Op::JumpIfTrue | Op::JumpIfFalse => 1,
            Op::Call => 1,
            Op::ReturnValue | Op::ReturnNothing => 0,
            Op::SetRecover => 1,
            Op::MkFunction => 2,
        }
    }

    /// Width in 16-bit words of the full instruction (opcode + operands).
    pub fn width(self) -> usize {
        1 + self.num_operands()
    }

    pub fn from_u16(raw: u16) -> Option<Op> {
        use Op::*;
        const TABLE: &[Op] = &[
            Constant, Dup, Pop, Null, True, False, MkNumber, Add, Sub, Mul, Div, Mod, Minus, Not,
            BitOr, BitXor, BitAnd, LeftShift, RightShift, ComparePlain, CompareEqual, IsEqual,
            NotEqual, GreaterThan, GreaterEqual, MkArray, MapStart, MapEnd, GetIndex, SetIndex,
            Len, GetValueAt, GetModuleGlobal, SetModuleGlobal, DefModuleGlobal, GetContextGlobal,
            GetLocal, DefLocal, SetLocal, GetFree, SetFree, GetThis, CurrentFunction, PushThis,
            PopThis, Jump, JumpIfTrue, JumpIfFalse, Call, ReturnValue, ReturnNothing, SetRecover,
            MkFunction,
        ];
        TABLE.get(raw as usize).copied()
    }
}
