//! Handler bytecode opcode table
//!
//! Each opcode has a fixed operand shape. The opcode word of an instruction
//! carries the opcode in its low 16 bits and the number of operand words
//! that follow in its high 16 bits.

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::fmt;

/// Shape of one operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    /// One word, two's-complement integer
    Int,
    /// Two words, high then low half of an f64
    Float,
    /// Length word plus packed bytes
    Str,
    /// One word, absolute word index into the handler's code
    Offset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Op {
    Stop = 0x00,
    Nop = 0x01,
    PushVoid = 0x02,
    PushInt = 0x03,
    PushFloat = 0x04,
    PushString = 0x05,
    PushSymbol = 0x06,
    PushVarRef = 0x07,
    PushCastRef = 0x08,
    Pop = 0x09,
    Dup = 0x0A,

    EvalVar = 0x10,
    Assign = 0x11,
    AssignGlobal = 0x12,
    DeclareGlobal = 0x13,
    DeclareProperty = 0x14,

    Add = 0x20,
    Sub = 0x21,
    Mul = 0x22,
    Div = 0x23,
    Mod = 0x24,
    Negate = 0x25,
    Concat = 0x26,

    Eq = 0x30,
    Ne = 0x31,
    Lt = 0x32,
    Gt = 0x33,
    Le = 0x34,
    Ge = 0x35,
    And = 0x36,
    Or = 0x37,
    Not = 0x38,

    Jump = 0x40,
    JumpIfFalse = 0x41,

    Call = 0x50,
    CallMethod = 0x51,
    Return = 0x52,

    MakeList = 0x60,
    MakePropList = 0x61,
    GetAt = 0x62,
    SetAt = 0x63,
    NewObject = 0x64,

    Host = 0x70,
    Print = 0x71,

    Delay = 0x78,
    Wait = 0x79,
}

pub const ALL_OPS: &[Op] = &[
    Op::Stop,
    Op::Nop,
    Op::PushVoid,
    Op::PushInt,
    Op::PushFloat,
    Op::PushString,
    Op::PushSymbol,
    Op::PushVarRef,
    Op::PushCastRef,
    Op::Pop,
    Op::Dup,
    Op::EvalVar,
    Op::Assign,
    Op::AssignGlobal,
    Op::DeclareGlobal,
    Op::DeclareProperty,
    Op::Add,
    Op::Sub,
    Op::Mul,
    Op::Div,
    Op::Mod,
    Op::Negate,
    Op::Concat,
    Op::Eq,
    Op::Ne,
    Op::Lt,
    Op::Gt,
    Op::Le,
    Op::Ge,
    Op::And,
    Op::Or,
    Op::Not,
    Op::Jump,
    Op::JumpIfFalse,
    Op::Call,
    Op::CallMethod,
    Op::Return,
    Op::MakeList,
    Op::MakePropList,
    Op::GetAt,
    Op::SetAt,
    Op::NewObject,
    Op::Host,
    Op::Print,
    Op::Delay,
    Op::Wait,
];

lazy_static! {
    static ref BY_MNEMONIC: HashMap<&'static str, Op> =
        ALL_OPS.iter().map(|op| (op.mnemonic(), *op)).collect();
    static ref BY_CODE: HashMap<u16, Op> = ALL_OPS.iter().map(|op| (op.code(), *op)).collect();
}

impl Op {
    pub fn from_code(code: u16) -> Option<Op> {
        BY_CODE.get(&code).copied()
    }

    pub fn from_mnemonic(name: &str) -> Option<Op> {
        BY_MNEMONIC.get(name).copied()
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Op::Stop => "stop",
            Op::Nop => "nop",
            Op::PushVoid => "pushvoid",
            Op::PushInt => "pushint",
            Op::PushFloat => "pushfloat",
            Op::PushString => "pushstr",
            Op::PushSymbol => "pushsym",
            Op::PushVarRef => "pushvarref",
            Op::PushCastRef => "pushcastref",
            Op::Pop => "pop",
            Op::Dup => "dup",
            Op::EvalVar => "eval",
            Op::Assign => "assign",
            Op::AssignGlobal => "assignglobal",
            Op::DeclareGlobal => "global",
            Op::DeclareProperty => "property",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Mod => "mod",
            Op::Negate => "neg",
            Op::Concat => "concat",
            Op::Eq => "eq",
            Op::Ne => "ne",
            Op::Lt => "lt",
            Op::Gt => "gt",
            Op::Le => "le",
            Op::Ge => "ge",
            Op::And => "and",
            Op::Or => "or",
            Op::Not => "not",
            Op::Jump => "jump",
            Op::JumpIfFalse => "jumpifnot",
            Op::Call => "call",
            Op::CallMethod => "callmethod",
            Op::Return => "return",
            Op::MakeList => "list",
            Op::MakePropList => "proplist",
            Op::GetAt => "getat",
            Op::SetAt => "setat",
            Op::NewObject => "new",
            Op::Host => "host",
            Op::Print => "print",
            Op::Delay => "delay",
            Op::Wait => "wait",
        }
    }

    pub fn operands(self) -> &'static [OperandKind] {
        use OperandKind::*;
        match self {
            Op::PushInt | Op::PushCastRef | Op::MakeList | Op::MakePropList => &[Int],
            Op::PushFloat => &[Float],
            Op::PushString
            | Op::PushSymbol
            | Op::PushVarRef
            | Op::EvalVar
            | Op::Assign
            | Op::AssignGlobal
            | Op::DeclareGlobal
            | Op::DeclareProperty
            | Op::NewObject => &[Str],
            Op::Jump | Op::JumpIfFalse => &[Offset],
            Op::Call | Op::CallMethod => &[Str, Int],
            Op::Host => &[Int, Int],
            _ => &[],
        }
    }

    /// Instructions after which control never falls through
    pub fn ends_block(self) -> bool {
        matches!(self, Op::Stop | Op::Return | Op::Jump)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

/// Pack an opcode and its operand word count into an opcode word
pub fn opcode_word(code: u16, operand_words: usize) -> u32 {
    ((operand_words as u32) << 16) | code as u32
}

/// Split an opcode word into (opcode, operand word count)
pub fn split_opcode_word(word: u32) -> (u16, usize) {
    ((word & 0xFFFF) as u16, (word >> 16) as usize)
}
