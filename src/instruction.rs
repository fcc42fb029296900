use crate::error::DecodeError;
use crate::opcodes::{opcode_word, split_opcode_word, Op, OperandKind};
use crate::operand::{
    decode_string, encode_string, float_to_words, int_to_word, word_to_int, words_to_float,
};
use std::fmt;

/// Decoded operand value
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Int(i32),
    Float(f64),
    Str(String),
    /// Absolute word index into the handler's code
    Offset(usize),
    /// Undecoded word of an unknown opcode
    Raw(u32),
}

/// The opcode of a decoded instruction. Unknown opcodes are kept so they
/// can be skipped and disassembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Known(Op),
    Unknown(u16),
}

impl Opcode {
    pub fn code(self) -> u16 {
        match self {
            Opcode::Known(op) => op.code(),
            Opcode::Unknown(code) => code,
        }
    }
}

/// A decoded handler instruction
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Word index of the opcode word
    pub offset: usize,
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
    /// Total size in words including the opcode word
    pub size: usize,
}

impl Instruction {
    /// Build an instruction for emission; offset and size are filled in by
    /// `encode`.
    pub fn new(op: Op, operands: Vec<Operand>) -> Self {
        Instruction {
            offset: 0,
            opcode: Opcode::Known(op),
            operands,
            size: 0,
        }
    }

    pub fn op(&self) -> Option<Op> {
        match self.opcode {
            Opcode::Known(op) => Some(op),
            Opcode::Unknown(_) => None,
        }
    }

    pub fn int_at(&self, index: usize) -> Option<i32> {
        match self.operands.get(index) {
            Some(Operand::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn float_at(&self, index: usize) -> Option<f64> {
        match self.operands.get(index) {
            Some(Operand::Float(f)) => Some(*f),
            _ => None,
        }
    }

    pub fn str_at(&self, index: usize) -> Option<&str> {
        match self.operands.get(index) {
            Some(Operand::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn offset_at(&self, index: usize) -> Option<usize> {
        match self.operands.get(index) {
            Some(Operand::Offset(o)) => Some(*o),
            _ => None,
        }
    }

    /// Decode the instruction whose opcode word is at `pc`
    pub fn decode(code: &[u32], pc: usize) -> Result<Self, DecodeError> {
        let word = *code.get(pc).ok_or(DecodeError::Truncated {
            offset: pc,
            needed: 1,
            available: 0,
        })?;
        let (opcode, declared) = split_opcode_word(word);
        let available = code.len() - pc - 1;
        if declared > available {
            return Err(DecodeError::Truncated {
                offset: pc,
                needed: declared,
                available,
            });
        }
        let body = &code[pc + 1..pc + 1 + declared];

        let op = match Op::from_code(opcode) {
            Some(op) => op,
            None => {
                return Ok(Instruction {
                    offset: pc,
                    opcode: Opcode::Unknown(opcode),
                    operands: body.iter().map(|w| Operand::Raw(*w)).collect(),
                    size: 1 + declared,
                })
            }
        };

        let mismatch = |expected: usize| DecodeError::OperandCountMismatch {
            offset: pc,
            opcode,
            declared,
            expected,
        };

        let mut operands = Vec::with_capacity(op.operands().len());
        let mut used = 0;
        for kind in op.operands() {
            match kind {
                OperandKind::Int | OperandKind::Offset => {
                    let w = *body.get(used).ok_or_else(|| mismatch(used + 1))?;
                    used += 1;
                    operands.push(if *kind == OperandKind::Int {
                        Operand::Int(word_to_int(w))
                    } else {
                        Operand::Offset(w as usize)
                    });
                }
                OperandKind::Float => {
                    if body.len() < used + 2 {
                        return Err(mismatch(used + 2));
                    }
                    operands.push(Operand::Float(words_to_float(body[used], body[used + 1])));
                    used += 2;
                }
                OperandKind::Str => {
                    let (text, consumed) = decode_string(&body[used..], pc + 1 + used)
                        .map_err(|e| match e {
                            DecodeError::Truncated { needed, .. } if used == body.len() => {
                                mismatch(used + needed)
                            }
                            DecodeError::Truncated { needed, .. } => mismatch(used + 1 + needed),
                            other => other,
                        })?;
                    used += consumed;
                    operands.push(Operand::Str(text));
                }
            }
        }
        if used != declared {
            return Err(mismatch(used));
        }

        Ok(Instruction {
            offset: pc,
            opcode: Opcode::Known(op),
            operands,
            size: 1 + declared,
        })
    }

    /// Decode every instruction of a handler body
    pub fn decode_all(code: &[u32]) -> Result<Vec<Self>, DecodeError> {
        let mut pc = 0;
        let mut out = Vec::new();
        while pc < code.len() {
            let inst = Instruction::decode(code, pc)?;
            pc += inst.size;
            out.push(inst);
        }
        Ok(out)
    }

    /// Append the encoded instruction to `out`
    pub fn encode(&self, out: &mut Vec<u32>) {
        let mut body = Vec::new();
        for operand in &self.operands {
            match operand {
                Operand::Int(i) => body.push(int_to_word(*i)),
                Operand::Float(f) => body.extend_from_slice(&float_to_words(*f)),
                Operand::Str(s) => encode_string(s, &mut body),
                Operand::Offset(o) => body.push(*o as u32),
                Operand::Raw(w) => body.push(*w),
            }
        }
        out.push(opcode_word(self.opcode.code(), body.len()));
        out.extend(body);
    }

    /// Encoded size in words
    pub fn encoded_len(&self) -> usize {
        let mut scratch = Vec::new();
        self.encode(&mut scratch);
        scratch.len()
    }

    pub fn format_operand(&self, index: usize) -> String {
        let quote_always = matches!(self.opcode, Opcode::Known(Op::PushString));
        match &self.operands[index] {
            Operand::Int(i) => i.to_string(),
            Operand::Float(f) => format!("{:?}", f),
            Operand::Str(s) if !quote_always && is_bare_name(s) => s.clone(),
            Operand::Str(s) => quote(s),
            Operand::Offset(o) => o.to_string(),
            Operand::Raw(w) => w.to_string(),
        }
    }

    pub fn mnemonic(&self) -> String {
        match self.opcode {
            Opcode::Known(op) => op.mnemonic().to_string(),
            Opcode::Unknown(code) => format!("raw {:#06x}", code),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.mnemonic())?;
        for i in 0..self.operands.len() {
            write!(f, " {}", self.format_operand(i))?;
        }
        Ok(())
    }
}

/// Names the assembler reads without quotes
pub fn is_bare_name(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Quote a string with the escapes the assembler understands
pub fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
