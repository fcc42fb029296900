//! Text front-end for handler bytecode
//!
//! Source is a list of handler blocks:
//!
//! ```text
//! -- greet the player
//! on greet who, times
//!   local i
//!   pushint 0
//!   assign i
//! loop:
//!   eval i
//!   eval times
//!   lt
//!   jumpifnot done
//!   pushstr "hello "
//!   eval who
//!   concat
//!   print
//!   ...
//!   jump loop
//! done:
//!   return
//! end
//! ```
//!
//! Instructions outside any block form the script's default handler
//! (`enterFrame` for score scripts and so on). `raw <opcode> <words...>`
//! emits an arbitrary opcode word, used to reproduce unknown opcodes.

use crate::context::{HandlerDef, ScriptType};
use crate::error::AssembleError;
use crate::instruction::{Instruction, Opcode, Operand};
use crate::opcodes::{Op, OperandKind};
use log::{debug, warn};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
}

impl Token {
    fn text(&self) -> &str {
        match self {
            Token::Word(s) | Token::Quoted(s) => s,
        }
    }
}

/// Split a line into tokens. Commas separate like whitespace; `--` and `;`
/// outside quotes start a comment.
fn tokenize(line: &str, line_no: usize) -> Result<Vec<Token>, AssembleError> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() || c == ',' {
            chars.next();
        } else if c == ';' {
            break;
        } else if c == '-' && line_rest_starts_comment(&mut chars.clone()) {
            break;
        } else if c == '"' {
            chars.next();
            let mut text = String::new();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '"' => {
                        closed = true;
                        break;
                    }
                    '\\' => match chars.next() {
                        Some('n') => text.push('\n'),
                        Some('t') => text.push('\t'),
                        Some('r') => text.push('\r'),
                        Some(other) => text.push(other),
                        None => break,
                    },
                    other => text.push(other),
                }
            }
            if !closed {
                return Err(AssembleError::UnterminatedString(line_no));
            }
            tokens.push(Token::Quoted(text));
        } else {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || c == ',' || c == '"' || c == ';' {
                    break;
                }
                word.push(c);
                chars.next();
            }
            tokens.push(Token::Word(word));
        }
    }
    Ok(tokens)
}

fn line_rest_starts_comment(chars: &mut std::iter::Peekable<std::str::Chars>) -> bool {
    chars.next();
    chars.peek() == Some(&'-')
}

fn parse_int(text: &str) -> Option<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let value = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };
    Some(if negative { -value } else { value })
}

fn parse_i32(token: &Token, line: usize) -> Result<i32, AssembleError> {
    let text = token.text();
    match parse_int(text) {
        Some(v) if v >= i32::MIN as i64 && v <= u32::MAX as i64 => Ok(v as i32),
        _ => Err(AssembleError::BadOperand(
            format!("expected an integer, found '{}'", text),
            line,
        )),
    }
}

/// An instruction whose jump target may still be a label
struct Pending {
    inst: Instruction,
    label: Option<(String, usize)>,
}

struct HandlerBuilder {
    def: HandlerDef,
    start_line: usize,
    pending: Vec<Pending>,
    labels: HashMap<String, usize>,
    /// Word offset of the next instruction
    offset: usize,
}

impl HandlerBuilder {
    fn new(name: &str, arg_names: Vec<String>, start_line: usize) -> Self {
        HandlerBuilder {
            def: HandlerDef {
                name: name.to_string(),
                arg_names,
                ..HandlerDef::default()
            },
            start_line,
            pending: Vec::new(),
            labels: HashMap::new(),
            offset: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.labels.is_empty() && self.def.local_names.is_empty()
    }

    fn label(&mut self, name: &str, line: usize) -> Result<(), AssembleError> {
        if self.labels.insert(name.to_string(), self.offset).is_some() {
            return Err(AssembleError::DuplicateLabel(name.to_string(), line));
        }
        Ok(())
    }

    fn push(&mut self, inst: Instruction, label: Option<(String, usize)>) {
        self.offset += inst.encoded_len();
        self.pending.push(Pending { inst, label });
    }

    fn finish(mut self) -> Result<HandlerDef, AssembleError> {
        for pending in &mut self.pending {
            if let Some((label, line)) = pending.label.take() {
                let target = *self
                    .labels
                    .get(&label)
                    .ok_or(AssembleError::UndefinedLabel(label.clone(), line))?;
                pending.inst.operands = vec![Operand::Offset(target)];
            }
            pending.inst.encode(&mut self.def.code);
        }
        debug!(
            "Assembled {} ({} words, {} locals)",
            self.def.name,
            self.def.code.len(),
            self.def.local_names.len()
        );
        Ok(self.def)
    }
}

/// Assembles source text into the handlers of one script context
pub struct Assembler {
    script_type: ScriptType,
}

impl Assembler {
    pub fn new(script_type: ScriptType) -> Self {
        Assembler { script_type }
    }

    pub fn assemble(&self, source: &str) -> Result<Vec<HandlerDef>, AssembleError> {
        let mut handlers: Vec<HandlerDef> = Vec::new();
        let mut top_level = HandlerBuilder::new(self.script_type.default_handler_name(), vec![], 1);
        let mut current: Option<HandlerBuilder> = None;

        for (index, raw_line) in source.lines().enumerate() {
            let line = index + 1;
            let tokens = tokenize(raw_line, line)?;
            let Some(first) = tokens.first() else {
                continue;
            };
            let head = first.text();

            match head {
                "on" if matches!(first, Token::Word(_)) => {
                    let name = tokens
                        .get(1)
                        .map(|t| t.text().to_string())
                        .ok_or_else(|| AssembleError::InvalidDeclaration("'on' needs a handler name".into(), line))?;
                    if current.is_some() {
                        return Err(AssembleError::NestedHandler(name, line));
                    }
                    let args = tokens[2..].iter().map(|t| t.text().to_string()).collect();
                    current = Some(HandlerBuilder::new(&name, args, line));
                }
                "end" if matches!(first, Token::Word(_)) => match current.take() {
                    Some(builder) => add_handler(&mut handlers, builder.finish()?),
                    None => return Err(AssembleError::UnexpectedEnd(line)),
                },
                "local" if matches!(first, Token::Word(_)) => {
                    let builder = current.as_mut().unwrap_or(&mut top_level);
                    for t in &tokens[1..] {
                        let name = t.text().to_string();
                        if builder.def.local_names.contains(&name) || builder.def.arg_names.contains(&name) {
                            warn!("line {}: local {} declared twice", line, name);
                            continue;
                        }
                        builder.def.local_names.push(name);
                    }
                }
                _ if tokens.len() == 1 && head.ends_with(':') && matches!(first, Token::Word(_)) => {
                    let builder = current.as_mut().unwrap_or(&mut top_level);
                    builder.label(head.trim_end_matches(':'), line)?;
                }
                _ => {
                    let builder = current.as_mut().unwrap_or(&mut top_level);
                    let (inst, label) = parse_instruction(&tokens, line)?;
                    builder.push(inst, label);
                }
            }
        }

        if let Some(open) = current {
            return Err(AssembleError::UnterminatedHandler(open.def.name, open.start_line));
        }
        if !top_level.is_empty() {
            let def = top_level.finish()?;
            add_handler(&mut handlers, def);
        }
        Ok(handlers)
    }
}

/// Convenience wrapper for `Assembler::new(script_type).assemble(source)`
pub fn assemble(source: &str, script_type: ScriptType) -> Result<Vec<HandlerDef>, AssembleError> {
    Assembler::new(script_type).assemble(source)
}

fn add_handler(handlers: &mut Vec<HandlerDef>, def: HandlerDef) {
    match handlers.iter_mut().find(|h| h.name == def.name) {
        Some(existing) => {
            warn!("Handler {} defined twice, keeping the later one", def.name);
            *existing = def;
        }
        None => handlers.push(def),
    }
}

fn parse_instruction(
    tokens: &[Token],
    line: usize,
) -> Result<(Instruction, Option<(String, usize)>), AssembleError> {
    let mnemonic = tokens[0].text();
    let operands = &tokens[1..];

    if mnemonic == "raw" {
        let code = operands
            .first()
            .ok_or(AssembleError::WrongOperandCount("raw".into(), 1, 0, line))
            .and_then(|t| parse_i32(t, line))?;
        let code = u16::try_from(code).map_err(|_| {
            AssembleError::BadOperand(format!("raw opcode {:#x} does not fit 16 bits", code), line)
        })?;
        let words = operands[1..]
            .iter()
            .map(|t| parse_i32(t, line).map(|v| Operand::Raw(v as u32)))
            .collect::<Result<Vec<_>, _>>()?;
        let opcode = match Op::from_code(code) {
            Some(op) => {
                warn!("line {}: raw encoding of known opcode {}", line, op);
                Opcode::Known(op)
            }
            None => Opcode::Unknown(code),
        };
        let inst = Instruction {
            offset: 0,
            opcode,
            operands: words,
            size: 0,
        };
        return Ok((inst, None));
    }

    let op = Op::from_mnemonic(mnemonic)
        .ok_or_else(|| AssembleError::UnknownMnemonic(mnemonic.to_string(), line))?;
    let kinds = op.operands();
    if operands.len() != kinds.len() {
        return Err(AssembleError::WrongOperandCount(
            mnemonic.to_string(),
            kinds.len(),
            operands.len(),
            line,
        ));
    }

    let mut values = Vec::with_capacity(kinds.len());
    let mut label = None;
    for (kind, token) in kinds.iter().zip(operands) {
        let value = match kind {
            OperandKind::Int => Operand::Int(parse_i32(token, line)?),
            OperandKind::Float => {
                let text = token.text();
                let f = text.parse::<f64>().map_err(|_| {
                    AssembleError::BadOperand(format!("expected a number, found '{}'", text), line)
                })?;
                Operand::Float(f)
            }
            OperandKind::Str => Operand::Str(token.text().to_string()),
            OperandKind::Offset => match (token, parse_int(token.text())) {
                (Token::Word(_), Some(n)) if n >= 0 => Operand::Offset(n as usize),
                (Token::Word(name), None) => {
                    label = Some((name.clone(), line));
                    Operand::Offset(0)
                }
                _ => {
                    return Err(AssembleError::BadOperand(
                        format!("expected a label, found '{}'", token.text()),
                        line,
                    ))
                }
            },
        };
        values.push(value);
    }
    Ok((Instruction::new(op, values), label))
}
