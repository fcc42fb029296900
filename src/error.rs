// Error types shared across the VM, the assembler and the orchestrator

use crate::context::ScriptType;
use crate::datum::DatumError;
use crate::resources::ResourceError;
use std::fmt;

/// Failure while decoding an instruction stream. Always fatal to the
/// script being decoded, never to its siblings.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// The stream ended before the declared operands
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    /// A known opcode declared a different operand word count than its shape
    OperandCountMismatch {
        offset: usize,
        opcode: u16,
        declared: usize,
        expected: usize,
    },
    /// Track opcode carrying a count nibble the format does not allow
    InvalidOperandCount { offset: usize, code: u16, count: u8 },
    /// Paired-zero string ran off the end of the stream
    UnterminatedString { offset: usize },
    /// Inline string operand is not valid UTF-8
    InvalidUtf8 { offset: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecodeError::Truncated {
                offset,
                needed,
                available,
            } => write!(
                f,
                "Truncated instruction at {:#06x}: needed {} more, {} available",
                offset, needed, available
            ),
            DecodeError::OperandCountMismatch {
                offset,
                opcode,
                declared,
                expected,
            } => write!(
                f,
                "Opcode {:#06x} at {:#06x} declares {} operand words, expected {}",
                opcode, offset, declared, expected
            ),
            DecodeError::InvalidOperandCount {
                offset,
                code,
                count,
            } => write!(
                f,
                "Invalid opcode {:#06x} at {:#06x} requires {} operands",
                code, offset, count
            ),
            DecodeError::UnterminatedString { offset } => {
                write!(f, "Unterminated string operand at {:#06x}", offset)
            }
            DecodeError::InvalidUtf8 { offset } => {
                write!(f, "String operand at {:#06x} is not valid UTF-8", offset)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Runtime failure inside the dispatch loop. Every variant aborts the
/// running script.
#[derive(Debug, Clone, PartialEq)]
pub enum VmError {
    Decode(DecodeError),
    Type(DatumError),
    DivisionByZero,
    StackUnderflow { needed: usize, available: usize },
    StackOverflow(usize),
    CallDepthExceeded(usize),
    BadJump { target: usize, len: usize },
    Builtin(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VmError::Decode(e) => write!(f, "Decode error: {}", e),
            VmError::Type(e) => write!(f, "Type error: {}", e),
            VmError::DivisionByZero => write!(f, "Division by zero"),
            VmError::StackUnderflow { needed, available } => write!(
                f,
                "Stack underflow: needed {} values, {} available",
                needed, available
            ),
            VmError::StackOverflow(limit) => {
                write!(f, "Operand stack overflow (limit {})", limit)
            }
            VmError::CallDepthExceeded(limit) => {
                write!(f, "Call depth exceeded (limit {})", limit)
            }
            VmError::BadJump { target, len } => {
                write!(f, "Jump target {} outside handler of {} words", target, len)
            }
            VmError::Builtin(msg) => write!(f, "Builtin error: {}", msg),
        }
    }
}

impl std::error::Error for VmError {}

impl From<DecodeError> for VmError {
    fn from(e: DecodeError) -> Self {
        VmError::Decode(e)
    }
}

impl From<DatumError> for VmError {
    fn from(e: DatumError) -> Self {
        VmError::Type(e)
    }
}

/// Error raised by the text assembler. Positions are 1-based source lines.
#[derive(Debug, Clone, PartialEq)]
pub enum AssembleError {
    UnknownMnemonic(String, usize),
    BadOperand(String, usize), // message, line
    WrongOperandCount(String, usize, usize, usize), // mnemonic, expected, found, line
    UndefinedLabel(String, usize),
    DuplicateLabel(String, usize),
    UnterminatedString(usize),
    UnexpectedEnd(usize),
    NestedHandler(String, usize),
    UnterminatedHandler(String, usize),
    InvalidDeclaration(String, usize),
}

impl fmt::Display for AssembleError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AssembleError::UnknownMnemonic(m, line) => {
                write!(f, "Unknown mnemonic '{}' on line {}", m, line)
            }
            AssembleError::BadOperand(msg, line) => {
                write!(f, "Bad operand on line {}: {}", line, msg)
            }
            AssembleError::WrongOperandCount(m, expected, found, line) => write!(
                f,
                "'{}' on line {} takes {} operands, found {}",
                m, line, expected, found
            ),
            AssembleError::UndefinedLabel(label, line) => {
                write!(f, "Undefined label '{}' on line {}", label, line)
            }
            AssembleError::DuplicateLabel(label, line) => {
                write!(f, "Duplicate label '{}' on line {}", label, line)
            }
            AssembleError::UnterminatedString(line) => {
                write!(f, "Unterminated string on line {}", line)
            }
            AssembleError::UnexpectedEnd(line) => {
                write!(f, "'end' outside of a handler on line {}", line)
            }
            AssembleError::NestedHandler(name, line) => write!(
                f,
                "Handler '{}' opened on line {} inside another handler",
                name, line
            ),
            AssembleError::UnterminatedHandler(name, line) => write!(
                f,
                "Handler '{}' starting on line {} has no 'end'",
                name, line
            ),
            AssembleError::InvalidDeclaration(msg, line) => {
                write!(f, "Invalid declaration on line {}: {}", line, msg)
            }
        }
    }
}

impl std::error::Error for AssembleError {}

/// Failure to turn source or a resource into a published script context
#[derive(Debug, Clone, PartialEq)]
pub enum LoadError {
    Assemble(AssembleError),
    Resource(ResourceError),
    Format(String),
    Encoding(String),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoadError::Assemble(e) => write!(f, "{}", e),
            LoadError::Resource(e) => write!(f, "{}", e),
            LoadError::Format(msg) => write!(f, "Malformed compiled unit: {}", msg),
            LoadError::Encoding(msg) => write!(f, "Script source is not text: {}", msg),
        }
    }
}

impl std::error::Error for LoadError {}

impl From<AssembleError> for LoadError {
    fn from(e: AssembleError) -> Self {
        LoadError::Assemble(e)
    }
}

impl From<ResourceError> for LoadError {
    fn from(e: ResourceError) -> Self {
        LoadError::Resource(e)
    }
}

/// Errors reported to the host by orchestrator entry points
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    Load(LoadError),
    UnknownScript(ScriptType, u16),
    UnknownEntry(ScriptType, u16, usize),
    UnknownChannel(usize),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OrchestratorError::Load(e) => write!(f, "Load failed: {}", e),
            OrchestratorError::UnknownScript(kind, id) => {
                write!(f, "No {} script with id {}", kind, id)
            }
            OrchestratorError::UnknownEntry(kind, id, entry) => write!(
                f,
                "{} script {} has no handler at index {}",
                kind, id, entry
            ),
            OrchestratorError::UnknownChannel(ch) => write!(f, "No channel {}", ch),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<LoadError> for OrchestratorError {
    fn from(e: LoadError) -> Self {
        OrchestratorError::Load(e)
    }
}

impl From<ResourceError> for OrchestratorError {
    fn from(e: ResourceError) -> Self {
        OrchestratorError::Load(LoadError::Resource(e))
    }
}
