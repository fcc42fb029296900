//! retrovm - a resumable bytecode VM for legacy adventure engine scripts
//!
//! Three instruction streams share one decoding layer (`operand`):
//! handler bytecode run by the VM core (`vm`, `interpreter`), track
//! streams that drive presentation calls (`track`) and sequence streams
//! that chain tracks (`sequence`). The `orchestrator` schedules all of them
//! from the host's frame loop.

pub mod assembler;
pub mod builtins;
pub mod config;
pub mod context;
pub mod datum;
pub mod disassembler;
pub mod error;
pub mod host;
pub mod instruction;
pub mod interpreter;
pub mod opcodes;
pub mod operand;
pub mod orchestrator;
pub mod resources;
pub mod sequence;
pub mod symbol;
pub mod track;
pub mod unit;
pub mod vm;

#[cfg(test)]
mod interpreter_tests;
