//! Compiled script units
//!
//! A unit is the list of handlers one script context defines. Units come
//! either as assembler source text or in the binary `RVMU` layout:
//!
//! ```text
//! "RVMU"  u16 version  u16 handler_count
//! per handler:
//!   u16 name_len, name bytes
//!   u8 argc, argc x (u16 len, bytes)
//!   u8 localc, localc x (u16 len, bytes)
//!   u32 code_len, code_len x u32 word
//! ```
//!
//! All integers are little-endian.

use crate::assembler::assemble;
use crate::context::{HandlerDef, ScriptType};
use crate::error::{DecodeError, LoadError};
use crate::operand::ByteReader;
use log::debug;

pub const UNIT_MAGIC: &[u8; 4] = b"RVMU";
pub const UNIT_VERSION: u16 = 1;

fn push_name(out: &mut Vec<u8>, name: &str) {
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(name.as_bytes());
}

/// Serialize handlers to the binary unit layout
pub fn to_bytes(defs: &[HandlerDef]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(UNIT_MAGIC);
    out.extend_from_slice(&UNIT_VERSION.to_le_bytes());
    out.extend_from_slice(&(defs.len() as u16).to_le_bytes());
    for def in defs {
        push_name(&mut out, &def.name);
        out.push(def.arg_names.len() as u8);
        for name in &def.arg_names {
            push_name(&mut out, name);
        }
        out.push(def.local_names.len() as u8);
        for name in &def.local_names {
            push_name(&mut out, name);
        }
        out.extend_from_slice(&(def.code.len() as u32).to_le_bytes());
        for word in &def.code {
            out.extend_from_slice(&word.to_le_bytes());
        }
    }
    out
}

fn format_error(e: DecodeError) -> LoadError {
    LoadError::Format(e.to_string())
}

fn read_name(reader: &mut ByteReader) -> Result<String, LoadError> {
    let len = reader.read_u16().map_err(format_error)? as usize;
    let pos = reader.pos();
    let bytes = reader.read_bytes(len).map_err(format_error)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| LoadError::Format(format!("name at byte {} is not UTF-8", pos)))
}

fn read_u32(reader: &mut ByteReader) -> Result<u32, LoadError> {
    let bytes = reader.read_bytes(4).map_err(format_error)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_names(reader: &mut ByteReader) -> Result<Vec<String>, LoadError> {
    let count = reader.read_u8().map_err(format_error)?;
    (0..count).map(|_| read_name(reader)).collect()
}

/// Parse a binary unit
pub fn from_bytes(data: &[u8]) -> Result<Vec<HandlerDef>, LoadError> {
    if !is_binary_unit(data) {
        return Err(LoadError::Format("missing RVMU magic".into()));
    }
    let mut reader = ByteReader::at(data, UNIT_MAGIC.len());
    let version = reader.read_u16().map_err(format_error)?;
    if version != UNIT_VERSION {
        return Err(LoadError::Format(format!(
            "unsupported unit version {}",
            version
        )));
    }
    let count = reader.read_u16().map_err(format_error)?;
    let mut defs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = read_name(&mut reader)?;
        let arg_names = read_names(&mut reader)?;
        let local_names = read_names(&mut reader)?;
        let code_len = read_u32(&mut reader)? as usize;
        if code_len > reader.remaining() / 4 {
            return Err(LoadError::Format(format!(
                "handler {} declares {} words, only {} bytes left",
                name,
                code_len,
                reader.remaining()
            )));
        }
        let code = (0..code_len)
            .map(|_| read_u32(&mut reader))
            .collect::<Result<Vec<_>, _>>()?;
        debug!("Unit handler {} ({} words)", name, code.len());
        defs.push(HandlerDef {
            name,
            arg_names,
            local_names,
            code,
        });
    }
    if !reader.at_end() {
        debug!("{} trailing bytes after unit", reader.remaining());
    }
    Ok(defs)
}

pub fn is_binary_unit(data: &[u8]) -> bool {
    data.starts_with(UNIT_MAGIC)
}

/// Load a unit from raw bytes: binary units are parsed, anything else must
/// be UTF-8 assembler source.
pub fn load_unit(data: &[u8], script_type: ScriptType) -> Result<Vec<HandlerDef>, LoadError> {
    if is_binary_unit(data) {
        return from_bytes(data);
    }
    let text = std::str::from_utf8(data).map_err(|e| LoadError::Encoding(e.to_string()))?;
    Ok(assemble(text, script_type)?)
}
