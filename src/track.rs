//! Track interpreter
//!
//! A track is a stream of little-endian `u16` words. Each opcode word keeps
//! the opcode in its high 12 bits and the operand count in the low nibble;
//! a nibble of `0xF` means a zero-terminated string stored as byte pairs
//! follows instead of integer operands. One instruction runs per step, and
//! a pending delay turns the step into a no-op.

use crate::datum::Datum;
use crate::error::DecodeError;
use crate::interpreter::HostContext;
use crate::operand::ByteReader;
use log::{debug, warn};
use std::collections::HashMap;
use std::fmt;

pub const STRING_OPERAND: u8 = 0x0F;
pub const MAX_INT_OPERANDS: u8 = 8;

// Opcodes the track keeps in its own state
pub const FINISH: u16 = 0x0000;
pub const PURGE: u16 = 0x0110;
pub const SET_DELAY: u16 = 0x1020;
pub const SELECT_BMP: u16 = 0x1050;
pub const SETUP_DONE: u16 = 0x10A0;
pub const SET_SCENE: u16 = 0x1110;
pub const GOTO_SCENE: u16 = 0x1200;
pub const SET_COLORS: u16 = 0x2000;
pub const SET_DRAW_WINDOW: u16 = 0x4000;
pub const LOAD_BMP: u16 = 0xF020;

// Opcodes forwarded to the presentation surface
pub const SAVE_BACKGROUND: u16 = 0x0020;
pub const DRAW_BACKGROUND: u16 = 0x0080;
pub const REFRESH: u16 = 0x0FF0;
pub const SET_BMP: u16 = 0x1030;
pub const SELECT_PAL: u16 = 0x1060;
pub const SELECT_SONG: u16 = 0x1090;
pub const FADE_OUT: u16 = 0x4110;
pub const FADE_IN: u16 = 0x4120;
pub const STORE_AREA: u16 = 0x4200;
pub const DRAW_PIXEL: u16 = 0xA000;
pub const SAVE_REGION: u16 = 0xA050;
pub const DRAW_LINE: u16 = 0xA0A0;
pub const DRAW_FILLED_RECT: u16 = 0xA100;
pub const DRAW_EMPTY_RECT: u16 = 0xA110;
pub const DRAW_BMP: u16 = 0xA500;
pub const DRAW_SPRITE_FLIP: u16 = 0xA520;
pub const DRAW_BMP4: u16 = 0xA530;
pub const LOAD_SCREEN: u16 = 0xF010;
pub const LOAD_PALETTE: u16 = 0xF050;
pub const LOAD_SONG: u16 = 0xF060;

const SURFACE_OPS: &[u16] = &[
    SAVE_BACKGROUND,
    DRAW_BACKGROUND,
    REFRESH,
    SET_BMP,
    SELECT_PAL,
    SELECT_SONG,
    FADE_OUT,
    FADE_IN,
    STORE_AREA,
    DRAW_PIXEL,
    SAVE_REGION,
    DRAW_LINE,
    DRAW_FILLED_RECT,
    DRAW_EMPTY_RECT,
    DRAW_BMP,
    DRAW_SPRITE_FLIP,
    DRAW_BMP4,
    LOAD_SCREEN,
    LOAD_PALETTE,
    LOAD_SONG,
];

/// Whether the opcode draws on the current bitmap
fn uses_bitmap(op: u16) -> bool {
    matches!(op, SET_BMP | DRAW_BMP | DRAW_SPRITE_FLIP | DRAW_BMP4)
}

/// One decoded track instruction
#[derive(Debug, Clone, PartialEq)]
pub struct TrackInstruction {
    /// Byte offset of the opcode word
    pub offset: usize,
    pub op: u16,
    pub count: u8,
    pub args: Vec<i16>,
    pub text: Option<String>,
}

impl TrackInstruction {
    pub fn decode(reader: &mut ByteReader) -> Result<Self, DecodeError> {
        let offset = reader.pos();
        let code = reader.read_u16()?;
        let op = code & 0xFFF0;
        let count = (code & 0x000F) as u8;

        if count > MAX_INT_OPERANDS && count != STRING_OPERAND {
            return Err(DecodeError::InvalidOperandCount {
                offset,
                code,
                count,
            });
        }

        let mut inst = TrackInstruction {
            offset,
            op,
            count,
            args: Vec::new(),
            text: None,
        };
        if count == STRING_OPERAND {
            inst.text = Some(reader.read_paired_string()?);
        } else {
            for _ in 0..count {
                inst.args.push(reader.read_i16()?);
            }
        }
        Ok(inst)
    }

    /// Argument `i`, zero when the instruction carries fewer
    pub fn arg(&self, i: usize) -> i16 {
        self.args.get(i).copied().unwrap_or(0)
    }
}

impl fmt::Display for TrackInstruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#06x}", self.op)?;
        match &self.text {
            Some(text) => write!(f, " \"{}\"", text),
            None => {
                let args: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
                if !args.is_empty() {
                    write!(f, " {}", args.join(", "))?;
                }
                Ok(())
            }
        }
    }
}

/// Decode a whole track for inspection
pub fn decode_track(data: &[u8]) -> Result<Vec<TrackInstruction>, DecodeError> {
    let mut reader = ByteReader::new(data);
    let mut out = Vec::new();
    while !reader.at_end() {
        out.push(TrackInstruction::decode(&mut reader)?);
    }
    Ok(out)
}

/// Drawing state a track carries between steps
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackState {
    pub scene: i16,
    pub delay: u64,
    pub delay_start: u64,
    pub current_bmp: i16,
    pub bmp_names: HashMap<i16, String>,
    pub draw_fg: u8,
    pub draw_bg: u8,
    /// x, y, w, h
    pub draw_window: [i16; 4],
    pub setup_finished: bool,
}

impl TrackState {
    pub fn current_bmp_name(&self) -> Option<&str> {
        self.bmp_names.get(&self.current_bmp).map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackStatus {
    /// An instruction ran
    Stepped,
    /// A delay is pending, nothing ran
    Delayed,
    Finished,
}

pub struct Track {
    name: String,
    data: Vec<u8>,
    pos: usize,
    state: TrackState,
}

impl Track {
    pub fn new(name: &str, data: Vec<u8>) -> Self {
        Track {
            name: name.to_string(),
            data,
            pos: 0,
            state: TrackState::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &TrackState {
        &self.state
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn is_finished(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Run at most one instruction
    pub fn step(&mut self, host: &mut HostContext) -> Result<TrackStatus, DecodeError> {
        if self.is_finished() {
            return Ok(TrackStatus::Finished);
        }
        let now = host.clock.now_ms();
        if self.state.delay_start + self.state.delay > now {
            return Ok(TrackStatus::Delayed);
        }
        self.state.delay = 0;
        self.state.delay_start = 0;

        let mut reader = ByteReader::at(&self.data, self.pos);
        let inst = TrackInstruction::decode(&mut reader)?;
        self.pos = reader.pos();
        debug!("{} [{:04x}] {}", self.name, inst.offset, inst);

        self.handle(&inst, now, host);
        Ok(TrackStatus::Stepped)
    }

    fn handle(&mut self, inst: &TrackInstruction, now: u64, host: &mut HostContext) {
        if SURFACE_OPS.contains(&inst.op) {
            self.forward(inst, host);
            return;
        }
        let state = &mut self.state;
        match inst.op {
            FINISH => {}
            PURGE => state.current_bmp = 0,
            SET_DELAY => {
                state.delay += inst.arg(0).max(0) as u64 * 10;
                state.delay_start = now;
            }
            SELECT_BMP => state.current_bmp = inst.arg(0),
            SETUP_DONE => {
                debug!("{}: scene setup done ({})", self.name, inst.arg(0));
                state.setup_finished = true;
            }
            SET_SCENE => {
                state.scene = inst.arg(0);
                state.setup_finished = false;
            }
            GOTO_SCENE => state.scene = inst.arg(0),
            SET_COLORS => {
                state.draw_fg = inst.arg(0) as u8;
                state.draw_bg = inst.arg(1) as u8;
            }
            SET_DRAW_WINDOW => {
                state.draw_window = [inst.arg(0), inst.arg(1), inst.arg(2), inst.arg(3)];
            }
            LOAD_BMP => {
                let name = inst.text.clone().unwrap_or_default();
                state.bmp_names.insert(state.current_bmp, name);
            }
            op => warn!(
                "Unimplemented track opcode: {:#06x} ({} args) in {}",
                op, inst.count, self.name
            ),
        }
    }

    fn forward(&mut self, inst: &TrackInstruction, host: &mut HostContext) {
        if uses_bitmap(inst.op) && inst.args.len() == 4 {
            self.state.current_bmp = inst.arg(3);
        }
        let mut args: Vec<Datum> = match &inst.text {
            Some(text) => vec![Datum::string(text)],
            None => inst.args.iter().map(|&a| Datum::Int(a as i32)).collect(),
        };
        if uses_bitmap(inst.op) {
            match self.state.current_bmp_name() {
                Some(name) => args.push(Datum::string(name)),
                None => warn!(
                    "{}: no bitmap loaded in slot {}",
                    self.name, self.state.current_bmp
                ),
            }
        }
        if let Err(e) = host.surface.call(inst.op, &args) {
            warn!("{}: surface refused {:#06x}: {}", self.name, inst.op, e);
        }
    }
}
