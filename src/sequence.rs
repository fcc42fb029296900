//! Sequence interpreter
//!
//! A sequence resource starts with the table of track names it drives:
//! `u16 count`, then `count` names as `u16 len` + bytes. The rest is the
//! script, little-endian `u16` words whose operand counts come from the
//! static `num_args` table. The script queues chains of tracks, plays them
//! and skips conditional blocks on whether a track has played or is running.

use crate::config::DetailLevel;
use crate::error::{DecodeError, LoadError};
use crate::interpreter::HostContext;
use crate::operand::ByteReader;
use crate::resources::ResourceProvider;
use crate::track::{Track, TrackStatus};
use bitvec::vec::BitVec;
use log::{debug, info, warn};

pub const LABEL: u16 = 0x0001;
pub const LABEL_ALT: u16 = 0x0005;
pub const IF_NOT_PLAYED: u16 = 0x1330;
pub const IF_PLAYED: u16 = 0x1350;
pub const IF_NOT_RUNNING: u16 = 0x1360;
pub const IF_RUNNING: u16 = 0x1370;
pub const PLAY_SCENE: u16 = 0x1510;
pub const PLAY_SCENE_ENDIF: u16 = 0x1520;
pub const ADD_SCENE: u16 = 0x2005;
pub const END_IF: u16 = 0xFFF0;
pub const END: u16 = 0xFFFF;

/// Operand words that follow `opcode`
pub fn num_args(opcode: u16) -> usize {
    match opcode {
        0x1080 | 0x3020 | 0xF010 | 0xF200 | 0xF210 => 1,
        0x1010..=0x1070 if opcode & 0x000F == 0 => 2,
        0x1310..=0x1370 if opcode & 0x000F == 0 => 2,
        0x2010 | 0x2015 | 0x2020 | 0x4000 | 0x4010 => 3,
        0x2000 | 0x2005 => 4,
        _ => 0,
    }
}

fn is_conditional(opcode: u16) -> bool {
    matches!(
        opcode,
        IF_NOT_PLAYED | IF_PLAYED | IF_NOT_RUNNING | IF_RUNNING
    )
}

/// Parsed sequence resource
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceScript {
    pub names: Vec<String>,
    pub script: Vec<u8>,
}

impl SequenceScript {
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = ByteReader::new(data);
        let count = reader.read_u16()?;
        let mut names = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = reader.read_u16()? as usize;
            let bytes = reader.read_bytes(len)?;
            names.push(bytes.iter().map(|&b| b as char).collect());
        }
        let script = data[reader.pos()..].to_vec();
        Ok(SequenceScript { names, script })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.names.len() as u16).to_le_bytes());
        for name in &self.names {
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend(name.chars().map(|c| c as u8));
        }
        out.extend_from_slice(&self.script);
        out
    }
}

/// Pick the detail variant of a resource name: the last character is
/// replaced by the level's suffix, falling back to the name as given.
pub fn detail_variant(name: &str, resources: &dyn ResourceProvider, detail: DetailLevel) -> String {
    let mut variant: String = name.chars().take(name.chars().count().saturating_sub(1)).collect();
    variant.push(detail.suffix());
    if resources.has_resource(&variant) {
        variant
    } else {
        name.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    /// A track chain is playing
    Playing,
    /// The script yielded with nothing queued
    Waiting,
    Finished,
}

pub struct Sequence {
    name: String,
    script: SequenceScript,
    pos: usize,
    scene: u16,
    sub_idx: u16,
    sub_max: u16,
    played: BitVec,
    running: BitVec,
    track: Option<Track>,
    ended: bool,
}

impl Sequence {
    pub fn new(name: &str, script: SequenceScript) -> Self {
        let n = script.names.len();
        Sequence {
            name: name.to_string(),
            script,
            pos: 0,
            scene: 0,
            sub_idx: 0,
            sub_max: 0,
            played: BitVec::repeat(false, n),
            running: BitVec::repeat(false, n),
            track: None,
            ended: false,
        }
    }

    /// Open a sequence resource at the configured detail level
    pub fn load(
        name: &str,
        resources: &dyn ResourceProvider,
        detail: DetailLevel,
    ) -> Result<Self, LoadError> {
        let resource = detail_variant(name, resources, detail);
        let data = resources.open(&resource)?;
        let script = SequenceScript::parse(&data).map_err(|e| LoadError::Format(e.to_string()))?;
        info!(
            "Loaded sequence {} from {} ({} tracks)",
            name,
            resource,
            script.names.len()
        );
        Ok(Sequence::new(name, script))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn track_names(&self) -> &[String] {
        &self.script.names
    }

    pub fn scene(&self) -> u16 {
        self.scene
    }

    pub fn sub_idx(&self) -> u16 {
        self.sub_idx
    }

    pub fn sub_max(&self) -> u16 {
        self.sub_max
    }

    /// Byte position in the script
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn current_track(&self) -> Option<&Track> {
        self.track.as_ref()
    }

    /// Played bit of track `sub_idx` (1-based); out of range reads as false
    pub fn has_played(&self, sub_idx: u16) -> bool {
        bit(&self.played, sub_idx)
    }

    pub fn is_running(&self, sub_idx: u16) -> bool {
        bit(&self.running, sub_idx)
    }

    pub fn is_finished(&self) -> bool {
        self.sub_max == 0 && (self.ended || self.pos >= self.script.script.len())
    }

    /// Advance by one step: one track instruction while a chain plays,
    /// otherwise script instructions up to the next yield.
    pub fn step(
        &mut self,
        resources: &dyn ResourceProvider,
        host: &mut HostContext,
    ) -> Result<SequenceStatus, DecodeError> {
        if self.sub_max > 0 {
            self.play_scene(resources, host)?;
            return Ok(SequenceStatus::Playing);
        }
        if self.is_finished() {
            return Ok(SequenceStatus::Finished);
        }

        loop {
            let op = self.read_word()?;
            let more = self.handle(op, resources)?;
            if !more || self.pos >= self.script.script.len() {
                break;
            }
        }

        Ok(if self.sub_max > 0 {
            SequenceStatus::Playing
        } else if self.is_finished() {
            SequenceStatus::Finished
        } else {
            SequenceStatus::Waiting
        })
    }

    fn read_word(&mut self) -> Result<u16, DecodeError> {
        let mut reader = ByteReader::at(&self.script.script, self.pos);
        let word = reader.read_u16()?;
        self.pos = reader.pos();
        Ok(word)
    }

    fn play_scene(
        &mut self,
        resources: &dyn ResourceProvider,
        host: &mut HostContext,
    ) -> Result<(), DecodeError> {
        let status = match self.track.as_mut() {
            Some(track) => track.step(host)?,
            None => TrackStatus::Finished,
        };
        if status != TrackStatus::Finished {
            return Ok(());
        }

        let idx = self.sub_idx as usize - 1;
        self.running.set(idx, false);
        self.played.set(idx, true);
        debug!("{}: track {} done", self.name, self.script.names[idx]);

        let limit = (self.sub_max as usize).min(self.script.names.len());
        if (self.sub_idx as usize) < limit {
            self.sub_idx += 1;
            self.start_track(resources);
        } else {
            self.track = None;
            self.sub_max = 0;
        }
        Ok(())
    }

    fn start_track(&mut self, resources: &dyn ResourceProvider) {
        let idx = self.sub_idx as usize - 1;
        let name = &self.script.names[idx];
        self.running.set(idx, true);
        self.track = match resources.open(name) {
            Ok(data) => Some(Track::new(name, data)),
            Err(e) => {
                warn!("{}: cannot start track {}: {}", self.name, name, e);
                None
            }
        };
    }

    /// Returns false when the script yields
    fn handle(&mut self, op: u16, resources: &dyn ResourceProvider) -> Result<bool, DecodeError> {
        match op {
            LABEL | LABEL_ALT => debug!("{}: label {:#06x}", self.name, op),
            ADD_SCENE => {
                let sub_idx = self.read_word()?;
                let sub_max = self.read_word()?;
                let unk1 = self.read_word()?;
                let unk2 = self.read_word()?;
                debug!(
                    "{}: add scene {} to {} ({}, {})",
                    self.name, sub_idx, sub_max, unk1, unk2
                );
                if self.sub_max == 0 {
                    if sub_idx == 0 || sub_idx as usize > self.script.names.len() {
                        warn!("{}: no track {} to queue", self.name, sub_idx);
                    } else {
                        self.scene = sub_idx;
                        self.sub_idx = sub_idx;
                        self.sub_max = sub_max.max(sub_idx);
                        self.start_track(resources);
                    }
                }
            }
            IF_NOT_PLAYED | IF_PLAYED | IF_NOT_RUNNING | IF_RUNNING => {
                let sub_idx = self.read_word()?;
                let sub_max = self.read_word()?;
                if sub_idx == 0 || sub_idx as usize > self.script.names.len() {
                    warn!(
                        "{}: condition {:#06x} on unknown track {}",
                        self.name, op, sub_idx
                    );
                }
                let holds = match op {
                    IF_NOT_PLAYED => !self.has_played(sub_idx),
                    IF_PLAYED => self.has_played(sub_idx),
                    IF_NOT_RUNNING => !self.is_running(sub_idx),
                    _ => self.is_running(sub_idx),
                };
                debug!(
                    "{}: condition {:#06x} {} {} -> {}",
                    self.name, op, sub_idx, sub_max, holds
                );
                if !holds {
                    self.skip_to_end_if()?;
                }
            }
            END_IF => {}
            PLAY_SCENE => {
                debug!("{}: play scene", self.name);
                return Ok(false);
            }
            END => {
                self.ended = true;
                return Ok(false);
            }
            _ => {
                let nargs = num_args(op);
                warn!(
                    "Unimplemented sequence opcode: {:#06x} (skip {} args)",
                    op, nargs
                );
                for _ in 0..nargs {
                    self.read_word()?;
                }
            }
        }
        Ok(true)
    }

    /// Skip a conditional block. Leaves the position on the matching
    /// END_IF, or on PLAY_SCENE_ENDIF or END, whichever comes first.
    fn skip_to_end_if(&mut self) -> Result<(), DecodeError> {
        let mut depth = 0usize;
        while self.pos < self.script.script.len() {
            let start = self.pos;
            let op = self.read_word()?;
            match op {
                PLAY_SCENE_ENDIF | END => {
                    self.pos = start;
                    return Ok(());
                }
                END_IF if depth == 0 => {
                    self.pos = start;
                    return Ok(());
                }
                END_IF => depth -= 1,
                op if is_conditional(op) => depth += 1,
                _ => {}
            }
            for _ in 0..num_args(op) {
                self.read_word()?;
            }
        }
        Ok(())
    }
}

fn bit(bits: &BitVec, sub_idx: u16) -> bool {
    match (sub_idx as usize).checked_sub(1) {
        Some(i) => bits.get(i).map(|b| *b).unwrap_or(false),
        None => false,
    }
}
