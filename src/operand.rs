//! Operand readers for the three stream formats
//!
//! Handler bytecode is a stream of `u32` words; track and sequence scripts are
//! little-endian `u16` streams. Every read is bounds checked and reports a
//! `DecodeError` instead of running past the end of the buffer.

use crate::error::DecodeError;

/// Number of words needed to hold `len` packed string bytes
pub fn string_word_count(len: usize) -> usize {
    len.div_ceil(4)
}

/// Two's-complement reading of an operand word
pub fn word_to_int(word: u32) -> i32 {
    word as i32
}

pub fn int_to_word(value: i32) -> u32 {
    value as u32
}

/// Split a float into (high, low) words of its bit pattern
pub fn float_to_words(value: f64) -> [u32; 2] {
    let bits = value.to_bits();
    [(bits >> 32) as u32, bits as u32]
}

pub fn words_to_float(high: u32, low: u32) -> f64 {
    f64::from_bits(((high as u64) << 32) | low as u64)
}

/// Append a length-prefixed string: one byte-length word, then the bytes
/// packed four per word, little-endian, zero padded.
pub fn encode_string(text: &str, out: &mut Vec<u32>) {
    let bytes = text.as_bytes();
    out.push(bytes.len() as u32);
    for chunk in bytes.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        out.push(u32::from_le_bytes(word));
    }
}

/// Decode a length-prefixed string from the start of `words`.
///
/// `offset` is only used for error reporting. Returns the string and the
/// number of words consumed, length word included.
pub fn decode_string(words: &[u32], offset: usize) -> Result<(String, usize), DecodeError> {
    let len = *words.first().ok_or(DecodeError::Truncated {
        offset,
        needed: 1,
        available: 0,
    })? as usize;
    let needed = string_word_count(len);
    let available = words.len() - 1;
    if needed > available {
        return Err(DecodeError::Truncated {
            offset,
            needed,
            available,
        });
    }
    let mut bytes = Vec::with_capacity(needed * 4);
    for word in &words[1..=needed] {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes.truncate(len);
    let text = String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8 { offset })?;
    Ok((text, needed + 1))
}

/// Cursor over a little-endian 16-bit script stream
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        ByteReader { data, pos: 0 }
    }

    pub fn at(data: &'a [u8], pos: usize) -> Self {
        ByteReader { data, pos }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Move back to an earlier position (used to un-read an opcode)
    pub fn rewind(&mut self, bytes: usize) {
        self.pos = self.pos.saturating_sub(bytes);
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self.data.get(self.pos).ok_or(DecodeError::Truncated {
            offset: self.pos,
            needed: 1,
            available: 0,
        })?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        if self.remaining() < 2 {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: 2,
                available: self.remaining(),
            });
        }
        let value = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    pub fn read_i16(&mut self) -> Result<i16, DecodeError> {
        self.read_u16().map(|v| v as i16)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: len,
                available: self.remaining(),
            });
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Read a string stored as byte pairs, ended by the first pair that
    /// holds a zero byte. Zero bytes are not part of the result.
    pub fn read_paired_string(&mut self) -> Result<String, DecodeError> {
        let start = self.pos;
        let mut bytes = Vec::new();
        loop {
            if self.remaining() < 2 {
                return Err(DecodeError::UnterminatedString { offset: start });
            }
            let pair = [self.data[self.pos], self.data[self.pos + 1]];
            self.pos += 2;
            bytes.extend(pair.iter().copied().filter(|&b| b != 0));
            if pair[0] == 0 || pair[1] == 0 {
                break;
            }
        }
        // legacy data is 8-bit text
        Ok(bytes.iter().map(|&b| b as char).collect())
    }
}
