//! The slice of CBOR (RFC 8949) needed by the balance and datum codecs:
//! heads with big-endian length arguments, indefinite-length markers and tags.

use super::error::DecodeError;

pub const MAJOR_UNSIGNED: u8 = 0;
pub const MAJOR_NEGATIVE: u8 = 1;
pub const MAJOR_BYTES: u8 = 2;
pub const MAJOR_TEXT: u8 = 3;
pub const MAJOR_ARRAY: u8 = 4;
pub const MAJOR_MAP: u8 = 5;
pub const MAJOR_TAG: u8 = 6;

/// Additional-info value announcing an indefinite-length item.
pub const INDEFINITE: u8 = 0x1f;
/// Terminates an indefinite-length item.
pub const BREAK: u8 = 0xff;

/// Write a head: major type plus the shortest big-endian argument encoding.
pub fn write_head(out: &mut Vec<u8>, major: u8, value: u64) {
    let m = major << 5;
    match value {
        0..=0x17 => out.push(m | value as u8),
        0x18..=0xff => {
            out.push(m | 0x18);
            out.push(value as u8);
        }
        0x100..=0xffff => {
            out.push(m | 0x19);
            out.extend_from_slice(&(value as u16).to_be_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(m | 0x1a);
            out.extend_from_slice(&(value as u32).to_be_bytes());
        }
        _ => {
            out.push(m | 0x1b);
            out.extend_from_slice(&value.to_be_bytes());
        }
    }
}

pub fn write_indefinite(out: &mut Vec<u8>, major: u8) {
    out.push((major << 5) | INDEFINITE);
}

/// A decoded head. `argument` is `None` for indefinite-length items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Head {
    pub major: u8,
    pub argument: Option<u64>,
}

/// Decode the big-endian argument that follows an initial byte.
///
/// Returns the value and the number of bytes consumed after the initial byte,
/// or `None` when the additional info is reserved, indefinite, or truncated.
pub fn read_argument(info: u8, rest: &[u8]) -> Option<(u64, usize)> {
    let width = match info {
        0..=0x17 => return Some((u64::from(info), 0)),
        0x18 => 1,
        0x19 => 2,
        0x1a => 4,
        0x1b => 8,
        _ => return None,
    };
    let bytes = rest.get(..width)?;
    let value = bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    Some((value, width))
}

/// Nesting limit for container items; datums are attacker-supplied.
pub const MAX_DEPTH: usize = 64;

/// Forward-only cursor over a CBOR byte string.
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            depth: 0,
        }
    }

    pub fn descend(&mut self) -> Result<(), DecodeError> {
        if self.depth >= MAX_DEPTH {
            return Err(self.malformed(format!("nesting deeper than {MAX_DEPTH}")));
        }
        self.depth += 1;
        Ok(())
    }

    pub fn ascend(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn malformed(&self, reason: impl Into<String>) -> DecodeError {
        DecodeError::Malformed {
            offset: self.pos,
            reason: reason.into(),
        }
    }

    pub fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    /// Consume a break marker if one is next.
    pub fn take_break(&mut self) -> bool {
        if self.peek() == Some(BREAK) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub fn head(&mut self) -> Result<Head, DecodeError> {
        let initial = self
            .peek()
            .ok_or_else(|| self.malformed("unexpected end of input"))?;
        let major = initial >> 5;
        let info = initial & 0x1f;
        if info == INDEFINITE {
            if !matches!(major, MAJOR_BYTES | MAJOR_TEXT | MAJOR_ARRAY | MAJOR_MAP) {
                return Err(self.malformed(format!(
                    "indefinite length not allowed for major type {major}"
                )));
            }
            self.pos += 1;
            return Ok(Head {
                major,
                argument: None,
            });
        }
        let (value, used) = read_argument(info, &self.bytes[self.pos + 1..])
            .ok_or_else(|| self.malformed(format!("bad argument encoding {info:#x}")))?;
        self.pos += 1 + used;
        Ok(Head {
            major,
            argument: Some(value),
        })
    }

    pub fn take(&mut self, len: u64) -> Result<&'a [u8], DecodeError> {
        let len = usize::try_from(len).map_err(|_| self.malformed("length overflows usize"))?;
        if len > self.remaining() {
            return Err(self.malformed(format!(
                "need {len} bytes, {} remain",
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}
