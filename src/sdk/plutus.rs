//! Structured values as the on-chain script sees them, with their CBOR form.
//!
//! Encoding follows the ledger's canonical choices so that a value built here is
//! byte-identical to one built by the reference serialization library:
//! constructors use compact tags `121..=127` / `1280..=1400` and fall back to
//! tag `102`, non-empty lists are indefinite-length, and byte strings longer
//! than 64 bytes are chunked.

use super::cbor::{
    self, MAJOR_ARRAY, MAJOR_BYTES, MAJOR_MAP, MAJOR_NEGATIVE, MAJOR_TAG, MAJOR_UNSIGNED, Reader,
};
use super::error::DecodeError;

const BYTES_CHUNK: usize = 64;
const TAG_POSITIVE_BIGNUM: u64 = 2;
const TAG_NEGATIVE_BIGNUM: u64 = 3;
const TAG_GENERAL_CONSTR: u64 = 102;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlutusData {
    Constr { alternative: u64, fields: Vec<PlutusData> },
    Map(Vec<(PlutusData, PlutusData)>),
    List(Vec<PlutusData>),
    Integer(i128),
    Bytes(Vec<u8>),
}

impl PlutusData {
    pub fn constr(alternative: u64, fields: Vec<PlutusData>) -> Self {
        Self::Constr {
            alternative,
            fields,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Constr { .. } => "constructor",
            Self::Map(_) => "map",
            Self::List(_) => "list",
            Self::Integer(_) => "integer",
            Self::Bytes(_) => "byte string",
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i128> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn to_cbor(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write(&mut out);
        out
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_cbor())
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(bytes);
        let value = read_data(&mut reader)?;
        match reader.remaining() {
            0 => Ok(value),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }

    pub fn from_hex(text: &str) -> Result<Self, DecodeError> {
        let bytes = hex::decode(text.trim()).map_err(|e| DecodeError::Malformed {
            offset: 0,
            reason: format!("invalid hex: {e}"),
        })?;
        Self::from_cbor(&bytes)
    }

    fn write(&self, out: &mut Vec<u8>) {
        match self {
            Self::Constr {
                alternative,
                fields,
            } => match alternative {
                0..=6 => {
                    cbor::write_head(out, MAJOR_TAG, 121 + alternative);
                    write_list(out, fields);
                }
                7..=127 => {
                    cbor::write_head(out, MAJOR_TAG, 1280 + alternative - 7);
                    write_list(out, fields);
                }
                _ => {
                    cbor::write_head(out, MAJOR_TAG, TAG_GENERAL_CONSTR);
                    cbor::write_head(out, MAJOR_ARRAY, 2);
                    cbor::write_head(out, MAJOR_UNSIGNED, *alternative);
                    write_list(out, fields);
                }
            },
            Self::Map(entries) => {
                cbor::write_head(out, MAJOR_MAP, entries.len() as u64);
                for (k, v) in entries {
                    k.write(out);
                    v.write(out);
                }
            }
            Self::List(items) => write_list(out, items),
            Self::Integer(i) => write_integer(out, *i),
            Self::Bytes(b) => write_bytes(out, b),
        }
    }
}

fn write_list(out: &mut Vec<u8>, items: &[PlutusData]) {
    if items.is_empty() {
        cbor::write_head(out, MAJOR_ARRAY, 0);
        return;
    }
    cbor::write_indefinite(out, MAJOR_ARRAY);
    for item in items {
        item.write(out);
    }
    out.push(cbor::BREAK);
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    if bytes.len() <= BYTES_CHUNK {
        cbor::write_head(out, MAJOR_BYTES, bytes.len() as u64);
        out.extend_from_slice(bytes);
        return;
    }
    cbor::write_indefinite(out, MAJOR_BYTES);
    for chunk in bytes.chunks(BYTES_CHUNK) {
        cbor::write_head(out, MAJOR_BYTES, chunk.len() as u64);
        out.extend_from_slice(chunk);
    }
    out.push(cbor::BREAK);
}

fn write_integer(out: &mut Vec<u8>, value: i128) {
    if value >= 0 {
        match u64::try_from(value) {
            Ok(v) => cbor::write_head(out, MAJOR_UNSIGNED, v),
            Err(_) => write_bignum(out, TAG_POSITIVE_BIGNUM, value as u128),
        }
    } else {
        // CBOR stores -1 - n.
        let magnitude = (-(value + 1)) as u128;
        match u64::try_from(magnitude) {
            Ok(v) => cbor::write_head(out, MAJOR_NEGATIVE, v),
            Err(_) => write_bignum(out, TAG_NEGATIVE_BIGNUM, magnitude),
        }
    }
}

fn write_bignum(out: &mut Vec<u8>, tag: u64, magnitude: u128) {
    cbor::write_head(out, MAJOR_TAG, tag);
    let be = magnitude.to_be_bytes();
    let first = be.iter().position(|b| *b != 0).unwrap_or(be.len() - 1);
    write_bytes(out, &be[first..]);
}

fn read_data(r: &mut Reader<'_>) -> Result<PlutusData, DecodeError> {
    r.descend()?;
    let value = read_item(r);
    r.ascend();
    value
}

fn read_item(r: &mut Reader<'_>) -> Result<PlutusData, DecodeError> {
    let start = r.position();
    let head = r.head()?;
    match (head.major, head.argument) {
        (MAJOR_UNSIGNED, Some(v)) => Ok(PlutusData::Integer(i128::from(v))),
        (MAJOR_NEGATIVE, Some(v)) => Ok(PlutusData::Integer(-1 - i128::from(v))),
        (MAJOR_BYTES, len) => read_bytes(r, len).map(PlutusData::Bytes),
        (MAJOR_ARRAY, len) => read_items(r, len).map(PlutusData::List),
        (MAJOR_MAP, len) => read_map(r, len),
        (MAJOR_TAG, Some(tag)) => read_tagged(r, tag, start),
        (major, _) => Err(DecodeError::Malformed {
            offset: start,
            reason: format!("major type {major} is not valid structured data"),
        }),
    }
}

fn read_bytes(r: &mut Reader<'_>, len: Option<u64>) -> Result<Vec<u8>, DecodeError> {
    if let Some(len) = len {
        return r.take(len).map(<[u8]>::to_vec);
    }
    let mut buf = Vec::new();
    while !r.take_break() {
        let chunk = r.head()?;
        match (chunk.major, chunk.argument) {
            (MAJOR_BYTES, Some(n)) => buf.extend_from_slice(r.take(n)?),
            _ => return Err(r.malformed("byte string chunk expected")),
        }
    }
    Ok(buf)
}

fn read_items(r: &mut Reader<'_>, len: Option<u64>) -> Result<Vec<PlutusData>, DecodeError> {
    let mut items = Vec::new();
    match len {
        Some(n) => {
            for _ in 0..n {
                items.push(read_data(r)?);
            }
        }
        None => {
            while !r.take_break() {
                items.push(read_data(r)?);
            }
        }
    }
    Ok(items)
}

fn read_map(r: &mut Reader<'_>, len: Option<u64>) -> Result<PlutusData, DecodeError> {
    let mut entries = Vec::new();
    match len {
        Some(n) => {
            for _ in 0..n {
                let k = read_data(r)?;
                entries.push((k, read_data(r)?));
            }
        }
        None => {
            while !r.take_break() {
                let k = read_data(r)?;
                entries.push((k, read_data(r)?));
            }
        }
    }
    Ok(PlutusData::Map(entries))
}

fn read_tagged(r: &mut Reader<'_>, tag: u64, start: usize) -> Result<PlutusData, DecodeError> {
    let alternative = match tag {
        121..=127 => tag - 121,
        1280..=1400 => tag - 1280 + 7,
        TAG_GENERAL_CONSTR => {
            let head = r.head()?;
            if head != (cbor::Head { major: MAJOR_ARRAY, argument: Some(2) }) {
                return Err(r.malformed("general constructor must be a 2-element array"));
            }
            let alt = match read_data(r)? {
                PlutusData::Integer(i) => u64::try_from(i)
                    .map_err(|_| r.malformed("constructor index out of range"))?,
                _ => return Err(r.malformed("constructor index must be an integer")),
            };
            let fields = read_fields(r)?;
            return Ok(PlutusData::constr(alt, fields));
        }
        TAG_POSITIVE_BIGNUM | TAG_NEGATIVE_BIGNUM => {
            let magnitude = match read_data(r)? {
                PlutusData::Bytes(b) => b,
                _ => return Err(r.malformed("bignum payload must be a byte string")),
            };
            if magnitude.len() > 16 {
                return Err(r.malformed("bignum wider than 128 bits"));
            }
            let v = magnitude
                .iter()
                .fold(0u128, |acc, b| (acc << 8) | u128::from(*b));
            let v = i128::try_from(v).map_err(|_| r.malformed("bignum overflows i128"))?;
            return Ok(PlutusData::Integer(if tag == TAG_POSITIVE_BIGNUM {
                v
            } else {
                -1 - v
            }));
        }
        _ => {
            return Err(DecodeError::Malformed {
                offset: start,
                reason: format!("unsupported tag {tag}"),
            });
        }
    };
    let fields = read_fields(r)?;
    Ok(PlutusData::constr(alternative, fields))
}

fn read_fields(r: &mut Reader<'_>) -> Result<Vec<PlutusData>, DecodeError> {
    let head = r.head()?;
    if head.major != MAJOR_ARRAY {
        return Err(r.malformed("constructor fields must be an array"));
    }
    read_items(r, head.argument)
}
