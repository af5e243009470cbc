//! Parser for the tagged metadata records stored in `*LV!` chunks.
//!
//! Each record is `[type: u8][name_len: u8][name: UTF-16LE, name_len code
//! units including the terminator][value]`. Compound records (type 11) carry a
//! `[count: u32][byte_len: u64]` header followed by their child records;
//! `byte_len` spans the header and children, so a reader can skip a compound
//! it does not care about.

use crate::Nd2Error;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom};

const TYPE_BOOL: u8 = 1;
const TYPE_I32: u8 = 2;
const TYPE_U32: u8 = 3;
const TYPE_I64: u8 = 4;
const TYPE_U64: u8 = 5;
const TYPE_F64: u8 = 6;
const TYPE_PTR: u8 = 7;
const TYPE_STRING: u8 = 8;
const TYPE_BYTES: u8 = 9;
const TYPE_LEVEL: u8 = 11;

/// One decoded metadata value. Integer widths are collapsed to `i64`; the
/// attribute fields this crate reads all fit comfortably.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Variant {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Level(Vec<(String, Variant)>),
}

impl Variant {
    /// Depth-first search for a named field, starting at this value.
    pub(crate) fn find(&self, name: &str) -> Option<&Variant> {
        match self {
            Variant::Level(fields) => {
                for (field, value) in fields {
                    if field == name {
                        return Some(value);
                    }
                    if let Some(hit) = value.find(name) {
                        return Some(hit);
                    }
                }
                None
            }
            _ => None,
        }
    }

    pub(crate) fn as_int(&self) -> Option<i64> {
        match *self {
            Variant::Int(v) => Some(v),
            Variant::Float(v) => Some(v as i64),
            _ => None,
        }
    }
}

/// Decode the single root record of a metadata chunk.
pub(crate) fn parse_root(data: &[u8]) -> Result<(String, Variant), Nd2Error> {
    let mut cur = Cursor::new(data);
    parse_record(&mut cur)
}

fn parse_record(cur: &mut Cursor<&[u8]>) -> Result<(String, Variant), Nd2Error> {
    let ty = cur.read_u8()?;
    let name_units = cur.read_u8()? as usize;
    let name = read_utf16(cur, name_units)?;
    let value = match ty {
        TYPE_BOOL => Variant::Bool(cur.read_u8()? != 0),
        TYPE_I32 => Variant::Int(i64::from(cur.read_i32::<LittleEndian>()?)),
        TYPE_U32 => Variant::Int(i64::from(cur.read_u32::<LittleEndian>()?)),
        TYPE_I64 => Variant::Int(cur.read_i64::<LittleEndian>()?),
        TYPE_U64 | TYPE_PTR => Variant::Int(cur.read_u64::<LittleEndian>()? as i64),
        TYPE_F64 => Variant::Float(cur.read_f64::<LittleEndian>()?),
        TYPE_STRING => Variant::Str(read_utf16_nul(cur)?),
        TYPE_BYTES => {
            let len = cur.read_u64::<LittleEndian>()? as usize;
            let mut buf = vec![0u8; len];
            cur.read_exact(&mut buf)?;
            Variant::Bytes(buf)
        }
        TYPE_LEVEL => {
            let start = cur.position();
            let count = cur.read_u32::<LittleEndian>()?;
            let byte_len = cur.read_u64::<LittleEndian>()?;
            let mut fields = Vec::with_capacity(count as usize);
            for _ in 0..count {
                fields.push(parse_record(cur)?);
            }
            // Files append an offset table after the children; byte_len is
            // authoritative for where the compound ends.
            cur.seek(SeekFrom::Start(start + byte_len))?;
            Variant::Level(fields)
        }
        other => {
            return Err(Nd2Error::Unsupported(format!(
                "metadata value type {other} for field {name:?}"
            )));
        }
    };
    Ok((name, value))
}

/// Read `units` UTF-16 code units and drop everything from the first NUL on.
fn read_utf16(cur: &mut Cursor<&[u8]>, units: usize) -> Result<String, Nd2Error> {
    let mut buf = Vec::with_capacity(units);
    for _ in 0..units {
        let unit = cur.read_u16::<LittleEndian>()?;
        if unit == 0 {
            let remaining = units - buf.len() - 1;
            cur.seek(SeekFrom::Current(2 * remaining as i64))?;
            break;
        }
        buf.push(unit);
    }
    Ok(String::from_utf16_lossy(&buf))
}

/// Read UTF-16 code units up to (and consuming) the NUL terminator.
fn read_utf16_nul(cur: &mut Cursor<&[u8]>) -> Result<String, Nd2Error> {
    let mut buf = Vec::new();
    loop {
        let unit = cur.read_u16::<LittleEndian>()?;
        if unit == 0 {
            break;
        }
        buf.push(unit);
    }
    Ok(String::from_utf16_lossy(&buf))
}

/// Encode one record. Used by the fixture writer; integers are emitted as
/// their narrowest unsigned form to match what acquisition software writes.
pub(crate) fn encode_record(out: &mut Vec<u8>, name: &str, value: &Variant) {
    let ty = match value {
        Variant::Bool(_) => TYPE_BOOL,
        Variant::Int(v) if *v >= 0 && *v <= i64::from(u32::MAX) => TYPE_U32,
        Variant::Int(_) => TYPE_I64,
        Variant::Float(_) => TYPE_F64,
        Variant::Str(_) => TYPE_STRING,
        Variant::Bytes(_) => TYPE_BYTES,
        Variant::Level(_) => TYPE_LEVEL,
    };
    out.push(ty);
    let units: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
    assert!(units.len() <= u8::MAX as usize, "field name too long");
    out.push(units.len() as u8);
    for unit in &units {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    match value {
        Variant::Bool(v) => out.push(u8::from(*v)),
        Variant::Int(v) if ty == TYPE_U32 => out.extend_from_slice(&(*v as u32).to_le_bytes()),
        Variant::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
        Variant::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
        Variant::Str(v) => {
            for unit in v.encode_utf16().chain(std::iter::once(0)) {
                out.extend_from_slice(&unit.to_le_bytes());
            }
        }
        Variant::Bytes(v) => {
            out.extend_from_slice(&(v.len() as u64).to_le_bytes());
            out.extend_from_slice(v);
        }
        Variant::Level(fields) => {
            let mut body = Vec::new();
            for (field, child) in fields {
                encode_record(&mut body, field, child);
            }
            out.extend_from_slice(&(fields.len() as u32).to_le_bytes());
            out.extend_from_slice(&(12 + body.len() as u64).to_le_bytes());
            out.extend_from_slice(&body);
        }
    }
}
