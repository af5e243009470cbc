//! Chunk grammar of the ND2 container.
//!
//! Every chunk is `[magic: u32][name_len: u32][data_len: u64][name][data]`,
//! little-endian. The last 40 bytes of the file are a trailer holding the
//! chunk map signature and the absolute offset of the chunk map chunk. The
//! map payload is a run of `[name ending in '!'][offset: u64][size: u64]`
//! entries terminated by an entry named with the map signature; only the
//! offsets are needed to locate chunks.

use crate::Nd2Error;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Seek, SeekFrom};

pub(crate) const CHUNK_MAGIC: u32 = 0x0ABE_CEDA;
pub(crate) const FILE_SIGNATURE: &[u8] = b"ND2 FILE SIGNATURE CHUNK NAME01!";
pub(crate) const FILEMAP_NAME: &[u8] = b"ND2 FILEMAP SIGNATURE NAME 0001!";
pub(crate) const MAP_TERMINATOR: &[u8] = b"ND2 CHUNK MAP SIGNATURE 0000001!";
pub(crate) const ATTRIBUTES_NAME: &str = "ImageAttributesLV!";
pub(crate) const TRAILER_LEN: u64 = 40;

fn eof_as_truncated(err: std::io::Error, what: &str) -> Nd2Error {
    if err.kind() == ErrorKind::UnexpectedEof {
        Nd2Error::Truncated(what.to_string())
    } else {
        Nd2Error::Io(err)
    }
}

pub(crate) struct RawChunk {
    pub(crate) name: Vec<u8>,
    pub(crate) data: Vec<u8>,
}

/// Read the chunk starting at `offset`, validating its magic.
pub(crate) fn read_chunk_at<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
) -> Result<RawChunk, Nd2Error> {
    reader.seek(SeekFrom::Start(offset))?;
    let magic = reader
        .read_u32::<LittleEndian>()
        .map_err(|e| eof_as_truncated(e, "chunk header"))?;
    if magic != CHUNK_MAGIC {
        return Err(Nd2Error::NotNd2(format!(
            "bad chunk magic {magic:#010x} at offset {offset}"
        )));
    }
    let name_len = reader
        .read_u32::<LittleEndian>()
        .map_err(|e| eof_as_truncated(e, "chunk header"))?;
    let data_len = reader
        .read_u64::<LittleEndian>()
        .map_err(|e| eof_as_truncated(e, "chunk header"))?;
    let name = read_declared(reader, u64::from(name_len), "chunk name")?;
    let data = read_declared(reader, data_len, "chunk data")?;
    Ok(RawChunk { name, data })
}

/// Read a header-declared number of bytes. The allocation follows the bytes
/// actually present, and a shortfall is a truncation error.
fn read_declared<R: Read>(reader: &mut R, len: u64, what: &str) -> Result<Vec<u8>, Nd2Error> {
    let mut buf = Vec::new();
    reader.take(len).read_to_end(&mut buf)?;
    if (buf.len() as u64) < len {
        return Err(Nd2Error::Truncated(what.to_string()));
    }
    Ok(buf)
}

/// Chunk name to absolute file offset, parsed from the trailing chunk map.
pub(crate) struct ChunkMap {
    chunks: HashMap<String, u64>,
}

impl ChunkMap {
    pub(crate) fn read<R: Read + Seek>(reader: &mut R) -> Result<ChunkMap, Nd2Error> {
        let file_len = reader.seek(SeekFrom::End(0))?;
        if file_len < TRAILER_LEN {
            return Err(Nd2Error::Truncated("missing chunk map trailer".to_string()));
        }
        reader.seek(SeekFrom::Start(file_len - TRAILER_LEN))?;
        let mut trailer = [0u8; TRAILER_LEN as usize];
        reader
            .read_exact(&mut trailer)
            .map_err(|e| eof_as_truncated(e, "chunk map trailer"))?;
        if &trailer[..32] != MAP_TERMINATOR {
            return Err(Nd2Error::NotNd2("missing chunk map signature".to_string()));
        }
        let map_offset = LittleEndian::read_u64(&trailer[32..]);
        let map = read_chunk_at(reader, map_offset)?;
        if !map.name.starts_with(FILEMAP_NAME) {
            return Err(Nd2Error::NotNd2("chunk map is not a filemap".to_string()));
        }

        let mut chunks = HashMap::new();
        let data = map.data.as_slice();
        let mut pos = 0;
        loop {
            let Some(bang) = data[pos..].iter().position(|&b| b == b'!') else {
                return Err(Nd2Error::Truncated(
                    "unterminated chunk map entry".to_string(),
                ));
            };
            let name_end = pos + bang + 1;
            let name = &data[pos..name_end];
            if name == MAP_TERMINATOR {
                break;
            }
            if data.len() < name_end + 16 {
                return Err(Nd2Error::Truncated("chunk map entry cut short".to_string()));
            }
            let offset = LittleEndian::read_u64(&data[name_end..name_end + 8]);
            chunks.insert(String::from_utf8_lossy(name).into_owned(), offset);
            pos = name_end + 16;
        }
        Ok(ChunkMap { chunks })
    }

    pub(crate) fn offset(&self, name: &str) -> Option<u64> {
        self.chunks.get(name).copied()
    }
}
