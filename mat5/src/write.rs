//! MAT-file serialization.

use crate::{Mat5Error, MatArray, MI_COMPRESSED, MI_INT32, MI_INT8, MI_MATRIX, MI_UINT32};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const HEADER_DESCRIPTION: &[u8] = b"MATLAB 5.0 MAT-file, created by mat5";

/// Streaming writer: header on construction, one matrix element per
/// [`MatWriter::put`].
pub struct MatWriter<W: Write> {
    out: W,
    compress: bool,
}

impl MatWriter<BufWriter<File>> {
    /// Create a MAT-file at `path` and write its header.
    pub fn create(path: &Path) -> Result<Self, Mat5Error> {
        Self::new(BufWriter::new(File::create(path)?))
    }
}

impl<W: Write> MatWriter<W> {
    /// Write the 128-byte header to `out` and wrap it for element writing.
    pub fn new(mut out: W) -> Result<Self, Mat5Error> {
        let mut description = [b' '; 116];
        description[..HEADER_DESCRIPTION.len()].copy_from_slice(HEADER_DESCRIPTION);
        out.write_all(&description)?;
        // subsystem data offset: none
        out.write_all(&[0u8; 8])?;
        // version, then the endianness indicator
        out.write_all(&0x0100u16.to_le_bytes())?;
        out.write_all(b"IM")?;
        Ok(MatWriter {
            out,
            compress: false,
        })
    }

    /// zlib-compress matrix elements as they are written.
    pub fn compressed(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Write one named array.
    pub fn put(&mut self, name: &str, array: &MatArray) -> Result<(), Mat5Error> {
        let mut element = Vec::new();
        write_element(&mut element, MI_MATRIX, &matrix_body(name, array));
        if self.compress {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(&element)?;
            let packed = encoder.finish()?;
            // compressed elements carry no alignment padding
            self.out.write_all(&MI_COMPRESSED.to_le_bytes())?;
            self.out.write_all(&(packed.len() as u32).to_le_bytes())?;
            self.out.write_all(&packed)?;
        } else {
            self.out.write_all(&element)?;
        }
        Ok(())
    }

    /// Flush and hand back the underlying writer.
    pub fn finish(mut self) -> Result<W, Mat5Error> {
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Write a single named array to `path`. Batch conversion produces one
/// variable per file, so this covers the common case.
pub fn write_array(path: &Path, name: &str, array: &MatArray) -> Result<(), Mat5Error> {
    let mut writer = MatWriter::create(path)?;
    writer.put(name, array)?;
    writer.finish()?;
    Ok(())
}

/// Subelements of one `miMATRIX`: flags, dimensions, name, real data.
fn matrix_body(name: &str, array: &MatArray) -> Vec<u8> {
    let class = array.class();
    let mut dims: Vec<i32> = array.shape().iter().map(|&d| d as i32).collect();
    // MATLAB arrays have at least two dimensions; a vector becomes a row
    while dims.len() < 2 {
        dims.insert(0, 1);
    }

    let mut body = Vec::new();
    let mut flags = [0u8; 8];
    flags[0] = class.mx_code();
    write_element(&mut body, MI_UINT32, &flags);

    let mut dim_bytes = Vec::with_capacity(4 * dims.len());
    for dim in &dims {
        dim_bytes.extend_from_slice(&dim.to_le_bytes());
    }
    write_element(&mut body, MI_INT32, &dim_bytes);
    write_element(&mut body, MI_INT8, name.as_bytes());
    write_element(&mut body, class.mi_code(), &column_major_bytes(array));
    body
}

/// Tagged element, packed into the small-element form when the payload fits
/// in four bytes, otherwise padded out to an eight-byte boundary.
fn write_element(out: &mut Vec<u8>, mi_type: u32, payload: &[u8]) {
    if payload.len() <= 4 {
        out.extend_from_slice(&(mi_type | ((payload.len() as u32) << 16)).to_le_bytes());
        let mut data = [0u8; 4];
        data[..payload.len()].copy_from_slice(payload);
        out.extend_from_slice(&data);
    } else {
        out.extend_from_slice(&mi_type.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
        let pad = payload.len().next_multiple_of(8) - payload.len();
        out.extend_from_slice(&[0u8; 8][..pad]);
    }
}

macro_rules! collect_le {
    ($arr:expr, $ty:ty) => {{
        let mut bytes = Vec::with_capacity($arr.len() * std::mem::size_of::<$ty>());
        let transposed = $arr.t();
        for value in &transposed {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes
    }};
}

/// Element bytes in MATLAB's column-major order. Iterating the transposed
/// view walks the first axis fastest, which is that order.
fn column_major_bytes(array: &MatArray) -> Vec<u8> {
    match array {
        MatArray::F64(a) => collect_le!(a, f64),
        MatArray::F32(a) => collect_le!(a, f32),
        MatArray::I8(a) => collect_le!(a, i8),
        MatArray::U8(a) => collect_le!(a, u8),
        MatArray::I16(a) => collect_le!(a, i16),
        MatArray::U16(a) => collect_le!(a, u16),
        MatArray::I32(a) => collect_le!(a, i32),
        MatArray::U32(a) => collect_le!(a, u32),
    }
}
