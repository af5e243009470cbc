//! MAT-file loading for the numeric subset the writer emits.

use crate::{Mat5Error, MatArray, MatClass, MI_COMPRESSED, MI_INT32, MI_INT8, MI_MATRIX, MI_UINT32};
use flate2::read::ZlibDecoder;
use ndarray::{ArrayD, IxDyn};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Load every variable from `reader`, in file order.
pub fn read_all<R: Read>(mut reader: R) -> Result<Vec<(String, MatArray)>, Mat5Error> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    parse_bytes(&bytes)
}

/// Load every variable from the MAT-file at `path`, in file order.
pub fn read_file(path: &Path) -> Result<Vec<(String, MatArray)>, Mat5Error> {
    read_all(File::open(path)?)
}

fn parse_bytes(bytes: &[u8]) -> Result<Vec<(String, MatArray)>, Mat5Error> {
    if bytes.len() < 128 {
        return Err(Mat5Error::Truncated("128-byte header".to_string()));
    }
    if !bytes.starts_with(b"MATLAB 5.0") {
        return Err(Mat5Error::NotMat("unrecognized header text".to_string()));
    }
    if &bytes[126..128] != b"IM" {
        return Err(Mat5Error::Unsupported("big-endian MAT-file".to_string()));
    }

    let mut entries = Vec::new();
    let mut pos = 128;
    while pos < bytes.len() {
        let element = element_at(bytes, pos)?;
        match element.mi_type {
            MI_MATRIX => entries.push(parse_matrix(element.payload)?),
            MI_COMPRESSED => {
                let mut inflated = Vec::new();
                ZlibDecoder::new(element.payload).read_to_end(&mut inflated)?;
                let inner = element_at(&inflated, 0)?;
                if inner.mi_type != MI_MATRIX {
                    return Err(Mat5Error::Unsupported(format!(
                        "compressed element of type {}",
                        inner.mi_type
                    )));
                }
                entries.push(parse_matrix(inner.payload)?);
            }
            other => {
                return Err(Mat5Error::Unsupported(format!(
                    "top-level element type {other}"
                )));
            }
        }
        pos = element.next;
    }
    Ok(entries)
}

struct Element<'a> {
    mi_type: u32,
    payload: &'a [u8],
    next: usize,
}

/// Decode the tag at `pos`, handling both the small-element form and the
/// regular padded form.
fn element_at(bytes: &[u8], pos: usize) -> Result<Element<'_>, Mat5Error> {
    if bytes.len() < pos + 8 {
        return Err(Mat5Error::Truncated("element tag".to_string()));
    }
    let first = u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]);
    if first >> 16 != 0 {
        let len = (first >> 16) as usize;
        if len > 4 {
            return Err(Mat5Error::NotMat(format!("small element of {len} bytes")));
        }
        return Ok(Element {
            mi_type: first & 0xFFFF,
            payload: &bytes[pos + 4..pos + 4 + len],
            next: pos + 8,
        });
    }
    let len = u32::from_le_bytes([
        bytes[pos + 4],
        bytes[pos + 5],
        bytes[pos + 6],
        bytes[pos + 7],
    ]) as usize;
    let start = pos + 8;
    if bytes.len() < start + len {
        return Err(Mat5Error::Truncated("element payload".to_string()));
    }
    // compressed streams are unpadded; everything else aligns to 8
    let next = if first == MI_COMPRESSED {
        start + len
    } else {
        (start + len.next_multiple_of(8)).min(bytes.len())
    };
    Ok(Element {
        mi_type: first,
        payload: &bytes[start..start + len],
        next,
    })
}

fn parse_matrix(body: &[u8]) -> Result<(String, MatArray), Mat5Error> {
    let flags = element_at(body, 0)?;
    if flags.mi_type != MI_UINT32 || flags.payload.len() != 8 {
        return Err(Mat5Error::NotMat("malformed array flags".to_string()));
    }
    let class_code = flags.payload[0];
    let class = MatClass::from_mx(class_code)
        .ok_or_else(|| Mat5Error::Unsupported(format!("array class {class_code}")))?;

    let dims_element = element_at(body, flags.next)?;
    if dims_element.mi_type != MI_INT32 {
        return Err(Mat5Error::NotMat("malformed dimensions".to_string()));
    }
    let mut dims = Vec::with_capacity(dims_element.payload.len() / 4);
    for chunk in dims_element.payload.chunks_exact(4) {
        let dim = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if dim < 0 {
            return Err(Mat5Error::NotMat("negative dimension".to_string()));
        }
        dims.push(dim as usize);
    }

    let name_element = element_at(body, dims_element.next)?;
    if name_element.mi_type != MI_INT8 {
        return Err(Mat5Error::NotMat("malformed array name".to_string()));
    }
    let name = String::from_utf8_lossy(name_element.payload).into_owned();

    let data = element_at(body, name_element.next)?;
    if data.mi_type != class.mi_code() {
        return Err(Mat5Error::Unsupported(format!(
            "storage type {} for class {class:?}",
            data.mi_type
        )));
    }
    let expected = dims.iter().product::<usize>() * class.sample_bytes();
    if data.payload.len() != expected {
        return Err(Mat5Error::Truncated(format!(
            "array data holds {} bytes, expected {expected}",
            data.payload.len()
        )));
    }
    Ok((name, build_array(class, &dims, data.payload)))
}

/// Reshape column-major bytes into a logically indexed array: fill with the
/// dimensions reversed, then swap the axes back.
fn build_array(class: MatClass, dims: &[usize], data: &[u8]) -> MatArray {
    let reversed: Vec<usize> = dims.iter().rev().copied().collect();
    macro_rules! build {
        ($ty:ty, $variant:ident) => {{
            let values: Vec<$ty> = data
                .chunks_exact(std::mem::size_of::<$ty>())
                .map(|chunk| <$ty>::from_le_bytes(chunk.try_into().expect("chunk width")))
                .collect();
            MatArray::$variant(
                ArrayD::from_shape_vec(IxDyn(&reversed), values)
                    .expect("data length matches dimensions")
                    .reversed_axes(),
            )
        }};
    }
    match class {
        MatClass::Double => build!(f64, F64),
        MatClass::Single => build!(f32, F32),
        MatClass::Int8 => build!(i8, I8),
        MatClass::Uint8 => build!(u8, U8),
        MatClass::Int16 => build!(i16, I16),
        MatClass::Uint16 => build!(u16, U16),
        MatClass::Int32 => build!(i32, I32),
        MatClass::Uint32 => build!(u32, U32),
    }
}
