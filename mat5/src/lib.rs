//! Level 5 MAT-file writing and reading for numeric arrays.
//!
//! The writer produces files MATLAB and scipy load directly: a 128-byte
//! header, then one `miMATRIX` element per variable holding array flags,
//! dimensions, the variable name, and the real data in column-major order.
//! Elements of four bytes or fewer use the packed small-element tag. The
//! reader understands exactly the subset the writer emits, plus
//! zlib-compressed elements, which is enough to load those files back.

#![deny(missing_docs)]

mod read;
mod write;

pub use read::{read_all, read_file};
pub use write::{write_array, MatWriter};

use ndarray::ArrayD;

pub(crate) const MI_INT8: u32 = 1;
pub(crate) const MI_INT32: u32 = 5;
pub(crate) const MI_UINT32: u32 = 6;
pub(crate) const MI_MATRIX: u32 = 14;
pub(crate) const MI_COMPRESSED: u32 = 15;

/// Errors produced while writing or reading a MAT-file.
#[derive(Debug, thiserror::Error)]
pub enum Mat5Error {
    /// The bytes do not follow the Level 5 layout.
    #[error("not a MAT-file: {0}")]
    NotMat(String),
    /// The file ends before a structure it promises.
    #[error("truncated MAT-file: {0}")]
    Truncated(String),
    /// Valid layout, but a feature this crate does not handle.
    #[error("unsupported MAT-file feature: {0}")]
    Unsupported(String),
    /// Underlying read or write failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Numeric array classes this crate stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatClass {
    /// `mxDOUBLE_CLASS`, 64-bit float.
    Double,
    /// `mxSINGLE_CLASS`, 32-bit float.
    Single,
    /// `mxINT8_CLASS`.
    Int8,
    /// `mxUINT8_CLASS`.
    Uint8,
    /// `mxINT16_CLASS`.
    Int16,
    /// `mxUINT16_CLASS`.
    Uint16,
    /// `mxINT32_CLASS`.
    Int32,
    /// `mxUINT32_CLASS`.
    Uint32,
}

impl MatClass {
    pub(crate) fn mx_code(self) -> u8 {
        match self {
            MatClass::Double => 6,
            MatClass::Single => 7,
            MatClass::Int8 => 8,
            MatClass::Uint8 => 9,
            MatClass::Int16 => 10,
            MatClass::Uint16 => 11,
            MatClass::Int32 => 12,
            MatClass::Uint32 => 13,
        }
    }

    pub(crate) fn from_mx(code: u8) -> Option<MatClass> {
        Some(match code {
            6 => MatClass::Double,
            7 => MatClass::Single,
            8 => MatClass::Int8,
            9 => MatClass::Uint8,
            10 => MatClass::Int16,
            11 => MatClass::Uint16,
            12 => MatClass::Int32,
            13 => MatClass::Uint32,
            _ => return None,
        })
    }

    /// The storage type tag this class is written with.
    pub(crate) fn mi_code(self) -> u32 {
        match self {
            MatClass::Double => 9,
            MatClass::Single => 7,
            MatClass::Int8 => 1,
            MatClass::Uint8 => 2,
            MatClass::Int16 => 3,
            MatClass::Uint16 => 4,
            MatClass::Int32 => 5,
            MatClass::Uint32 => 6,
        }
    }

    pub(crate) fn sample_bytes(self) -> usize {
        match self {
            MatClass::Double => 8,
            MatClass::Single | MatClass::Int32 | MatClass::Uint32 => 4,
            MatClass::Int16 | MatClass::Uint16 => 2,
            MatClass::Int8 | MatClass::Uint8 => 1,
        }
    }
}

/// A numeric array tagged with its MAT-file class.
#[derive(Debug, Clone)]
pub enum MatArray {
    /// 64-bit float array.
    F64(ArrayD<f64>),
    /// 32-bit float array.
    F32(ArrayD<f32>),
    /// 8-bit signed array.
    I8(ArrayD<i8>),
    /// 8-bit unsigned array.
    U8(ArrayD<u8>),
    /// 16-bit signed array.
    I16(ArrayD<i16>),
    /// 16-bit unsigned array.
    U16(ArrayD<u16>),
    /// 32-bit signed array.
    I32(ArrayD<i32>),
    /// 32-bit unsigned array.
    U32(ArrayD<u32>),
}

macro_rules! mat_array_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {$(
        impl From<ArrayD<$ty>> for MatArray {
            fn from(array: ArrayD<$ty>) -> Self {
                MatArray::$variant(array)
            }
        }
    )*};
}

mat_array_from!(
    f64 => F64,
    f32 => F32,
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
);

impl MatArray {
    /// Logical shape, outermost axis first.
    pub fn shape(&self) -> &[usize] {
        match self {
            MatArray::F64(a) => a.shape(),
            MatArray::F32(a) => a.shape(),
            MatArray::I8(a) => a.shape(),
            MatArray::U8(a) => a.shape(),
            MatArray::I16(a) => a.shape(),
            MatArray::U16(a) => a.shape(),
            MatArray::I32(a) => a.shape(),
            MatArray::U32(a) => a.shape(),
        }
    }

    /// MAT-file class this array is stored as.
    pub fn class(&self) -> MatClass {
        match self {
            MatArray::F64(_) => MatClass::Double,
            MatArray::F32(_) => MatClass::Single,
            MatArray::I8(_) => MatClass::Int8,
            MatArray::U8(_) => MatClass::Uint8,
            MatArray::I16(_) => MatClass::Int16,
            MatArray::U16(_) => MatClass::Uint16,
            MatArray::I32(_) => MatClass::Int32,
            MatArray::U32(_) => MatClass::Uint32,
        }
    }

    /// Number of stored elements.
    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    /// True when the array holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn header_bytes_are_fixed() {
        let mut writer = MatWriter::new(Vec::new()).unwrap();
        writer
            .put("mov", &MatArray::from(array![[1.0f64, 2.0]].into_dyn()))
            .unwrap();
        let bytes = writer.finish().unwrap();
        assert!(bytes.starts_with(b"MATLAB 5.0 MAT-file"));
        // description is space-padded out to 116 bytes
        assert_eq!(bytes[115], b' ');
        // no subsystem data
        assert_eq!(&bytes[116..124], &[0u8; 8]);
        // version 0x0100, little-endian indicator
        assert_eq!(&bytes[124..126], &[0x00, 0x01]);
        assert_eq!(&bytes[126..128], b"IM");
        assert_eq!(bytes.len() % 8, 0);
    }

    #[test]
    fn uint16_matrix_layout_matches_convention() {
        let array = MatArray::from(array![[1u16, 2], [3, 4]].into_dyn());
        let mut writer = MatWriter::new(Vec::new()).unwrap();
        writer.put("mov", &array).unwrap();
        let bytes = writer.finish().unwrap();

        let mut expected = Vec::new();
        // matrix element tag
        expected.extend_from_slice(&14u32.to_le_bytes());
        expected.extend_from_slice(&56u32.to_le_bytes());
        // array flags: class mxUINT16, no logical/global/complex bits
        expected.extend_from_slice(&6u32.to_le_bytes());
        expected.extend_from_slice(&8u32.to_le_bytes());
        expected.extend_from_slice(&11u32.to_le_bytes());
        expected.extend_from_slice(&0u32.to_le_bytes());
        // dimensions 2 x 2
        expected.extend_from_slice(&5u32.to_le_bytes());
        expected.extend_from_slice(&8u32.to_le_bytes());
        expected.extend_from_slice(&2i32.to_le_bytes());
        expected.extend_from_slice(&2i32.to_le_bytes());
        // name in a small element: three miINT8 bytes
        expected.extend_from_slice(&[1, 0, 3, 0]);
        expected.extend_from_slice(b"mov\0");
        // data, column-major
        expected.extend_from_slice(&4u32.to_le_bytes());
        expected.extend_from_slice(&8u32.to_le_bytes());
        for v in [1u16, 3, 2, 4] {
            expected.extend_from_slice(&v.to_le_bytes());
        }
        assert_eq!(&bytes[128..], expected.as_slice());
    }

    #[test]
    fn three_dim_single_round_trips() {
        let (d0, d1, d2) = (2, 3, 4);
        let values: Vec<f32> = (0..d0 * d1 * d2).map(|i| i as f32).collect();
        let array =
            ArrayD::from_shape_vec(ndarray::IxDyn(&[d0, d1, d2]), values).unwrap();
        let mut writer = MatWriter::new(Vec::new()).unwrap();
        writer.put("mov", &MatArray::from(array.clone())).unwrap();
        let bytes = writer.finish().unwrap();

        let entries = read_all(bytes.as_slice()).unwrap();
        assert_eq!(entries.len(), 1);
        let (name, loaded) = &entries[0];
        assert_eq!(name, "mov");
        assert_eq!(loaded.shape(), [d0, d1, d2]);
        let MatArray::F32(loaded) = loaded else {
            panic!("expected single-precision array");
        };
        for i in 0..d0 {
            for j in 0..d1 {
                for k in 0..d2 {
                    assert_eq!(loaded[[i, j, k]], array[[i, j, k]]);
                }
            }
        }
    }

    #[test]
    fn compressed_variables_round_trip() {
        let values: Vec<f64> = (0..64).map(|i| f64::from(i % 8)).collect();
        let array = ArrayD::from_shape_vec(ndarray::IxDyn(&[8, 8]), values).unwrap();
        let mut writer = MatWriter::new(Vec::new()).unwrap().compressed(true);
        writer.put("mov", &MatArray::from(array.clone())).unwrap();
        let bytes = writer.finish().unwrap();

        // first element tag is miCOMPRESSED
        assert_eq!(&bytes[128..132], &15u32.to_le_bytes());
        let entries = read_all(bytes.as_slice()).unwrap();
        let MatArray::F64(loaded) = &entries[0].1 else {
            panic!("expected double array");
        };
        assert_eq!(loaded[[3, 5]], array[[3, 5]]);
        assert_eq!(loaded.shape(), array.shape());
    }

    #[test]
    fn one_dim_arrays_become_row_vectors() {
        let array = ArrayD::from_shape_vec(ndarray::IxDyn(&[5]), vec![1u8, 2, 3, 4, 5]).unwrap();
        let mut writer = MatWriter::new(Vec::new()).unwrap();
        writer.put("v", &MatArray::from(array)).unwrap();
        let bytes = writer.finish().unwrap();
        let entries = read_all(bytes.as_slice()).unwrap();
        assert_eq!(entries[0].1.shape(), [1, 5]);
        let MatArray::U8(loaded) = &entries[0].1 else {
            panic!("expected uint8 array");
        };
        assert_eq!(loaded[[0, 4]], 5);
    }

    #[test]
    fn long_names_and_multiple_variables() {
        let mut writer = MatWriter::new(Vec::new()).unwrap();
        writer
            .put("mov", &MatArray::from(array![[1i32, 2]].into_dyn()))
            .unwrap();
        writer
            .put(
                "acquisition_meta",
                &MatArray::from(array![[7u32, 8], [9, 10]].into_dyn()),
            )
            .unwrap();
        let bytes = writer.finish().unwrap();
        let entries = read_all(bytes.as_slice()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "mov");
        assert_eq!(entries[1].0, "acquisition_meta");
        assert_eq!(entries[1].1.class(), MatClass::Uint32);
    }

    #[test]
    fn rejects_non_mat_bytes() {
        let err = read_all(&b"this is not a mat file at all"[..]).unwrap_err();
        assert!(matches!(err, Mat5Error::Truncated(_)));
        let mut junk = vec![b'x'; 256];
        junk[126] = b'I';
        junk[127] = b'M';
        assert!(matches!(
            read_all(junk.as_slice()).unwrap_err(),
            Mat5Error::NotMat(_)
        ));
    }

    #[test]
    fn writes_and_reads_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.mat");
        let array = MatArray::from(array![[11u16, 12], [13, 14]].into_dyn());
        write_array(&path, "mov", &array).unwrap();
        let entries = read_file(&path).unwrap();
        assert_eq!(entries[0].0, "mov");
        let MatArray::U16(loaded) = &entries[0].1 else {
            panic!("expected uint16 array");
        };
        assert_eq!(loaded[[1, 0]], 13);
    }
}
