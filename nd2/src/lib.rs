//! Reader for Nikon ND2 microscopy files.
//!
//! ND2 is a chunked container. A signature chunk opens the file, a chunk map
//! referenced from a 40-byte trailer locates everything else, image
//! attributes live in a tagged metadata chunk, and each acquisition frame is
//! its own chunk of row-padded interleaved pixels behind an 8-byte
//! timestamp. This crate implements just enough of that layout to pull whole
//! movies out as [`ndarray`] arrays, plus a small [`writer`] for fixtures.

#![deny(missing_docs)]

mod chunk;
mod variant;
pub mod writer;

use crate::chunk::{read_chunk_at, ChunkMap, ATTRIBUTES_NAME, FILE_SIGNATURE};
use crate::variant::Variant;
use flate2::read::ZlibDecoder;
use ndarray::{ArrayD, IxDyn};
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

/// Errors produced while reading an ND2 file.
#[derive(Debug, thiserror::Error)]
pub enum Nd2Error {
    /// The file does not follow the chunked container layout.
    #[error("not an ND2 file: {0}")]
    NotNd2(String),
    /// The file ends before a structure it promises.
    #[error("truncated ND2 file: {0}")]
    Truncated(String),
    /// Valid container, but a layout this reader does not handle.
    #[error("unsupported ND2 feature: {0}")]
    Unsupported(String),
    /// Underlying read failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Element type of decoded pixel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelDtype {
    /// 8 bits per component.
    U8,
    /// 16 bits per component.
    U16,
    /// 32-bit float components.
    F32,
}

impl PixelDtype {
    /// Stored bytes per sample.
    pub fn sample_bytes(self) -> usize {
        match self {
            PixelDtype::U8 => 1,
            PixelDtype::U16 => 2,
            PixelDtype::F32 => 4,
        }
    }
}

/// Compression applied to the pixel payload of each frame chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// zlib-deflated payload.
    Lossless,
    /// Vendor lossy codec; not supported by this reader.
    Lossy,
    /// Raw little-endian pixels.
    Uncompressed,
}

/// Image attributes recorded by the acquisition software.
#[derive(Debug, Clone)]
pub struct Attributes {
    /// Frame width in pixels.
    pub width: usize,
    /// Frame height in pixels.
    pub height: usize,
    /// Interleaved components per pixel.
    pub components: usize,
    /// Bits allocated per component in memory.
    pub bits_per_component: usize,
    /// Bits actually carrying signal per component.
    pub significant_bits: usize,
    /// Stored byte stride of one image row, padding included.
    pub row_bytes: usize,
    /// Number of frames in the acquisition sequence.
    pub sequence_count: usize,
    /// Pixel payload compression.
    pub compression: Compression,
}

impl Attributes {
    fn from_metadata(root: &Variant) -> Result<Attributes, Nd2Error> {
        let require = |name: &str| {
            root.find(name)
                .and_then(Variant::as_int)
                .ok_or_else(|| Nd2Error::Unsupported(format!("image attributes missing {name}")))
        };
        let lookup = |name: &str, default: i64| {
            root.find(name).and_then(Variant::as_int).unwrap_or(default)
        };

        let width = require("uiWidth")? as usize;
        let height = require("uiHeight")? as usize;
        let components = lookup("uiComp", 1) as usize;
        let bits_per_component = require("uiBpcInMemory")? as usize;
        let significant_bits = lookup("uiBpcSignificant", bits_per_component as i64) as usize;
        let tight = width * components * bits_per_component.div_ceil(8);
        let row_bytes = lookup("uiWidthBytes", tight as i64) as usize;
        let sequence_count = lookup("uiSequenceCount", 1) as usize;
        let compression = match lookup("eCompression", 2) {
            0 => Compression::Lossless,
            1 => Compression::Lossy,
            2 => Compression::Uncompressed,
            code => {
                return Err(Nd2Error::Unsupported(format!(
                    "compression code {code} in image attributes"
                )));
            }
        };

        if width == 0 || height == 0 || components == 0 {
            return Err(Nd2Error::Unsupported(format!(
                "degenerate image dimensions {width}x{height}x{components}"
            )));
        }
        if sequence_count == 0 {
            return Err(Nd2Error::Unsupported(
                "empty acquisition sequence".to_string(),
            ));
        }
        if row_bytes < tight {
            return Err(Nd2Error::Unsupported(format!(
                "row stride {row_bytes} below tight width {tight}"
            )));
        }
        Ok(Attributes {
            width,
            height,
            components,
            bits_per_component,
            significant_bits,
            row_bytes,
            sequence_count,
            compression,
        })
    }

    /// Element type the pixel data decodes to.
    pub fn dtype(&self) -> Result<PixelDtype, Nd2Error> {
        match self.bits_per_component {
            8 => Ok(PixelDtype::U8),
            16 => Ok(PixelDtype::U16),
            32 => Ok(PixelDtype::F32),
            bits => Err(Nd2Error::Unsupported(format!(
                "{bits} bits per component"
            ))),
        }
    }
}

/// A decoded acquisition, dimension order `(frames, channels, rows, columns)`
/// with singleton frame and channel axes squeezed away.
#[derive(Debug, Clone)]
pub enum Movie {
    /// 8-bit unsigned pixels.
    U8(ArrayD<u8>),
    /// 16-bit unsigned pixels.
    U16(ArrayD<u16>),
    /// 32-bit float pixels.
    F32(ArrayD<f32>),
}

impl Movie {
    /// Shape after squeezing, outermost axis first.
    pub fn shape(&self) -> &[usize] {
        match self {
            Movie::U8(a) => a.shape(),
            Movie::U16(a) => a.shape(),
            Movie::F32(a) => a.shape(),
        }
    }

    /// Element type of the pixel data.
    pub fn dtype(&self) -> PixelDtype {
        match self {
            Movie::U8(_) => PixelDtype::U8,
            Movie::U16(_) => PixelDtype::U16,
            Movie::F32(_) => PixelDtype::F32,
        }
    }
}

/// An open ND2 file with its chunk map and image attributes parsed.
pub struct Nd2File<R: Read + Seek> {
    reader: R,
    chunks: ChunkMap,
    attrs: Attributes,
}

impl Nd2File<BufReader<File>> {
    /// Open an ND2 file on disk.
    pub fn open(path: &Path) -> Result<Self, Nd2Error> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> Nd2File<R> {
    /// Parse the signature, chunk map, and image attributes from `reader`.
    pub fn from_reader(mut reader: R) -> Result<Self, Nd2Error> {
        let signature = read_chunk_at(&mut reader, 0)?;
        if !signature.name.starts_with(FILE_SIGNATURE) || !signature.data.starts_with(b"Ver") {
            return Err(Nd2Error::NotNd2("missing file signature chunk".to_string()));
        }
        let chunks = ChunkMap::read(&mut reader)?;
        let offset = chunks
            .offset(ATTRIBUTES_NAME)
            .ok_or_else(|| Nd2Error::Unsupported("no image attributes chunk".to_string()))?;
        let raw = read_chunk_at(&mut reader, offset)?;
        let (_, metadata) = variant::parse_root(&raw.data)?;
        let attrs = Attributes::from_metadata(&metadata)?;
        Ok(Nd2File {
            reader,
            chunks,
            attrs,
        })
    }

    /// Attributes shared by every frame.
    pub fn attributes(&self) -> &Attributes {
        &self.attrs
    }

    /// Number of frames in the acquisition sequence.
    pub fn frame_count(&self) -> usize {
        self.attrs.sequence_count
    }

    /// Pixel payload of frame `index`: timestamp stripped, compression
    /// undone, rows still at their stored stride.
    fn frame_pixels(&mut self, index: usize) -> Result<Vec<u8>, Nd2Error> {
        let name = format!("ImageDataSeq|{index}!");
        let offset = self
            .chunks
            .offset(&name)
            .ok_or_else(|| Nd2Error::Truncated(format!("no chunk for frame {index}")))?;
        let raw = read_chunk_at(&mut self.reader, offset)?;
        let mut data = match self.attrs.compression {
            Compression::Lossless => {
                let mut out = Vec::new();
                ZlibDecoder::new(raw.data.as_slice()).read_to_end(&mut out)?;
                out
            }
            Compression::Lossy => {
                return Err(Nd2Error::Unsupported(
                    "lossy-compressed pixel data".to_string(),
                ));
            }
            Compression::Uncompressed => raw.data,
        };
        if data.len() < 8 {
            return Err(Nd2Error::Truncated(format!(
                "frame {index} shorter than its timestamp"
            )));
        }
        data.drain(..8);
        Ok(data)
    }

    /// Decode the whole acquisition into one array ordered
    /// `(frames, channels, rows, columns)`, squeezing singleton frame and
    /// channel axes.
    pub fn read_movie(&mut self) -> Result<Movie, Nd2Error> {
        Ok(match self.attrs.dtype()? {
            PixelDtype::U8 => Movie::U8(self.read_planes::<u8>()?),
            PixelDtype::U16 => Movie::U16(self.read_planes::<u16>()?),
            PixelDtype::F32 => Movie::F32(self.read_planes::<f32>()?),
        })
    }

    fn read_planes<T: Sample>(&mut self) -> Result<ArrayD<T>, Nd2Error> {
        let attrs = self.attrs.clone();
        let (frames, comps) = (attrs.sequence_count, attrs.components);
        let (height, width) = (attrs.height, attrs.width);
        let mut data = Vec::with_capacity(frames * comps * height * width);
        for index in 0..frames {
            let pixels = self.frame_pixels(index)?;
            let needed = (height - 1) * attrs.row_bytes + width * comps * T::BYTES;
            if pixels.len() < needed {
                return Err(Nd2Error::Truncated(format!(
                    "frame {index} holds {} pixel bytes, expected at least {needed}",
                    pixels.len()
                )));
            }
            for comp in 0..comps {
                for row in 0..height {
                    let line = &pixels[row * attrs.row_bytes..];
                    for col in 0..width {
                        data.push(T::from_le(&line[(col * comps + comp) * T::BYTES..]));
                    }
                }
            }
        }
        let mut shape = Vec::with_capacity(4);
        if frames > 1 {
            shape.push(frames);
        }
        if comps > 1 {
            shape.push(comps);
        }
        shape.push(height);
        shape.push(width);
        Ok(ArrayD::from_shape_vec(IxDyn(&shape), data)
            .expect("pixel count matches attribute dimensions"))
    }
}

/// Little-endian sample decoding for the supported pixel types.
trait Sample: Copy {
    const BYTES: usize;
    fn from_le(bytes: &[u8]) -> Self;
}

impl Sample for u8 {
    const BYTES: usize = 1;
    fn from_le(bytes: &[u8]) -> Self {
        bytes[0]
    }
}

impl Sample for u16 {
    const BYTES: usize = 2;
    fn from_le(bytes: &[u8]) -> Self {
        Self::from_le_bytes([bytes[0], bytes[1]])
    }
}

impl Sample for f32 {
    const BYTES: usize = 4;
    fn from_le(bytes: &[u8]) -> Self {
        Self::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

#[cfg(test)]
mod tests {
    use super::writer::Nd2Writer;
    use super::*;
    use std::io::Cursor;

    fn open_bytes(bytes: Vec<u8>) -> Result<Nd2File<Cursor<Vec<u8>>>, Nd2Error> {
        Nd2File::from_reader(Cursor::new(bytes))
    }

    #[test]
    fn single_frame_single_channel_squeezes_to_2d() {
        let (width, height) = (5, 4);
        let mut writer = Nd2Writer::new(width, height, PixelDtype::U16);
        let samples: Vec<u16> = (0..height * width)
            .map(|i| (10 * (i / width) + i % width) as u16)
            .collect();
        writer.push_frame_u16(&samples);
        let mut file = open_bytes(writer.finish().unwrap()).unwrap();

        let attrs = file.attributes();
        assert_eq!(attrs.width, width);
        assert_eq!(attrs.height, height);
        assert_eq!(attrs.components, 1);
        assert_eq!(attrs.bits_per_component, 16);
        assert_eq!(attrs.compression, Compression::Uncompressed);
        assert_eq!(file.frame_count(), 1);

        let movie = file.read_movie().unwrap();
        assert_eq!(movie.dtype(), PixelDtype::U16);
        assert_eq!(movie.shape(), [height, width]);
        let Movie::U16(arr) = movie else {
            panic!("expected u16 movie");
        };
        assert_eq!(arr[[2, 3]], 23);
        assert_eq!(arr[[0, 0]], 0);
        assert_eq!(arr[[3, 4]], 34);
    }

    #[test]
    fn frames_and_channels_deinterleave_in_order() {
        let (width, height, comps, frames) = (3, 2, 2, 2);
        let mut writer = Nd2Writer::new(width, height, PixelDtype::U16).components(comps);
        for frame in 0..frames {
            let mut samples = Vec::new();
            for row in 0..height {
                for col in 0..width {
                    for comp in 0..comps {
                        samples.push((1000 * frame + 100 * comp + 10 * row + col) as u16);
                    }
                }
            }
            writer.push_frame_u16(&samples);
        }
        let mut file = open_bytes(writer.finish().unwrap()).unwrap();
        let movie = file.read_movie().unwrap();
        assert_eq!(movie.shape(), [frames, comps, height, width]);
        let Movie::U16(arr) = movie else {
            panic!("expected u16 movie");
        };
        assert_eq!(arr[[0, 0, 0, 0]], 0);
        assert_eq!(arr[[0, 1, 0, 2]], 102);
        assert_eq!(arr[[1, 0, 1, 1]], 1011);
        assert_eq!(arr[[1, 1, 1, 2]], 1112);
    }

    #[test]
    fn zlib_frames_round_trip() {
        let (width, height) = (8, 6);
        let mut writer =
            Nd2Writer::new(width, height, PixelDtype::U16).compression(Compression::Lossless);
        let samples: Vec<u16> = (0..height * width).map(|i| (i * 7) as u16).collect();
        writer.push_frame_u16(&samples);
        let mut file = open_bytes(writer.finish().unwrap()).unwrap();
        assert_eq!(file.attributes().compression, Compression::Lossless);
        let Movie::U16(arr) = file.read_movie().unwrap() else {
            panic!("expected u16 movie");
        };
        assert_eq!(arr[[0, 0]], 0);
        assert_eq!(arr[[5, 7]], (5 * 8 + 7) * 7);
    }

    #[test]
    fn padded_rows_are_skipped() {
        let (width, height) = (4, 3);
        let mut writer = Nd2Writer::new(width, height, PixelDtype::U16).row_bytes(2 * width + 6);
        let samples: Vec<u16> = (0..height * width).map(|i| i as u16).collect();
        writer.push_frame_u16(&samples);
        let mut file = open_bytes(writer.finish().unwrap()).unwrap();
        assert_eq!(file.attributes().row_bytes, 2 * width + 6);
        let Movie::U16(arr) = file.read_movie().unwrap() else {
            panic!("expected u16 movie");
        };
        for row in 0..height {
            for col in 0..width {
                assert_eq!(arr[[row, col]], (row * width + col) as u16);
            }
        }
    }

    #[test]
    fn u8_and_f32_sample_types_decode() {
        let mut writer = Nd2Writer::new(3, 2, PixelDtype::U8);
        writer.push_frame_u8(&[1, 2, 3, 4, 5, 6]);
        let mut file = open_bytes(writer.finish().unwrap()).unwrap();
        let Movie::U8(arr) = file.read_movie().unwrap() else {
            panic!("expected u8 movie");
        };
        assert_eq!(arr[[1, 2]], 6);

        let mut writer = Nd2Writer::new(2, 2, PixelDtype::F32);
        writer.push_frame_f32(&[0.5, 1.5, 2.5, 3.5]);
        let mut file = open_bytes(writer.finish().unwrap()).unwrap();
        assert_eq!(file.attributes().dtype().unwrap(), PixelDtype::F32);
        let Movie::F32(arr) = file.read_movie().unwrap() else {
            panic!("expected f32 movie");
        };
        assert_eq!(arr[[1, 0]], 2.5);
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut writer = Nd2Writer::new(2, 2, PixelDtype::U8);
        writer.push_frame_u8(&[0, 1, 2, 3]);
        let mut bytes = writer.finish().unwrap();
        bytes[0] ^= 0xFF;
        assert!(matches!(open_bytes(bytes), Err(Nd2Error::NotNd2(_))));
    }

    #[test]
    fn rejects_chunk_lengths_past_the_end_of_file() {
        let mut writer = Nd2Writer::new(2, 2, PixelDtype::U8);
        writer.push_frame_u8(&[0, 1, 2, 3]);
        let mut bytes = writer.finish().unwrap();
        let needle = b"ImageAttributesLV!";
        let name_at = bytes
            .windows(needle.len())
            .position(|window| window == needle)
            .unwrap();
        // the u64 data length sits just before the chunk name
        bytes[name_at - 8..name_at].copy_from_slice(&(1u64 << 40).to_le_bytes());
        assert!(matches!(open_bytes(bytes), Err(Nd2Error::Truncated(_))));
    }

    #[test]
    fn rejects_file_shorter_than_trailer() {
        let mut writer = Nd2Writer::new(2, 2, PixelDtype::U8);
        writer.push_frame_u8(&[0, 1, 2, 3]);
        let mut bytes = writer.finish().unwrap();
        bytes.truncate(20);
        assert!(matches!(open_bytes(bytes), Err(Nd2Error::Truncated(_))));
    }

    #[test]
    fn rejects_lossy_compression() {
        let mut writer =
            Nd2Writer::new(2, 2, PixelDtype::U16).compression(Compression::Lossy);
        writer.push_frame_u16(&[0, 1, 2, 3]);
        let mut file = open_bytes(writer.finish().unwrap()).unwrap();
        assert_eq!(file.attributes().compression, Compression::Lossy);
        assert!(matches!(
            file.read_movie(),
            Err(Nd2Error::Unsupported(_))
        ));
    }

    #[test]
    fn open_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.nd2");
        let mut writer = Nd2Writer::new(3, 3, PixelDtype::U16);
        let samples: Vec<u16> = (0..9).collect();
        writer.push_frame_u16(&samples);
        writer.write_to(&path).unwrap();

        let mut file = Nd2File::open(&path).unwrap();
        let Movie::U16(arr) = file.read_movie().unwrap() else {
            panic!("expected u16 movie");
        };
        assert_eq!(arr[[2, 2]], 8);
    }
}
