//! Minimal ND2 writer for producing well-formed fixture files.
//!
//! Emits the same container grammar the reader parses: signature chunk,
//! image attribute metadata, one pixel chunk per frame, then the chunk map
//! and trailer. One attribute set per file, frames appended in order.

use crate::chunk::{ATTRIBUTES_NAME, CHUNK_MAGIC, FILEMAP_NAME, FILE_SIGNATURE, MAP_TERMINATOR};
use crate::variant::{encode_record, Variant};
use crate::{Compression, Nd2Error, PixelDtype};
use std::io::Write;
use std::path::Path;

/// Builder for a small ND2 file.
pub struct Nd2Writer {
    width: usize,
    height: usize,
    components: usize,
    dtype: PixelDtype,
    row_bytes: Option<usize>,
    compression: Compression,
    frames: Vec<Vec<u8>>,
}

impl Nd2Writer {
    /// Start a writer for frames of the given size and sample type, one
    /// component per pixel and uncompressed payloads.
    pub fn new(width: usize, height: usize, dtype: PixelDtype) -> Self {
        Nd2Writer {
            width,
            height,
            components: 1,
            dtype,
            row_bytes: None,
            compression: Compression::Uncompressed,
            frames: Vec::new(),
        }
    }

    /// Set the number of interleaved components per pixel.
    pub fn components(mut self, components: usize) -> Self {
        self.components = components;
        self
    }

    /// Override the stored row stride; must be at least the tight width.
    pub fn row_bytes(mut self, row_bytes: usize) -> Self {
        self.row_bytes = Some(row_bytes);
        self
    }

    /// Set how pixel payloads are stored. `Lossy` stores raw bytes while
    /// claiming the lossy codec, which readers refuse.
    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    fn tight_row_bytes(&self) -> usize {
        self.width * self.components * self.dtype.sample_bytes()
    }

    fn stride(&self) -> usize {
        self.row_bytes.unwrap_or_else(|| self.tight_row_bytes())
    }

    /// Append one frame of 8-bit samples, rows of interleaved components.
    pub fn push_frame_u8(&mut self, samples: &[u8]) {
        self.push_rows(PixelDtype::U8, samples.to_vec());
    }

    /// Append one frame of 16-bit samples, rows of interleaved components.
    pub fn push_frame_u16(&mut self, samples: &[u16]) {
        let mut packed = Vec::with_capacity(2 * samples.len());
        for sample in samples {
            packed.extend_from_slice(&sample.to_le_bytes());
        }
        self.push_rows(PixelDtype::U16, packed);
    }

    /// Append one frame of 32-bit float samples, rows of interleaved
    /// components.
    pub fn push_frame_f32(&mut self, samples: &[f32]) {
        let mut packed = Vec::with_capacity(4 * samples.len());
        for sample in samples {
            packed.extend_from_slice(&sample.to_le_bytes());
        }
        self.push_rows(PixelDtype::F32, packed);
    }

    fn push_rows(&mut self, dtype: PixelDtype, packed: Vec<u8>) {
        assert_eq!(dtype, self.dtype, "frame sample type differs from writer");
        let tight = self.tight_row_bytes();
        assert_eq!(packed.len(), tight * self.height, "frame sample count");
        let stride = self.stride();
        assert!(stride >= tight, "row stride below tight width");
        let mut frame = Vec::with_capacity(stride * self.height);
        for row in packed.chunks(tight) {
            frame.extend_from_slice(row);
            frame.resize(frame.len() + (stride - tight), 0);
        }
        self.frames.push(frame);
    }

    /// Serialize the container to bytes.
    pub fn finish(self) -> Result<Vec<u8>, Nd2Error> {
        assert!(!self.frames.is_empty(), "at least one frame is required");
        let mut out = Vec::new();
        let mut map: Vec<(String, u64, u64)> = Vec::new();

        write_chunk(&mut out, FILE_SIGNATURE, b"Ver3.0");

        let compression_code = match self.compression {
            Compression::Lossless => 0,
            Compression::Lossy => 1,
            Compression::Uncompressed => 2,
        };
        let attrs = Variant::Level(vec![
            ("uiWidth".to_string(), Variant::Int(self.width as i64)),
            ("uiHeight".to_string(), Variant::Int(self.height as i64)),
            ("uiComp".to_string(), Variant::Int(self.components as i64)),
            (
                "uiBpcInMemory".to_string(),
                Variant::Int(8 * self.dtype.sample_bytes() as i64),
            ),
            (
                "uiBpcSignificant".to_string(),
                Variant::Int(8 * self.dtype.sample_bytes() as i64),
            ),
            (
                "uiWidthBytes".to_string(),
                Variant::Int(self.stride() as i64),
            ),
            (
                "uiSequenceCount".to_string(),
                Variant::Int(self.frames.len() as i64),
            ),
            ("eCompression".to_string(), Variant::Int(compression_code)),
        ]);
        let mut blob = Vec::new();
        encode_record(&mut blob, "SLxImageAttributes", &attrs);
        let offset = write_chunk(&mut out, ATTRIBUTES_NAME.as_bytes(), &blob);
        map.push((
            ATTRIBUTES_NAME.to_string(),
            offset,
            out.len() as u64 - offset,
        ));

        for (index, frame) in self.frames.iter().enumerate() {
            let mut payload = Vec::with_capacity(8 + frame.len());
            payload.extend_from_slice(&(index as f64).to_le_bytes());
            payload.extend_from_slice(frame);
            let stored = match self.compression {
                Compression::Lossless => {
                    let mut encoder = flate2::write::ZlibEncoder::new(
                        Vec::new(),
                        flate2::Compression::default(),
                    );
                    encoder.write_all(&payload)?;
                    encoder.finish()?
                }
                Compression::Lossy | Compression::Uncompressed => payload,
            };
            let name = format!("ImageDataSeq|{index}!");
            let offset = write_chunk(&mut out, name.as_bytes(), &stored);
            map.push((name, offset, out.len() as u64 - offset));
        }

        let mut map_data = Vec::new();
        for (name, offset, size) in &map {
            map_data.extend_from_slice(name.as_bytes());
            map_data.extend_from_slice(&offset.to_le_bytes());
            map_data.extend_from_slice(&size.to_le_bytes());
        }
        map_data.extend_from_slice(MAP_TERMINATOR);
        map_data.extend_from_slice(&[0u8; 16]);
        let map_offset = write_chunk(&mut out, FILEMAP_NAME, &map_data);

        out.extend_from_slice(MAP_TERMINATOR);
        out.extend_from_slice(&map_offset.to_le_bytes());
        Ok(out)
    }

    /// Serialize the container and write it to `path`.
    pub fn write_to(self, path: &Path) -> Result<(), Nd2Error> {
        let bytes = self.finish()?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

fn write_chunk(out: &mut Vec<u8>, name: &[u8], data: &[u8]) -> u64 {
    let offset = out.len() as u64;
    out.extend_from_slice(&CHUNK_MAGIC.to_le_bytes());
    out.extend_from_slice(&(name.len() as u32).to_le_bytes());
    out.extend_from_slice(&(data.len() as u64).to_le_bytes());
    out.extend_from_slice(name);
    out.extend_from_slice(data);
    offset
}
