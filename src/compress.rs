//! Block-compressing byte sink.
//!
//! The RAP serializer streams everything through a `Compressor`: bytes
//! accumulate in a fixed-size block which is deflated and appended to
//! the output image each time it fills. Numeric fields are written
//! big-endian. The `plain` constructor bypasses compression while
//! keeping the same interface and byte order, which also gives tests a
//! way to assert the exact serialized sequence.

use anyhow::{bail, Result};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::Write;
use tracing::trace;

use crate::files::{Image, Object};

pub struct Compressor<'a> {
    image: &'a mut Image,
    block_size: usize,
    buffer: Vec<u8>,
    enabled: bool,
    transferred: u64,
    compressed: u64,
}

impl<'a> Compressor<'a> {
    pub fn new(image: &'a mut Image, block_size: usize) -> Compressor<'a> {
        Compressor {
            image,
            block_size,
            buffer: Vec::with_capacity(block_size),
            enabled: true,
            transferred: 0,
            compressed: 0,
        }
    }

    /// A pass-through writer: same interface, no compression.
    pub fn plain(image: &'a mut Image, block_size: usize) -> Compressor<'a> {
        Compressor {
            enabled: false,
            ..Compressor::new(image, block_size)
        }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.enabled {
            self.transferred += data.len() as u64;
            return self.image.write_all(data);
        }
        let mut data = data;
        while !data.is_empty() {
            let room = self.block_size - self.buffer.len();
            let take = room.min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            self.transferred += take as u64;
            data = &data[take..];
            if self.buffer.len() >= self.block_size {
                self.emit()?;
            }
        }
        Ok(())
    }

    /// Write a 32-bit value in the sink's byte order.
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write(&value.to_be_bytes())
    }

    /// Append `length` bytes read from `input` starting at `offset`.
    pub fn write_object(&mut self, input: &mut Object, offset: u64, length: u64) -> Result<()> {
        input.seek(offset)?;
        let mut chunk = vec![0u8; self.block_size.max(1)];
        let mut remaining = length;
        while remaining > 0 {
            let want = remaining.min(chunk.len() as u64) as usize;
            let count = input.read(&mut chunk[..want])?;
            if count == 0 {
                bail!(
                    "input too short reading {} ({remaining} bytes left)",
                    input.name().full()
                );
            }
            self.write(&chunk[..count])?;
            remaining -= count as u64;
        }
        Ok(())
    }

    /// Compress and write out any buffered data.
    pub fn flush(&mut self) -> Result<()> {
        self.emit()
    }

    fn emit(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&self.buffer)?;
        let block = encoder.finish()?;
        self.image.write_all(&block)?;
        self.compressed += block.len() as u64;
        trace!("compressed block: {} -> {}", self.buffer.len(), block.len());
        self.buffer.clear();
        Ok(())
    }

    /// Uncompressed bytes accepted so far.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Compressed bytes written so far.
    pub fn compressed(&self) -> u64 {
        self.compressed
    }
}
