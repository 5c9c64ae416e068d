//! zlib-stream transport compression
//!
//! The remote shares one deflate context across the whole connection and
//! terminates every logical frame with a sync flush. Chunks are buffered until
//! one ends with [`ZLIB_SUFFIX`]; the buffered input is then inflated and the
//! output handed out as one frame.

use flate2::{Decompress, DecompressError, FlushDecompress, Status};

/// Sync flush marker closing every logical frame.
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

const CHUNK_SIZE: usize = 128 * 1024;

/// Buffers above this are released after a flush instead of being reused.
const RETAINED_CAPACITY: usize = 4 * CHUNK_SIZE;

pub struct Inflater {
    decompress: Decompress,
    compressed: Vec<u8>,
    buffer: Vec<u8>,
}

impl Inflater {
    pub fn new() -> Self {
        Self {
            decompress: Decompress::new(true),
            compressed: Vec::new(),
            buffer: Vec::with_capacity(CHUNK_SIZE),
        }
    }

    /// Feed one chunk. Returns the inflated frame once the chunk closes it.
    ///
    /// An error leaves the shared deflate context unusable; the caller must
    /// drop the connection and start over with a fresh inflater.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, DecompressError> {
        self.compressed.extend_from_slice(chunk);
        if !chunk.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let mut offset = 0;
        loop {
            if self.buffer.capacity() - self.buffer.len() < CHUNK_SIZE / 4 {
                self.buffer.reserve(CHUNK_SIZE);
            }

            let in_before = self.decompress.total_in();
            let out_before = self.decompress.total_out();
            let status = self.decompress.decompress_vec(
                &self.compressed[offset..],
                &mut self.buffer,
                FlushDecompress::Sync,
            )?;
            offset += (self.decompress.total_in() - in_before) as usize;
            let produced = self.decompress.total_out() - out_before;

            let drained = offset >= self.compressed.len();
            let has_room = self.buffer.len() < self.buffer.capacity();
            if status == Status::StreamEnd || (drained && has_room) {
                break;
            }
            if produced == 0 && (self.decompress.total_in() - in_before) == 0 && has_room {
                break;
            }
        }

        self.compressed.clear();
        let frame = std::mem::take(&mut self.buffer);
        if frame.capacity() <= RETAINED_CAPACITY {
            self.buffer = Vec::with_capacity(frame.capacity());
        } else {
            self.buffer = Vec::with_capacity(CHUNK_SIZE);
        }
        if self.compressed.capacity() > RETAINED_CAPACITY {
            self.compressed.shrink_to(CHUNK_SIZE);
        }

        Ok(Some(frame))
    }

    /// Bytes of compressed input waiting for a frame terminator.
    pub fn pending(&self) -> usize {
        self.compressed.len()
    }
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}
