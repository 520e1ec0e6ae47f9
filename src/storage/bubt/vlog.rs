//! Value log buffering
//!
//! Values are appended as `[u64 len][value]`. Each batch handed to the
//! flusher is zero padded to a multiple of the value block size, so every
//! batch starts block aligned.

pub(crate) struct VlogBuffer {
    blocksize: usize,
    /// File position of `buf[0]`
    pos: u64,
    buf: Vec<u8>,
}

impl VlogBuffer {
    pub fn new(blocksize: usize, pos: u64) -> Self {
        Self { blocksize, pos, buf: Vec::new() }
    }

    /// Append a value, returns its file position.
    pub fn append(&mut self, value: &[u8]) -> u64 {
        let fpos = self.pos + self.buf.len() as u64;
        self.buf.extend_from_slice(&(value.len() as u64).to_be_bytes());
        self.buf.extend_from_slice(value);
        fpos
    }

    /// Padded batch ready for the flusher and its padding in bytes.
    pub fn take_batch(&mut self) -> Option<(Vec<u8>, usize)> {
        if self.buf.is_empty() {
            return None;
        }
        let len = self.buf.len();
        let padded = len.div_ceil(self.blocksize) * self.blocksize;
        let mut batch = std::mem::take(&mut self.buf);
        batch.resize(padded, 0);
        self.pos += padded as u64;
        Some((batch, padded - len))
    }

    /// Bytes written out so far.
    pub fn position(&self) -> u64 {
        self.pos
    }
}
