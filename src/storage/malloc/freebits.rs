//! Free-bit tracking for fixed size chunks in a pool.

/// One bit per chunk, a set bit marks a free chunk.
pub(crate) struct FreeBits {
    words: Vec<u64>,
    nchunks: usize,
    nfree: usize,
    /// Lowest word that may still carry a free bit.
    hint: usize,
}

impl FreeBits {
    /// `nchunks` must be a multiple of 8.
    pub fn new(nchunks: usize) -> Self {
        assert!(nchunks > 0 && nchunks % 8 == 0, "chunks {} not a multiple of 8", nchunks);

        let nwords = (nchunks + 63) / 64;
        let mut words = vec![u64::MAX; nwords];
        let tail = nchunks % 64;
        if tail > 0 {
            words[nwords - 1] = (1u64 << tail) - 1;
        }
        Self { words, nchunks, nfree: nchunks, hint: 0 }
    }

    /// Claim the lowest free chunk.
    pub fn alloc(&mut self) -> Option<usize> {
        if self.nfree == 0 {
            return None;
        }
        for i in self.hint..self.words.len() {
            let word = self.words[i];
            if word == 0 {
                continue;
            }
            let bit = word.trailing_zeros() as usize;
            self.words[i] = word & !(1u64 << bit);
            self.nfree -= 1;
            self.hint = i;
            return Some((i << 6) + bit);
        }
        None
    }

    pub fn free(&mut self, nth: usize) {
        assert!(nth < self.nchunks, "chunk {} out of bounds {}", nth, self.nchunks);

        let (q, r) = (nth >> 6, nth & 0x3f);
        let mask = 1u64 << r;
        assert!(self.words[q] & mask == 0, "double free of chunk {}", nth);
        self.words[q] |= mask;
        self.nfree += 1;
        if q < self.hint {
            self.hint = q;
        }
    }

    pub fn free_chunks(&self) -> usize {
        self.nfree
    }

    pub fn is_free(&self, nth: usize) -> bool {
        (self.words[nth >> 6] & (1u64 << (nth & 0x3f))) != 0
    }

    /// Bytes used by the bitmap itself.
    pub fn sizeof(&self) -> usize {
        std::mem::size_of::<Self>() + self.words.len() * 8
    }
}
