//! Growable scratch byte buffer used by the broker client's inbound
//! parse buffer.
//!
//! A thin wrapper over `Vec<u8>` that exposes the reserve/assign shape
//! spec'd for the C buffer this project replaces: callers `reserve(n)`
//! spare capacity, write into it directly, then report back how much
//! they actually used.

#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    pub fn new() -> Self {
        Buffer { data: Vec::new() }
    }

    /// Ensure at least `n` spare bytes are available past the current
    /// length and return the offset at which they start. The caller
    /// must follow up with `set_len` once it knows how many bytes it
    /// actually wrote.
    pub fn reserve(&mut self, n: usize) -> usize {
        let offset = self.data.len();
        self.data.reserve(n);
        // SAFETY-free: we only hand out the offset, the caller writes
        // through `spare_mut` before calling `set_len`.
        offset
    }

    /// The writable region reserved by the most recent `reserve` call,
    /// sized to the buffer's current capacity minus its length.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let len = self.data.len();
        let cap = self.data.capacity();
        if self.data.len() < cap {
            // Extend with zeroed filler so the slice is addressable;
            // `set_len` below trims it back down to what was used.
            self.data.resize(cap, 0);
        }
        &mut self.data[len..]
    }

    /// Record that `n` bytes were written into the region handed out
    /// by `reserve`/`spare_mut`, growing the buffer's logical length.
    ///
    /// Must not touch the bytes in `[base, base + n)` — the caller just
    /// wrote through `spare_mut` and a `truncate`/`resize` round trip
    /// would refill them with `resize`'s fill value instead of keeping
    /// what was written.
    pub fn set_len(&mut self, base: usize, n: usize) {
        debug_assert!(base + n <= self.data.capacity());
        // SAFETY: every byte up to `data.capacity()` was already
        // initialized (zero-filled) by the preceding `spare_mut` call,
        // and bytes `[base, base + n)` were since overwritten by the
        // caller, so shrinking/growing the logical length within that
        // initialized region is sound without touching the bytes.
        unsafe { self.data.set_len(base + n) }
    }

    /// Replace the buffer's contents with a copy of `data`.
    pub fn assign(&mut self, data: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(data);
    }

    /// Drop the first `n` bytes, shifting the remainder to the front.
    /// Used to compact the buffer after frames have been parsed out
    /// of its prefix.
    pub fn consume(&mut self, n: usize) {
        self.data.drain(..n.min(self.data.len()));
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_then_write_then_consume() {
        let mut buf = Buffer::new();
        let base = buf.reserve(4);
        {
            let spare = buf.spare_mut();
            spare[..4].copy_from_slice(b"abcd");
        }
        buf.set_len(base, 4);
        assert_eq!(buf.as_slice(), b"abcd");

        buf.consume(2);
        assert_eq!(buf.as_slice(), b"cd");
    }

    #[test]
    fn assign_replaces_contents() {
        let mut buf = Buffer::new();
        buf.assign(b"hello");
        assert_eq!(buf.as_slice(), b"hello");
        buf.assign(b"hi");
        assert_eq!(buf.as_slice(), b"hi");
    }

    #[test]
    fn consume_past_end_clears() {
        let mut buf = Buffer::new();
        buf.assign(b"xyz");
        buf.consume(100);
        assert!(buf.is_empty());
    }
}
