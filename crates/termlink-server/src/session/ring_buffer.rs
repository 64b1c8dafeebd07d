//! Circular buffer for output produced while no channel is attached.
//!
//! Holds the most recent N bytes of undelivered PTY output. The next attach
//! drains it into a single replay, so each byte is delivered at most once.

/// A fixed-capacity circular byte buffer.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Vec<u8>,
    capacity: usize,
    /// Write position (wraps around).
    write_pos: usize,
    /// Valid bytes currently stored.
    len: usize,
    /// Bytes overwritten since the last drain.
    overflowed: u64,
}

impl RingBuffer {
    /// Create a new ring buffer with the given capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            capacity,
            write_pos: 0,
            len: 0,
            overflowed: 0,
        }
    }

    /// Append data, overwriting the oldest bytes once full.
    pub fn write(&mut self, data: &[u8]) {
        if self.capacity == 0 || data.is_empty() {
            self.overflowed += data.len() as u64;
            return;
        }

        // Only the last `capacity` bytes of an oversized write can survive.
        let skipped = data.len().saturating_sub(self.capacity);
        let data = &data[skipped..];

        let first = data.len().min(self.capacity - self.write_pos);
        self.buf[self.write_pos..self.write_pos + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        self.buf[..rest].copy_from_slice(&data[first..]);
        self.write_pos = (self.write_pos + data.len()) % self.capacity;

        let lost = (self.len + data.len()).saturating_sub(self.capacity);
        self.overflowed += (skipped + lost) as u64;
        self.len = (self.len + data.len()).min(self.capacity);
    }

    /// Copy out all buffered data, oldest first.
    pub fn read_all(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.len);
        if self.len < self.capacity {
            // Not wrapped, or partially refilled after a drain.
            let start = (self.write_pos + self.capacity - self.len) % self.capacity;
            if start + self.len <= self.capacity {
                result.extend_from_slice(&self.buf[start..start + self.len]);
            } else {
                result.extend_from_slice(&self.buf[start..]);
                result.extend_from_slice(&self.buf[..self.write_pos]);
            }
        } else {
            result.extend_from_slice(&self.buf[self.write_pos..]);
            result.extend_from_slice(&self.buf[..self.write_pos]);
        }
        result
    }

    /// Take all buffered data, oldest first, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<u8> {
        let data = self.read_all();
        self.clear();
        data
    }

    /// Number of valid bytes currently stored.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes lost to overflow since the last drain.
    pub fn overflowed(&self) -> u64 {
        self.overflowed
    }

    pub fn clear(&mut self) {
        self.write_pos = 0;
        self.len = 0;
        self.overflowed = 0;
    }
}
