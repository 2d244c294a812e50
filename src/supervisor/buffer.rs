//! Ring buffer for session output history
//!
//! The RingBuffer stores recent output from agent sessions. It backs
//! `capture_output` and completion-marker detection; the full stream goes to
//! the session log file.

/// A fixed-capacity ring buffer for storing session output
///
/// When the buffer is full, old data is overwritten by new data.
/// Absolute offsets (`total_written`) keep counting across wraparound so a
/// reader can ask for "everything after offset N".
pub struct RingBuffer {
    /// The underlying storage
    data: Vec<u8>,
    /// Maximum capacity in bytes
    capacity: usize,
    /// Write position (where next byte goes)
    write_pos: usize,
    /// Total bytes written (may exceed capacity due to wraparound)
    total_written: usize,
}

impl RingBuffer {
    /// Create a new ring buffer with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            write_pos: 0,
            total_written: 0,
        }
    }

    /// Write data to the buffer
    ///
    /// If the data exceeds remaining capacity, older data is overwritten.
    pub fn write(&mut self, data: &[u8]) {
        self.total_written += data.len();
        if self.capacity == 0 {
            return;
        }

        // Only the tail can survive a write larger than the whole buffer
        let mut rest = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };

        if self.data.len() < self.capacity {
            let n = (self.capacity - self.data.len()).min(rest.len());
            self.data.extend_from_slice(&rest[..n]);
            self.write_pos = self.data.len() % self.capacity;
            rest = &rest[n..];
        }

        while !rest.is_empty() {
            let n = (self.capacity - self.write_pos).min(rest.len());
            self.data[self.write_pos..self.write_pos + n].copy_from_slice(&rest[..n]);
            self.write_pos = (self.write_pos + n) % self.capacity;
            rest = &rest[n..];
        }
    }

    /// Read all available data from the buffer
    ///
    /// Returns data in chronological order (oldest first).
    pub fn read_all(&self) -> Vec<u8> {
        if self.data.len() < self.capacity {
            return self.data.clone();
        }
        let mut out = Vec::with_capacity(self.capacity);
        out.extend_from_slice(&self.data[self.write_pos..]);
        out.extend_from_slice(&self.data[..self.write_pos]);
        out
    }

    /// Read whatever is still retained of the bytes written after `offset`
    pub fn read_since(&self, offset: usize) -> Vec<u8> {
        let oldest = self.total_written - self.len();
        let start = offset.max(oldest);
        if start >= self.total_written {
            return Vec::new();
        }
        let mut all = self.read_all();
        all.drain(..start - oldest);
        all
    }

    /// Get the number of bytes currently stored
    pub fn len(&self) -> usize {
        std::cmp::min(self.total_written, self.capacity)
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.total_written == 0
    }

    /// Check if buffer has wrapped around
    pub fn has_wrapped(&self) -> bool {
        self.total_written > self.capacity
    }

    /// Get the total bytes ever written (may exceed capacity)
    pub fn total_written(&self) -> usize {
        self.total_written
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.data.clear();
        self.write_pos = 0;
        self.total_written = 0;
    }

    /// Get current capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
