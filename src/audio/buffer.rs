//! # Audio Format and Ring Buffer
//!
//! The ring buffer holds raw PCM bytes between the socket receive loop and the
//! uplink reader. Its size is always derived from the negotiated [`AudioFormat`]
//! and a window length, so the buffer and the session agree on what a second of
//! audio is.
//!
//! ## Overflow Policy:
//! The buffer never grows and never pushes back on the writer. A writer that
//! outruns the reader overwrites the oldest unread bytes; the read cursor is then
//! moved up to the write cursor so the reader resumes at the oldest byte that
//! survived.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// PCM layout shared by the client socket, the ring buffer and the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Samples per second per channel
    pub sample_rate: u32,

    /// Interleaved channel count (1 = mono)
    pub channels: u16,

    /// Bits per sample (16 for pcm16)
    pub bit_depth: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 24000, // pcm16 as spoken by the realtime service
            channels: 1,
            bit_depth: 16,
        }
    }
}

impl AudioFormat {
    pub fn bytes_per_sample(&self) -> usize {
        (self.bit_depth / 8) as usize
    }

    /// Bytes in one sample across all channels.
    pub fn frame_size(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.frame_size()
    }

    /// Whole frames covering `duration`, at least one frame.
    ///
    /// ## Example:
    /// 100ms of 24kHz mono pcm16 is 2,400 samples, so 4,800 bytes.
    pub fn bytes_for(&self, duration: Duration) -> usize {
        let frames = (self.sample_rate as u128 * duration.as_millis() / 1000) as usize;
        frames.max(1) * self.frame_size()
    }

    /// Ring capacity for a window of `seconds`:
    /// `sample_rate * bytes_per_sample * channels * seconds`.
    pub fn window_capacity(&self, seconds: u32) -> usize {
        self.bytes_per_second() * seconds as usize
    }
}

/// Fixed-size circular byte buffer.
///
/// `write_pos` and `read_pos` both stay in `[0, capacity)`. The number of unread
/// bytes is their wrapped difference; since equal cursors mean both "empty" and
/// "full", a full buffer is tracked explicitly.
pub struct RingBuffer {
    buffer: Box<[u8]>,
    write_pos: usize,
    read_pos: usize,
    full: bool,
}

impl RingBuffer {
    /// Create a zeroed buffer of `capacity` bytes.
    ///
    /// ## Panics:
    /// If `capacity` is zero. Configuration validation rules this out.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be greater than 0");
        Self {
            buffer: vec![0u8; capacity].into_boxed_slice(),
            write_pos: 0,
            read_pos: 0,
            full: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Unread bytes.
    pub fn available(&self) -> usize {
        if self.full {
            self.capacity()
        } else if self.write_pos >= self.read_pos {
            self.write_pos - self.read_pos
        } else {
            self.write_pos + (self.capacity() - self.read_pos)
        }
    }

    /// Append `data`, overwriting the oldest unread bytes if it does not fit.
    ///
    /// ## Wraparound:
    /// When the chunk would run past the end of the buffer, the head of the chunk
    /// fills the tail of the buffer, `write_pos` wraps to 0 and the rest is copied
    /// from the start.
    ///
    /// ## Returns:
    /// How many unread bytes were lost to this write.
    pub fn write(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let capacity = self.capacity();
        let unread = self.available() + data.len();

        // Only the newest `capacity` bytes of an oversized chunk can survive.
        let mut chunk = if data.len() > capacity {
            &data[data.len() - capacity..]
        } else {
            data
        };

        if self.write_pos + chunk.len() >= capacity {
            let before_wrap = capacity - self.write_pos;
            self.buffer[self.write_pos..].copy_from_slice(&chunk[..before_wrap]);
            chunk = &chunk[before_wrap..];
            self.write_pos = 0;
        }
        self.buffer[self.write_pos..self.write_pos + chunk.len()].copy_from_slice(chunk);
        self.write_pos += chunk.len();

        if unread >= capacity {
            // Oldest surviving byte sits right after the newest one.
            self.read_pos = self.write_pos;
            self.full = true;
        }
        unread.saturating_sub(capacity)
    }

    /// Fill `out` with the oldest unread bytes.
    ///
    /// All or nothing: returns `false` and copies nothing when fewer than
    /// `out.len()` bytes are available.
    pub fn read_into(&mut self, out: &mut [u8]) -> bool {
        let count = out.len();
        if count == 0 {
            return true;
        }
        if count > self.available() {
            return false;
        }

        let capacity = self.capacity();
        let mut offset = 0;
        if self.read_pos + count >= capacity {
            let before_wrap = capacity - self.read_pos;
            out[..before_wrap].copy_from_slice(&self.buffer[self.read_pos..]);
            offset = before_wrap;
            self.read_pos = 0;
        }
        let rest = count - offset;
        out[offset..].copy_from_slice(&self.buffer[self.read_pos..self.read_pos + rest]);
        self.read_pos += rest;
        self.full = false;
        true
    }
}
