// Wire protocol of the motor controller board
//
// Board -> host (11 bytes):
//   [0x7B, c1_hi, c1_lo, c2_hi, c2_lo, c3_hi, c3_lo, c4_hi, c4_lo, xor, 0x7D]
// Host -> board (9 bytes):
//   [0x7B, vx_hi, vx_lo, vy_hi, vy_lo, wz_hi, wz_lo, xor, 0x7D]
//
// Channels are signed 16-bit big-endian, fixed point x1000. The checksum is
// the XOR of every byte from the header through the last payload byte.

use std::time::Instant;
use tracing::debug;

pub const FRAME_HEADER: u8 = 0x7B;
pub const FRAME_TAIL: u8 = 0x7D;

pub const RECEIVE_FRAME_SIZE: usize = 11;
pub const SEND_FRAME_SIZE: usize = 9;

/// Raw channel units per m/s (or rad/s)
pub const FIXED_POINT_SCALE: f64 = 1000.0;

/// Reasons a frame is rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Invalid frame header: 0x{found:02X}")]
    BadHeader { found: u8 },

    #[error("Invalid frame tail: 0x{found:02X}")]
    BadTail { found: u8 },

    #[error("Checksum mismatch: computed 0x{expected:02X}, frame carries 0x{found:02X}")]
    ChecksumMismatch { expected: u8, found: u8 },
}

/// XOR-fold of a byte range
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &b| acc ^ b)
}

/// Convert a physical value to the wire's fixed-point representation.
/// Truncates toward zero and saturates at the i16 range.
pub fn to_fixed(value: f64) -> i16 {
    (value * FIXED_POINT_SCALE) as i16
}

fn from_fixed(hi: u8, lo: u8) -> f64 {
    i16::from_be_bytes([hi, lo]) as f64 / FIXED_POINT_SCALE
}

/// Wheel velocities decoded from one board frame
#[derive(Debug, Clone, Copy)]
pub struct WheelSample {
    /// c1..c4 in m/s
    pub wheels: [f64; 4],
    pub received_at: Instant,
}

/// Running counters kept by the decoder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub decoded: u64,
    pub tail_errors: u64,
    pub checksum_errors: u64,
}

impl FrameStats {
    pub fn rejected(&self) -> u64 {
        self.tail_errors + self.checksum_errors
    }
}

/// Incremental decoder for board frames.
///
/// Bytes are discarded until a header arrives. From there exactly
/// `RECEIVE_FRAME_SIZE` bytes are collected and the window is closed no
/// matter how validation turns out: a rejected window is never re-scanned
/// for an embedded header, the decoder just waits for the next fresh one.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    synchronized: bool,
    buffer: [u8; RECEIVE_FRAME_SIZE],
    len: usize,
    stats: FrameStats,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            synchronized: false,
            buffer: [0; RECEIVE_FRAME_SIZE],
            len: 0,
            stats: FrameStats::default(),
        }
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    #[cfg(test)]
    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    /// Bytes still missing from the current window
    pub fn remaining(&self) -> usize {
        RECEIVE_FRAME_SIZE - self.len
    }

    /// Feed one byte. Returns `None` until a window closes, then the
    /// decoded sample or the reason the frame was rejected.
    pub fn push(&mut self, byte: u8) -> Option<Result<WheelSample, FrameError>> {
        if !self.synchronized {
            if byte != FRAME_HEADER {
                return None;
            }
            self.synchronized = true;
        }

        self.buffer[self.len] = byte;
        self.len += 1;

        if self.remaining() > 0 {
            return None;
        }

        self.synchronized = false;
        self.len = 0;

        let result = Self::validate(&self.buffer);
        match result {
            Ok(_) => self.stats.decoded += 1,
            Err(FrameError::BadTail { .. }) => self.stats.tail_errors += 1,
            Err(_) => self.stats.checksum_errors += 1,
        }
        Some(result)
    }

    fn validate(frame: &[u8; RECEIVE_FRAME_SIZE]) -> Result<WheelSample, FrameError> {
        let tail = frame[RECEIVE_FRAME_SIZE - 1];
        if tail != FRAME_TAIL {
            return Err(FrameError::BadTail { found: tail });
        }

        let expected = xor_checksum(&frame[..9]);
        if expected != frame[9] {
            return Err(FrameError::ChecksumMismatch {
                expected,
                found: frame[9],
            });
        }

        let mut wheels = [0.0; 4];
        for (k, wheel) in wheels.iter_mut().enumerate() {
            *wheel = from_fixed(frame[1 + 2 * k], frame[2 + 2 * k]);
        }

        Ok(WheelSample {
            wheels,
            received_at: Instant::now(),
        })
    }

    /// Lazily decode a byte stream, yielding only valid samples
    pub fn samples<I>(&mut self, bytes: I) -> Samples<'_, I::IntoIter>
    where
        I: IntoIterator<Item = u8>,
    {
        Samples {
            decoder: self,
            bytes: bytes.into_iter(),
        }
    }
}

/// Iterator returned by [`FrameDecoder::samples`]
pub struct Samples<'a, I> {
    decoder: &'a mut FrameDecoder,
    bytes: I,
}

impl<I: Iterator<Item = u8>> Iterator for Samples<'_, I> {
    type Item = WheelSample;

    fn next(&mut self) -> Option<WheelSample> {
        for byte in self.bytes.by_ref() {
            match self.decoder.push(byte) {
                Some(Ok(sample)) => return Some(sample),
                Some(Err(e)) => debug!("Dropping frame: {}", e),
                None => {}
            }
        }
        None
    }
}

/// Velocity command carried by a host -> board frame
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CommandFrame {
    pub vx: f64,
    pub vy: f64,
    pub wz: f64,
}

impl CommandFrame {
    pub fn new(vx: f64, vy: f64, wz: f64) -> Self {
        Self { vx, vy, wz }
    }

    /// Build the 9-byte outbound frame
    pub fn encode(&self) -> [u8; SEND_FRAME_SIZE] {
        let mut frame = [0u8; SEND_FRAME_SIZE];
        frame[0] = FRAME_HEADER;

        for (k, value) in [self.vx, self.vy, self.wz].into_iter().enumerate() {
            let [hi, lo] = to_fixed(value).to_be_bytes();
            frame[1 + 2 * k] = hi;
            frame[2 + 2 * k] = lo;
        }

        frame[7] = xor_checksum(&frame[..7]);
        frame[8] = FRAME_TAIL;
        frame
    }

    /// Parse an outbound frame back into a command, at 1/1000 resolution
    pub fn decode(frame: &[u8; SEND_FRAME_SIZE]) -> Result<Self, FrameError> {
        if frame[0] != FRAME_HEADER {
            return Err(FrameError::BadHeader { found: frame[0] });
        }
        if frame[8] != FRAME_TAIL {
            return Err(FrameError::BadTail { found: frame[8] });
        }

        let expected = xor_checksum(&frame[..7]);
        if expected != frame[7] {
            return Err(FrameError::ChecksumMismatch {
                expected,
                found: frame[7],
            });
        }

        Ok(Self {
            vx: from_fixed(frame[1], frame[2]),
            vy: from_fixed(frame[3], frame[4]),
            wz: from_fixed(frame[5], frame[6]),
        })
    }
}
