// src/packet_buffer.rs

use std::collections::HashMap;

use crate::config::OpcodeTable;
use crate::protocol::parser::{record_size, RecordSize, LENGTH_PREFIX, OPCODE_LEN};

pub const HEADER_LEN: usize = LENGTH_PREFIX + OPCODE_LEN;
const PREVIEW_BYTES: usize = 16;

/// What the framer knows about message boundaries: the plausible length range
/// and the payload size each configured opcode admits.
#[derive(Debug, Clone)]
pub struct FrameShapes {
    sizes: HashMap<u16, RecordSize>,
    max_message_len: u32,
}

impl FrameShapes {
    pub fn new(opcodes: &OpcodeTable, max_message_len: u32) -> Self {
        Self::from_sizes(opcodes.entries().map(|(opcode, kind)| (opcode, record_size(kind))), max_message_len)
    }

    pub fn from_sizes(sizes: impl IntoIterator<Item = (u16, RecordSize)>, max_message_len: u32) -> Self {
        Self { sizes: sizes.into_iter().collect(), max_message_len }
    }

    pub fn plausible_len(&self, len: u32) -> bool {
        len as usize >= OPCODE_LEN && len <= self.max_message_len
    }

    /// Whether a header may be framed. Unknown opcodes are framed by length
    /// alone; known ones must also fit their record.
    pub fn admits(&self, len: u32, opcode: u16) -> bool {
        self.plausible_len(len) && self.sizes.get(&opcode).map_or(true, |size| size.admits(len))
    }

    /// Whether `bytes` starts with a header strong enough to anchor on: a
    /// configured opcode whose record fits the length.
    pub fn is_header(&self, bytes: &[u8]) -> bool {
        if bytes.len() < HEADER_LEN {
            return false;
        }
        let len = read_len(bytes);
        self.plausible_len(len) && self.sizes.get(&read_opcode(bytes)).is_some_and(|size| size.admits(len))
    }
}

/// Carry-over buffer for one flow: accepts contiguous stream bytes and yields
/// length-prefixed messages, resynchronising after corruption.
#[derive(Debug)]
pub struct PacketBuffer {
    buffer: Vec<u8>,
    shapes: FrameShapes,
    stall_timeout_ms: u64,
    last_success_ms: u64, // capture time of the last fully framed message
    last_add_ms: u64,
    // The frame last handed out stays at the front until the caller moves on,
    // so reject() can rescan its bytes.
    held: usize,
    resyncing: bool,
    resyncs: u64,
}

impl PacketBuffer {
    pub fn new(shapes: FrameShapes, stall_timeout_ms: u64) -> Self {
        Self {
            buffer: Vec::with_capacity(65536),
            shapes,
            stall_timeout_ms,
            last_success_ms: 0,
            last_add_ms: 0,
            held: 0,
            resyncing: false,
            resyncs: 0,
        }
    }

    pub fn add(&mut self, data: &[u8], now_ms: u64) {
        self.release();

        // WATCHDOG: a partial message that has not completed within the stall
        // timeout will never complete; its missing bytes were lost upstream.
        if !self.buffer.is_empty() {
            if now_ms.saturating_sub(self.last_success_ms) > self.stall_timeout_ms {
                log::warn!("[PacketBuffer] Watchdog: stuck partial message (len={}). Resetting.", self.buffer.len());
                self.buffer.clear();
                self.resyncing = true;
                self.last_success_ms = now_ms;
            }
        } else {
            // Empty buffer: this is the start of a new message. Reset the timer
            // so a long idle period does not clear valid data.
            self.last_success_ms = now_ms;
        }

        self.last_add_ms = now_ms;
        self.buffer.extend_from_slice(data);
    }

    /// Returns the next complete payload (opcode + body), without its length
    /// prefix. Its bytes are only released by the following `next` or `add`.
    pub fn next(&mut self) -> Option<Vec<u8>> {
        self.release();
        loop {
            if self.resyncing && !self.scan(0) {
                return None;
            }
            if self.buffer.len() < HEADER_LEN {
                return None;
            }

            let msg_len = read_len(&self.buffer);
            let opcode = read_opcode(&self.buffer);

            // SANITY CHECK: a length outside the plausible range, or one that a
            // known record cannot have, means we are not on a message boundary.
            // Skip forward to the next header that parses as a known record.
            if !self.shapes.admits(msg_len, opcode) {
                log::warn!(
                    "[PacketBuffer] Bad header len={} opcode={:#06x} (buffer={} bytes, head={}). Resynchronising.",
                    msg_len,
                    opcode,
                    self.buffer.len(),
                    preview(&self.buffer)
                );
                self.begin_resync();
                if !self.scan(1) {
                    return None;
                }
                continue;
            }

            let total_len = LENGTH_PREFIX + msg_len as usize;
            if self.buffer.len() < total_len {
                return None; // Wait for TCP segmentation to complete
            }

            self.held = total_len;
            self.last_success_ms = self.last_add_ms;
            return Some(self.buffer[LENGTH_PREFIX..total_len].to_vec());
        }
    }

    /// Gives back the frame last returned by `next` after its record failed
    /// the consistency checks. Its length cannot be trusted, so framing
    /// resumes at the first known header after its first byte.
    pub fn reject(&mut self) {
        if self.held > 0 {
            self.held = 1;
        }
        self.begin_resync();
    }

    /// Requires the next header to carry a known opcode before framing resumes.
    pub fn begin_resync(&mut self) {
        if !self.resyncing {
            self.resyncs += 1;
        }
        self.resyncing = true;
    }

    pub fn is_resyncing(&self) -> bool {
        self.resyncing
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    pub fn pending(&self) -> usize {
        self.buffer.len().saturating_sub(self.held)
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.held = 0;
        self.resyncing = false;
    }

    pub fn shapes(&self) -> &FrameShapes {
        &self.shapes
    }

    fn release(&mut self) {
        if self.held > 0 {
            let held = self.held.min(self.buffer.len());
            self.buffer.drain(..held);
            self.held = 0;
        }
    }

    // Drops bytes up to the first strict header at or after `from`. Returns
    // false when more data is needed to decide.
    fn scan(&mut self, from: usize) -> bool {
        let mut i = from;
        while i < self.buffer.len() {
            let rest = &self.buffer[i..];
            if rest.len() < HEADER_LEN {
                // A header may straddle into the next segment; keep the tail.
                self.buffer.drain(..i);
                return false;
            }
            if self.shapes.is_header(rest) {
                if i > 0 {
                    log::debug!("[PacketBuffer] Resynchronised after skipping {} bytes", i);
                }
                self.buffer.drain(..i);
                self.resyncing = false;
                return true;
            }
            i += 1;
        }
        self.buffer.clear();
        false
    }
}

fn read_len(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_opcode(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[LENGTH_PREFIX], bytes[LENGTH_PREFIX + 1]])
}

fn preview(bytes: &[u8]) -> String {
    hex::encode(&bytes[..bytes.len().min(PREVIEW_BYTES)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parser::frame_message;

    const KNOWN: u16 = 0x2B11;
    const FIXED: u16 = 0x2B12;

    fn shapes() -> FrameShapes {
        FrameShapes::from_sizes([(KNOWN, RecordSize::AtLeast(3)), (FIXED, RecordSize::Exact(6))], 1024)
    }

    fn buffer(stall_timeout_ms: u64) -> PacketBuffer {
        PacketBuffer::new(shapes(), stall_timeout_ms)
    }

    fn message(body: &[u8]) -> Vec<u8> {
        let mut payload = KNOWN.to_le_bytes().to_vec();
        payload.extend_from_slice(body);
        frame_message(&payload)
    }

    fn body(payload: Vec<u8>) -> Vec<u8> {
        payload[OPCODE_LEN..].to_vec()
    }

    #[test]
    fn message_straddling_segments_is_emitted_once_complete() {
        let framed = message(&[1, 2, 3, 4, 5, 6]);
        let mut buf = buffer(5000);

        buf.add(&framed[..3], 10);
        assert_eq!(buf.next(), None);
        buf.add(&framed[3..7], 11);
        assert_eq!(buf.next(), None);
        buf.add(&framed[7..], 12);

        let payload = buf.next().unwrap();
        assert_eq!(&payload[2..], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(buf.pending(), 0);
        assert_eq!(buf.next(), None);
    }

    #[test]
    fn several_messages_in_one_segment() {
        let mut stream = message(&[1]);
        stream.extend(message(&[2, 2]));
        stream.extend(message(&[3, 3, 3]));

        let mut buf = buffer(5000);
        buf.add(&stream, 0);

        let bodies: Vec<Vec<u8>> = std::iter::from_fn(|| buf.next()).map(body).collect();
        assert_eq!(bodies, vec![vec![1], vec![2, 2], vec![3, 3, 3]]);
    }

    #[test]
    fn unknown_opcode_is_framed_by_length_not_resynced() {
        let mut stream = frame_message(&[0x00, 0x7F, 9, 9, 9]);
        stream.extend(message(&[4]));

        let mut buf = buffer(5000);
        buf.add(&stream, 0);

        assert_eq!(buf.next(), Some(vec![0x00, 0x7F, 9, 9, 9]));
        assert_eq!(buf.next().map(body), Some(vec![4]));
        assert_eq!(buf.resyncs(), 0);
    }

    #[test]
    fn implausible_length_skips_to_next_valid_header() {
        let mut stream = vec![0xFF, 0xFF, 0xFF, 0xFF, 0xEE, 0xEE, 0xEE];
        stream.extend(message(&[7, 7]));

        let mut buf = buffer(5000);
        buf.add(&stream, 0);

        assert_eq!(buf.next().map(body), Some(vec![7, 7]));
        assert_eq!(buf.resyncs(), 1);
        assert!(!buf.is_resyncing());
    }

    #[test]
    fn known_opcode_with_wrong_size_is_not_framed() {
        // FIXED records are always 6 bytes; 40 would swallow the next message
        let mut stream = 40u32.to_le_bytes().to_vec();
        stream.extend_from_slice(&FIXED.to_le_bytes());
        stream.extend_from_slice(&[0xAB; 4]);
        stream.extend(message(&[1]));
        stream.extend(message(&[2]));

        let mut buf = buffer(5000);
        buf.add(&stream, 0);

        let bodies: Vec<Vec<u8>> = std::iter::from_fn(|| buf.next()).map(body).collect();
        assert_eq!(bodies, vec![vec![1], vec![2]]);
        assert_eq!(buf.resyncs(), 1);
    }

    #[test]
    fn rejected_frame_is_rescanned_for_the_messages_it_covered() {
        // A variable-size record whose length runs over the two messages after it
        let first = message(&[1]);
        let second = message(&[2]);
        let mut stream = ((OPCODE_LEN + 2 + first.len() + second.len()) as u32).to_le_bytes().to_vec();
        stream.extend_from_slice(&KNOWN.to_le_bytes());
        stream.extend_from_slice(&[0xAB, 0xCD]);
        stream.extend(&first);
        stream.extend(&second);
        stream.extend(message(&[3]));

        let mut buf = buffer(5000);
        buf.add(&stream, 0);

        let bogus = buf.next().unwrap();
        assert_eq!(bogus.len(), OPCODE_LEN + 2 + first.len() + second.len());
        buf.reject();

        let bodies: Vec<Vec<u8>> = std::iter::from_fn(|| buf.next()).map(body).collect();
        assert_eq!(bodies, vec![vec![1], vec![2], vec![3]]);
        assert_eq!(buf.resyncs(), 1);
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn resync_waits_for_header_split_across_segments() {
        let framed = message(&[5]);
        let mut buf = buffer(5000);

        buf.add(&[0xFF, 0xFF, 0xFF, 0xFF, 0xEE], 0);
        buf.add(&framed[..3], 1);
        assert_eq!(buf.next(), None);
        assert!(buf.is_resyncing());

        buf.add(&framed[3..], 2);
        assert_eq!(buf.next().map(body), Some(vec![5]));
    }

    #[test]
    fn watchdog_discards_stalled_partial_message() {
        let framed = message(&[1, 2, 3]);
        let mut buf = buffer(500);

        buf.add(&framed[..7], 1_000);
        assert_eq!(buf.next(), None);

        // Remainder never arrives; a fresh message shows up much later
        let fresh = message(&[9]);
        buf.add(&fresh, 10_000);
        assert_eq!(buf.next().map(body), Some(vec![9]));
        assert_eq!(buf.pending(), 0);
    }
}
