//! Incremental demultiplexer for the device's mixed inbound byte stream.
//!
//! The bridge firmware interleaves newline-terminated ASCII lines with
//! binary audio frames. An audio frame starts with a 12-byte header:
//! 4-byte magic (`AUD0` little-endian), 1-byte version, 1-byte frame type,
//! 2 reserved bytes, and a 4-byte little-endian payload length. The decoder
//! tolerates arbitrary read-boundary splits and resynchronizes on the magic
//! value after garbage or a malformed header.

use tracing::warn;

/// Frame magic, `AUD0` read as a little-endian u32.
pub const AUDIO_MAGIC: u32 = 0x3044_5541;
/// Current frame header version.
pub const AUDIO_VERSION: u8 = 1;
/// Frame type carrying PCM audio.
pub const FRAME_TYPE_AUDIO: u8 = 1;
/// Fixed header length in bytes.
pub const FRAME_HEADER_LEN: usize = 12;
/// Sanity ceiling for a single frame payload.
pub const MAX_PAYLOAD_BYTES: u32 = 64 * 1024;

/// Longest ASCII line the decoder will accumulate before treating the
/// input as garbage.
const MAX_LINE_BYTES: usize = 512;

const MAGIC_BYTES: [u8; 4] = AUDIO_MAGIC.to_le_bytes();

/// One demultiplexed item from the inbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkItem {
    /// Raw PCM payload of an audio frame.
    Frame {
        /// Little-endian 16-bit mono PCM bytes.
        payload: Vec<u8>,
    },
    /// A trimmed, non-empty ASCII line.
    Line(String),
}

/// Stateful decoder for the inbound byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    framing_errors: u64,
    resyncing: bool,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of framing errors observed so far. A run of garbage counts
    /// once, however many bytes it spans.
    pub fn framing_errors(&self) -> u64 {
        self.framing_errors
    }

    /// Feed bytes into the decoder and collect every item that completes.
    pub fn extend(&mut self, bytes: &[u8]) -> Vec<LinkItem> {
        self.buf.extend_from_slice(bytes);
        let mut items = Vec::new();
        while let Some(item) = self.next_item() {
            self.resyncing = false;
            items.push(item);
        }
        items
    }

    /// Try to extract one item from the front of the buffer. Returns `None`
    /// when more bytes are needed.
    fn next_item(&mut self) -> Option<LinkItem> {
        loop {
            if self.buf.is_empty() {
                return None;
            }

            if self.magic_aligned() {
                if self.buf.len() < 4 {
                    // A prefix of the magic; wait for the rest.
                    return None;
                }
                return self.decode_frame();
            }

            // Not frame-aligned: control bytes outside a header are garbage;
            // printable bytes open a line.
            let junk = self
                .buf
                .iter()
                .take_while(|&&b| b < 0x20 && b != b'\t' && b != b'\r' && b != b'\n')
                .count();
            if junk > 0 {
                self.note_framing_error("non-printable garbage");
                self.buf.drain(..junk);
                continue;
            }

            // Any magic occurrence further in marks the end of the line data.
            let magic_pos = find_magic(&self.buf);
            if let Some(nl) = self.buf.iter().position(|&b| b == b'\n') {
                if magic_pos.is_some_and(|m| m < nl) {
                    let m = magic_pos.unwrap_or(0);
                    self.note_framing_error("garbage before frame header");
                    self.buf.drain(..m);
                    continue;
                }
                let line: Vec<u8> = self.buf.drain(..=nl).collect();
                let text = String::from_utf8_lossy(&line).trim().to_string();
                if text.is_empty() {
                    continue;
                }
                return Some(LinkItem::Line(text));
            }

            if let Some(m) = magic_pos {
                self.note_framing_error("garbage before frame header");
                self.buf.drain(..m);
                continue;
            }

            // No newline and no magic yet. Keep at most a plausible line
            // plus a possible magic prefix at the tail.
            if self.buf.len() > MAX_LINE_BYTES {
                let keep = tail_magic_prefix_len(&self.buf);
                let cut = self.buf.len() - keep;
                self.note_framing_error("unterminated garbage run");
                self.buf.drain(..cut);
            }
            return None;
        }
    }

    /// Decode a frame whose magic is already aligned at the buffer front.
    fn decode_frame(&mut self) -> Option<LinkItem> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return None;
        }
        let version = self.buf[4];
        let frame_type = self.buf[5];
        let payload_len =
            u32::from_le_bytes([self.buf[8], self.buf[9], self.buf[10], self.buf[11]]);

        if version != AUDIO_VERSION
            || frame_type != FRAME_TYPE_AUDIO
            || payload_len == 0
            || payload_len > MAX_PAYLOAD_BYTES
        {
            self.note_framing_error("malformed frame header");
            // Discard the magic and rescan so a later real header is found.
            self.buf.drain(..4);
            return self.next_item();
        }

        let total = FRAME_HEADER_LEN + payload_len as usize;
        if self.buf.len() < total {
            return None;
        }
        let payload = self.buf[FRAME_HEADER_LEN..total].to_vec();
        self.buf.drain(..total);
        Some(LinkItem::Frame { payload })
    }

    fn magic_aligned(&self) -> bool {
        let k = self.buf.len().min(4);
        self.buf[..k] == MAGIC_BYTES[..k]
    }

    fn note_framing_error(&mut self, what: &str) {
        if !self.resyncing {
            self.framing_errors += 1;
            warn!("framing error: {what}; resynchronizing");
        }
        self.resyncing = true;
    }
}

/// Position of the first full magic occurrence, if any.
fn find_magic(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    (0..=buf.len() - 4).find(|&i| buf[i..i + 4] == MAGIC_BYTES)
}

/// Length of the longest buffer suffix that is a proper prefix of the magic.
fn tail_magic_prefix_len(buf: &[u8]) -> usize {
    for k in (1..4.min(buf.len() + 1)).rev() {
        if buf[buf.len() - k..] == MAGIC_BYTES[..k] {
            return k;
        }
    }
    0
}

/// Encode an audio frame the way the firmware does. Used by loopback tests
/// and the probe tooling.
pub fn encode_audio_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&MAGIC_BYTES);
    out.push(AUDIO_VERSION);
    out.push(FRAME_TYPE_AUDIO);
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}
